use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcpgw_transport::Transport;
use mcpgw_types::GatewayError;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::message::{self, Inbound, RemoteFailure};

type PendingMap = Arc<Mutex<HashMap<Value, oneshot::Sender<Result<Value, RemoteFailure>>>>>;

/// Something the peer sent us that isn't a response to one of our own
/// requests: an inbound request (we're being asked to act as a JSON-RPC
/// server, as `ProxyMCPServer` does), a notification, or a malformed
/// envelope, plus the terminal "this session is done" signal.
#[derive(Debug)]
pub enum SessionEvent {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Valid JSON but not a well-formed JSON-RPC 2.0 envelope; the spec's
    /// -32700 parse-error case when this session is acting as a server.
    ParseError {
        raw: String,
        detail: String,
    },
    Closed {
        cause: Option<GatewayError>,
    },
}

/// A JSON-RPC 2.0 conversation layered over a [`Transport`].
///
/// Request ids are assigned monotonically starting at 1 for calls this side
/// initiates; ids on messages the *peer* sends (inbound requests) are
/// preserved verbatim when replying, including `0`, `""`, and `null`.
pub struct JsonRpcSession {
    service: String,
    outbound: mcpgw_transport::OutboundHandle,
    next_id: AtomicU64,
    pending: PendingMap,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<SessionEvent>>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl JsonRpcSession {
    pub fn new(service: impl Into<String>, transport: Transport) -> Self {
        let service = service.into();
        let outbound = transport.outbound();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(32);

        tokio::spawn(Self::drive(
            service.clone(),
            transport,
            pending.clone(),
            events_tx,
            closed.clone(),
            cancel.clone(),
        ));

        Self {
            service,
            outbound,
            next_id: AtomicU64::new(1),
            pending,
            events_rx: tokio::sync::Mutex::new(events_rx),
            closed,
            cancel,
        }
    }

    /// Issues a request and awaits its correlated response, bounded by
    /// `timeout`.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, GatewayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Transport {
                service: self.service.clone(),
                message: "session is closed".into(),
            });
        }

        let id = Value::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        let request = message::build_request(id.clone(), method, params);
        if let Err(e) = self.outbound.send(request).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(failure))) if failure.cancelled => Err(GatewayError::Cancelled),
            Ok(Ok(Err(failure))) => Err(GatewayError::RemoteError {
                service: self.service.clone(),
                code: failure.code,
                message: failure.message,
                data: failure.data,
            }),
            Ok(Err(_)) => Err(GatewayError::Transport {
                service: self.service.clone(),
                message: "session closed while awaiting response".into(),
            }),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(GatewayError::Timeout {
                    service: self.service.clone(),
                    operation: method.to_string(),
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), GatewayError> {
        self.outbound.send(message::build_notification(method, params)).await
    }

    /// Replies to an inbound request (this session acting as a server),
    /// preserving `id` exactly as received.
    pub async fn respond_ok(&self, id: Value, result: Value) -> Result<(), GatewayError> {
        self.outbound.send(message::build_result_response(id, result)).await
    }

    pub async fn respond_err(
        &self,
        id: Value,
        code: i64,
        message: String,
        data: Option<Value>,
    ) -> Result<(), GatewayError> {
        self.outbound
            .send(message::build_error_response(id, code, message, data))
            .await
    }

    /// Awaits the next request/notification/parse-error/closed event.
    /// Returns `None` only if the event channel itself was dropped, which
    /// shouldn't outlive a `Closed` event having already been delivered.
    pub async fn next_event(&self) -> Option<SessionEvent> {
        self.events_rx.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancels the reader task (which closes the underlying transport) and
    /// completes every pending call with `Cancelled`. Doesn't consume
    /// `self`: sessions are typically held behind an `Arc` by the actor that
    /// owns them, alongside other callers still holding a reference.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn drive(
        service: String,
        mut transport: Transport,
        pending: PendingMap,
        events_tx: mpsc::Sender<SessionEvent>,
        closed: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        let cause = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break None;
                }
                message = transport.recv() => {
                    match message {
                        Some(Ok(raw)) => {
                            Self::dispatch(&service, raw, &pending, &events_tx).await;
                        }
                        Some(Err(error)) => break Some(error),
                        None => break None,
                    }
                }
            }
        };

        transport.close().await;
        closed.store(true, Ordering::Release);

        // A pending call that's still outstanding when the session tears down
        // completes with the actual cause (e.g. SessionExpired) rather than a
        // blanket Cancelled, so callers above this layer (MCPService's
        // session-expiry retry, §4.3) can still pattern-match on it. A clean
        // shutdown/cancel with no such cause (spec.md §4.2/§5: "every pending
        // waiter is completed with Cancelled") is marked so `call()` maps it
        // to `GatewayError::Cancelled` rather than a recoverable `RemoteError`.
        let drain_failure = match &cause {
            Some(error) => RemoteFailure {
                code: error.jsonrpc_code(),
                message: error.to_string(),
                data: None,
                cancelled: false,
            },
            None => RemoteFailure {
                code: GatewayError::Cancelled.jsonrpc_code(),
                message: "session closed before a response arrived".into(),
                data: None,
                cancelled: true,
            },
        };
        for (_, waiter) in pending.lock().unwrap().drain() {
            let _ = waiter.send(Err(drain_failure.clone()));
        }

        let _ = events_tx.send(SessionEvent::Closed { cause }).await;
    }

    async fn dispatch(
        service: &str,
        raw: mcpgw_transport::RawMessage,
        pending: &PendingMap,
        events_tx: &mpsc::Sender<SessionEvent>,
    ) {
        match message::classify(&raw) {
            Inbound::Response { id, outcome } => {
                let waiter = pending.lock().unwrap().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => {
                        tracing::debug!(service = %service, id = %id, "response for unknown or already-resolved request id");
                    }
                }
            }
            Inbound::Request { id, method, params } => {
                let _ = events_tx.send(SessionEvent::Request { id, method, params }).await;
            }
            Inbound::Notification { method, params } => {
                let _ = events_tx.send(SessionEvent::Notification { method, params }).await;
            }
            Inbound::Invalid { raw, detail } => {
                let _ = events_tx.send(SessionEvent::ParseError { raw, detail }).await;
            }
        }
    }
}
