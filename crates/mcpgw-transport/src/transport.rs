use std::time::Duration;

use mcpgw_types::{GatewayError, TransportConfig};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::raw_message::RawMessage;
use crate::sse::SseTransport;
use crate::stdio::StdioTransport;
use crate::streamable_http::HttpTransport;
use crate::websocket::WebsocketTransport;

/// A live, connected wire-level session with one upstream MCP server.
///
/// Every variant exposes the same `send`/`recv`/`close` surface regardless
/// of which of the four wire protocols backs it; callers above this layer
/// (the JSON-RPC session) never need to know which one they're holding.
pub struct Transport {
    service: String,
    inner: TransportInner,
}

enum TransportInner {
    Stdio(StdioTransport),
    Sse(SseTransport),
    StreamableHttp(HttpTransport),
    Websocket(WebsocketTransport),
}

impl Transport {
    /// Opens a transport for `config`, bounded by `deadline` and cancellable
    /// via `cancel`. Misconfiguration (e.g. an empty stdio command) fails
    /// synchronously, before any I/O is attempted.
    pub async fn open(
        service: &str,
        config: &TransportConfig,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|message| GatewayError::Config {
                service: service.to_string(),
                message,
            })?;

        let connect = async {
            match config {
                TransportConfig::Stdio { command, args, env } => {
                    StdioTransport::open(service, command, args, env)
                        .await
                        .map(TransportInner::Stdio)
                }
                TransportConfig::Sse {
                    url,
                    api_key,
                    headers,
                    modelscope,
                } => SseTransport::open(service, url, api_key.as_deref(), headers, *modelscope)
                    .await
                    .map(TransportInner::Sse),
                TransportConfig::StreamableHttp {
                    url,
                    api_key,
                    headers,
                } => HttpTransport::open(service, url, api_key.as_deref(), headers)
                    .await
                    .map(TransportInner::StreamableHttp),
                TransportConfig::Websocket { url, mode, .. } => {
                    WebsocketTransport::open(service, url, *mode)
                        .await
                        .map(TransportInner::Websocket)
                }
            }
        };

        let inner = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            outcome = tokio::time::timeout(deadline, connect) => match outcome {
                Ok(result) => result?,
                Err(_) => {
                    return Err(GatewayError::Timeout {
                        service: service.to_string(),
                        operation: "transport open".into(),
                        elapsed_ms: deadline.as_millis() as u64,
                    })
                }
            },
        };

        Ok(Self {
            service: service.to_string(),
            inner,
        })
    }

    pub async fn send(&self, payload: Value) -> Result<(), GatewayError> {
        let result = match &self.inner {
            TransportInner::Stdio(t) => t.outbound_tx.send(payload).await,
            TransportInner::Sse(t) => t.outbound_tx.send(payload).await,
            TransportInner::StreamableHttp(t) => t.outbound_tx.send(payload).await,
            TransportInner::Websocket(t) => t.outbound_tx.send(payload).await,
        };
        result.map_err(|_| GatewayError::Transport {
            service: self.service.clone(),
            message: "transport writer task has stopped".into(),
        })
    }

    /// A cheap, cloneable handle for sending without holding the whole
    /// transport. The JSON-RPC session layer keeps one of these so its
    /// reader task can own the `Transport` itself (needed for `close()`)
    /// while callers of `call()`/`notify()` can still send concurrently.
    pub fn outbound(&self) -> OutboundHandle {
        let tx = match &self.inner {
            TransportInner::Stdio(t) => t.outbound_tx.clone(),
            TransportInner::Sse(t) => t.outbound_tx.clone(),
            TransportInner::StreamableHttp(t) => t.outbound_tx.clone(),
            TransportInner::Websocket(t) => t.outbound_tx.clone(),
        };
        OutboundHandle {
            service: self.service.clone(),
            tx,
        }
    }

    /// Awaits the next inbound message. Resolves to `None` once the
    /// transport has been fully torn down and will never produce more.
    pub async fn recv(&mut self) -> Option<Result<RawMessage, GatewayError>> {
        match &mut self.inner {
            TransportInner::Stdio(t) => t.inbound_rx.recv().await,
            TransportInner::Sse(t) => t.inbound_rx.recv().await,
            TransportInner::StreamableHttp(t) => t.inbound_rx.recv().await,
            TransportInner::Websocket(t) => t.inbound_rx.recv().await,
        }
    }

    pub async fn close(self) {
        match self.inner {
            TransportInner::Stdio(t) => t.close().await,
            TransportInner::Sse(t) => t.close(),
            TransportInner::StreamableHttp(t) => t.close(),
            TransportInner::Websocket(t) => t.close(),
        }
    }
}

#[derive(Clone)]
pub struct OutboundHandle {
    service: String,
    tx: mpsc::Sender<Value>,
}

impl OutboundHandle {
    pub async fn send(&self, payload: Value) -> Result<(), GatewayError> {
        self.tx.send(payload).await.map_err(|_| GatewayError::Transport {
            service: self.service.clone(),
            message: "transport writer task has stopped".into(),
        })
    }
}
