use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mcpgw_types::{GatewayError, WebsocketMode};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};

use crate::raw_message::RawMessage;

/// Ping cadence while connected (spec.md §4.4: 30s heartbeat).
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Silence beyond this is treated as connection loss (spec.md §4.4: 60s).
const HEARTBEAT_SILENCE_LIMIT: Duration = Duration::from_secs(60);

pub(crate) struct WebsocketTransport {
    pub(crate) outbound_tx: mpsc::Sender<Value>,
    pub(crate) inbound_rx: mpsc::Receiver<Result<RawMessage, GatewayError>>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl WebsocketTransport {
    pub(crate) async fn open(
        service: &str,
        url: &str,
        mode: WebsocketMode,
    ) -> Result<Self, GatewayError> {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Value>(32);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<RawMessage, GatewayError>>(32);

        let tasks = match mode {
            WebsocketMode::Client => {
                let (stream, _response) =
                    connect_async(url)
                        .await
                        .map_err(|e| GatewayError::Connect {
                            service: service.to_string(),
                            message: format!("websocket connect failed: {e}"),
                            source: None,
                        })?;
                spawn_driver(service.to_string(), stream, outbound_rx, inbound_tx)
            }
            WebsocketMode::Server => {
                let parsed = url::Url::parse(url).map_err(|e| GatewayError::Config {
                    service: service.to_string(),
                    message: format!("invalid websocket listen url: {e}"),
                })?;
                let host = parsed.host_str().ok_or_else(|| GatewayError::Config {
                    service: service.to_string(),
                    message: "websocket server mode requires a host".into(),
                })?;
                let port = parsed.port().ok_or_else(|| GatewayError::Config {
                    service: service.to_string(),
                    message: "websocket server mode requires a port".into(),
                })?;

                let listener =
                    TcpListener::bind((host, port))
                        .await
                        .map_err(|e| GatewayError::Connect {
                            service: service.to_string(),
                            message: format!("failed to bind websocket listener: {e}"),
                            source: None,
                        })?;
                let (tcp, peer) = listener.accept().await.map_err(|e| GatewayError::Connect {
                    service: service.to_string(),
                    message: format!("failed to accept websocket connection: {e}"),
                    source: None,
                })?;
                tracing::info!(service = %service, peer = %peer, "accepted websocket connection");
                let stream = tokio_tungstenite::accept_async(tcp)
                    .await
                    .map_err(|e| GatewayError::Handshake {
                        service: service.to_string(),
                        message: format!("websocket handshake failed: {e}"),
                    })?;
                spawn_driver(service.to_string(), stream, outbound_rx, inbound_tx)
            }
        };

        Ok(Self {
            outbound_tx,
            inbound_rx,
            tasks,
        })
    }

    pub(crate) fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_driver<S>(
    service: String,
    stream: WebSocketStream<S>,
    mut outbound_rx: mpsc::Receiver<Value>,
    inbound_tx: mpsc::Sender<Result<RawMessage, GatewayError>>,
) -> Vec<JoinHandle<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = stream.split();

    let reader_service = service.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match tokio::time::timeout(HEARTBEAT_SILENCE_LIMIT, read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    let text = text.to_string();
                    match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if inbound_tx.send(Ok(RawMessage::new(text, value))).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = inbound_tx
                                .send(Err(GatewayError::Transport {
                                    service: reader_service.clone(),
                                    message: format!("malformed JSON on websocket: {e}"),
                                }))
                                .await;
                        }
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) => {
                    let _ = inbound_tx
                        .send(Err(GatewayError::Transport {
                            service: reader_service.clone(),
                            message: "websocket closed by peer".into(),
                        }))
                        .await;
                    break;
                }
                Ok(Some(Ok(_))) => {
                    // Ping/Pong/Binary frames don't carry JSON-RPC payloads.
                }
                Ok(Some(Err(e))) => {
                    let _ = inbound_tx
                        .send(Err(GatewayError::Transport {
                            service: reader_service.clone(),
                            message: format!("websocket read error: {e}"),
                        }))
                        .await;
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    let _ = inbound_tx
                        .send(Err(GatewayError::Timeout {
                            service: reader_service.clone(),
                            operation: "heartbeat".into(),
                            elapsed_ms: HEARTBEAT_SILENCE_LIMIT.as_millis() as u64,
                        }))
                        .await;
                    break;
                }
            }
        }
    });

    let writer_service = service;
    let writer_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick is immediate; consume it
        loop {
            tokio::select! {
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            let text = match serde_json::to_string(&payload) {
                                Ok(t) => t,
                                Err(e) => {
                                    tracing::warn!(service = %writer_service, error = %e, "failed to serialize outgoing websocket message");
                                    continue;
                                }
                            };
                            if write.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    vec![reader_task, writer_task]
}
