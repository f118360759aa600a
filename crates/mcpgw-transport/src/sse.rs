use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use mcpgw_types::GatewayError;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::raw_message::RawMessage;

/// Substring ModelScope's SSE endpoint uses in a 401 body to signal that the
/// session must be re-established before the call can be retried (spec.md §4.1).
const MODELSCOPE_SESSION_EXPIRED_MARKER: &str = "SessionExpired";

pub(crate) struct SseTransport {
    pub(crate) outbound_tx: mpsc::Sender<Value>,
    pub(crate) inbound_rx: mpsc::Receiver<Result<RawMessage, GatewayError>>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl SseTransport {
    pub(crate) async fn open(
        service: &str,
        url: &str,
        api_key: Option<&str>,
        headers: &HashMap<String, String>,
        modelscope: bool,
    ) -> Result<Self, GatewayError> {
        let client = Client::new();
        let mut builder = client.get(url);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }
        for (k, v) in headers {
            builder = builder.header(k.as_str(), v.as_str());
        }

        let event_source = EventSource::new(builder).map_err(|e| GatewayError::Connect {
            service: service.to_string(),
            message: format!("failed to build SSE request: {e}"),
            source: None,
        })?;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(32);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<RawMessage, GatewayError>>(32);

        let post_url = Arc::new(RwLock::new(url.to_string()));
        let base_url = url.to_string();

        let reader_service = service.to_string();
        let reader_post_url = post_url.clone();
        let reader_task = tokio::spawn(async move {
            let mut event_source = event_source;
            loop {
                match event_source.next().await {
                    Some(Ok(Event::Open)) => {
                        tracing::debug!(service = %reader_service, "SSE stream opened");
                    }
                    Some(Ok(Event::Message(message))) => {
                        if message.event == "endpoint" {
                            if let Ok(resolved) = url::Url::parse(&base_url)
                                .and_then(|base| base.join(&message.data))
                            {
                                *reader_post_url.write().await = resolved.to_string();
                            }
                            continue;
                        }
                        match serde_json::from_str::<Value>(&message.data) {
                            Ok(value) => {
                                let raw = RawMessage::new(message.data, value);
                                if inbound_tx.send(Ok(raw)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = inbound_tx
                                    .send(Err(GatewayError::Transport {
                                        service: reader_service.clone(),
                                        message: format!("malformed JSON on SSE stream: {e}"),
                                    }))
                                    .await;
                            }
                        }
                    }
                    Some(Err(error)) => {
                        let mapped = map_sse_error(&reader_service, error, modelscope).await;
                        let _ = inbound_tx.send(Err(mapped)).await;
                        break;
                    }
                    None => break,
                }
            }
        });

        let writer_service = service.to_string();
        let writer_client = client.clone();
        let writer_post_url = post_url;
        let writer_api_key = api_key.map(str::to_string);
        let writer_headers = headers.clone();
        let writer_inbound_tx = inbound_tx.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(payload) = outbound_rx.recv().await {
                let url = writer_post_url.read().await.clone();
                let mut request = writer_client.post(&url).json(&payload);
                if let Some(key) = &writer_api_key {
                    request = request.bearer_auth(key);
                }
                for (k, v) in &writer_headers {
                    request = request.header(k.as_str(), v.as_str());
                }
                match request.send().await {
                    Ok(response) if response.status().as_u16() == 401 => {
                        let body = response.text().await.unwrap_or_default();
                        let error = classify_post_401(&writer_service, &body, modelscope);
                        let _ = writer_inbound_tx.send(Err(error)).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(service = %writer_service, error = %e, "SSE POST failed");
                    }
                }
            }
        });

        Ok(Self {
            outbound_tx,
            inbound_rx,
            tasks: vec![reader_task, writer_task],
        })
    }

    pub(crate) fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn map_sse_error(
    service: &str,
    error: reqwest_eventsource::Error,
    modelscope: bool,
) -> GatewayError {
    if let reqwest_eventsource::Error::InvalidStatusCode(status, response) = error {
        if status.as_u16() == 401 {
            let body = response.text().await.unwrap_or_default();
            return classify_post_401(service, &body, modelscope);
        }
        return GatewayError::Transport {
            service: service.to_string(),
            message: format!("SSE stream returned HTTP {status}"),
        };
    }
    GatewayError::Transport {
        service: service.to_string(),
        message: format!("SSE stream error: {error}"),
    }
}

/// Classifies a 401 response body on either the GET stream or a POST reply.
/// Per spec.md §4.1, a `modelscope-sse` service MUST treat a body carrying
/// `Code:"SessionExpired"` or the substring "session ... is expired" as
/// `SessionExpired` rather than a plain `Authentication` failure.
fn classify_post_401(service: &str, body: &str, modelscope: bool) -> GatewayError {
    if modelscope && looks_like_session_expired(body) {
        return GatewayError::SessionExpired {
            service: service.to_string(),
        };
    }
    GatewayError::Authentication {
        service: service.to_string(),
    }
}

fn looks_like_session_expired(body: &str) -> bool {
    if body.contains(MODELSCOPE_SESSION_EXPIRED_MARKER) {
        return true;
    }
    let lower = body.to_ascii_lowercase();
    lower.contains("session") && lower.contains("expired")
}
