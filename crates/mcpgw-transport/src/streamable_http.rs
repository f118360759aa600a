use std::collections::HashMap;

use mcpgw_types::GatewayError;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::raw_message::RawMessage;

/// One send() issues a POST and the (possibly chunked) response body is
/// parsed back into zero or more JSON-RPC messages, per spec.md §4.1's
/// streamable-HTTP contract.
pub(crate) struct HttpTransport {
    pub(crate) outbound_tx: mpsc::Sender<Value>,
    pub(crate) inbound_rx: mpsc::Receiver<Result<RawMessage, GatewayError>>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl HttpTransport {
    pub(crate) async fn open(
        service: &str,
        url: &str,
        api_key: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let client = Client::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(32);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<RawMessage, GatewayError>>(32);

        let service_owned = service.to_string();
        let url_owned = url.to_string();
        let api_key_owned = api_key.map(str::to_string);
        let headers_owned = headers.clone();

        let task = tokio::spawn(async move {
            while let Some(payload) = outbound_rx.recv().await {
                let mut request = client.post(&url_owned).json(&payload);
                if let Some(key) = &api_key_owned {
                    request = request.bearer_auth(key);
                }
                for (k, v) in &headers_owned {
                    request = request.header(k.as_str(), v.as_str());
                }

                match request.send().await {
                    Ok(response) => {
                        let status = response.status();
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        if !status.is_success() {
                            let body = response.text().await.unwrap_or_default();
                            let _ = inbound_tx
                                .send(Err(GatewayError::Transport {
                                    service: service_owned.clone(),
                                    message: format!("HTTP {status}: {body}"),
                                }))
                                .await;
                            continue;
                        }
                        match response.text().await {
                            Ok(body) => {
                                for message in
                                    parse_streamable_body(&service_owned, &content_type, &body)
                                {
                                    if inbound_tx.send(message).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = inbound_tx
                                    .send(Err(GatewayError::Transport {
                                        service: service_owned.clone(),
                                        message: format!("failed to read response body: {e}"),
                                    }))
                                    .await;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = inbound_tx
                            .send(Err(GatewayError::Transport {
                                service: service_owned.clone(),
                                message: format!("HTTP request failed: {e}"),
                            }))
                            .await;
                    }
                }
            }
        });

        Ok(Self {
            outbound_tx,
            inbound_rx,
            tasks: vec![task],
        })
    }

    pub(crate) fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Accepts either a single JSON object, newline-delimited JSON, or an
/// `text/event-stream` body of `data:` lines, and yields each parsed message.
fn parse_streamable_body(
    service: &str,
    content_type: &str,
    body: &str,
) -> Vec<Result<RawMessage, GatewayError>> {
    let mut out = Vec::new();

    if content_type.contains("text/event-stream") {
        for line in body.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            out.push(parse_one(service, data));
        }
        return out;
    }

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push(parse_one(service, line));
    }

    if out.is_empty() && !body.trim().is_empty() {
        out.push(parse_one(service, body.trim()));
    }

    out
}

fn parse_one(service: &str, text: &str) -> Result<RawMessage, GatewayError> {
    serde_json::from_str::<Value>(text)
        .map(|value| RawMessage::new(text.to_string(), value))
        .map_err(|e| GatewayError::Transport {
            service: service.to_string(),
            message: format!("malformed JSON in response body: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_json_object_body() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let messages = parse_streamable_body("svc", "application/json", body);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_ok());
    }

    #[test]
    fn parses_event_stream_data_lines() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n\n";
        let messages = parse_streamable_body("svc", "text/event-stream", body);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.is_ok()));
    }

    #[test]
    fn malformed_json_surfaces_as_transport_error() {
        let messages = parse_streamable_body("svc", "application/json", "not json");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_err());
    }
}
