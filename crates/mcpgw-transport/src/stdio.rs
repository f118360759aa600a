use std::collections::HashMap;
use std::time::Duration;

use mcpgw_types::GatewayError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::raw_message::RawMessage;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub(crate) struct StdioTransport {
    pub(crate) child: Child,
    pub(crate) outbound_tx: mpsc::Sender<Value>,
    pub(crate) inbound_rx: mpsc::Receiver<Result<RawMessage, GatewayError>>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    pub(crate) async fn open(
        service: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| GatewayError::Connect {
            service: service.to_string(),
            message: format!("failed to spawn `{command}`: {e}"),
            source: None,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| GatewayError::Connect {
            service: service.to_string(),
            message: "child exposed no stdout pipe".into(),
            source: None,
        })?;
        let stdin = child.stdin.take().ok_or_else(|| GatewayError::Connect {
            service: service.to_string(),
            message: "child exposed no stdin pipe".into(),
            source: None,
        })?;

        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(32);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<RawMessage, GatewayError>>(32);

        let writer_service = service.to_string();
        let writer_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(payload) = outbound_rx.recv().await {
                let mut line = match serde_json::to_vec(&payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(service = %writer_service, error = %e, "failed to serialize outgoing stdio message");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = stdin.write_all(&line).await {
                    tracing::debug!(service = %writer_service, error = %e, "stdio child stdin closed");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    tracing::debug!(service = %writer_service, error = %e, "stdio child stdin flush failed");
                    break;
                }
            }
        });

        let reader_service = service.to_string();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let parsed = serde_json::from_str::<Value>(&line);
                        let message = match parsed {
                            Ok(value) => Ok(RawMessage::new(line, value)),
                            Err(e) => Err(GatewayError::Transport {
                                service: reader_service.clone(),
                                message: format!("malformed JSON on stdio: {e}"),
                            }),
                        };
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = inbound_tx
                            .send(Err(GatewayError::Transport {
                                service: reader_service.clone(),
                                message: "stdio child closed its stdout".into(),
                            }))
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = inbound_tx
                            .send(Err(GatewayError::Transport {
                                service: reader_service.clone(),
                                message: format!("stdio read error: {e}"),
                            }))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child,
            outbound_tx,
            inbound_rx,
            tasks: vec![writer_task, reader_task],
        })
    }

    pub(crate) async fn close(mut self) {
        for task in &self.tasks {
            task.abort();
        }
        drop(self.outbound_tx);

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: pid is a currently-live child we own; SIGTERM is a
            // best-effort nudge, ignored if the process already exited.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_fails_fast_for_unknown_command() {
        let result = StdioTransport::open(
            "svc",
            "mcpgw-transport-nonexistent-binary-xyz",
            &[],
            &HashMap::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn echoes_newline_delimited_json_round_trip() {
        let script = "while IFS= read -r line; do echo \"$line\"; done";
        let mut transport =
            StdioTransport::open("svc", "sh", &["-c".into(), script.into()], &HashMap::new())
                .await
                .expect("spawn sh");

        let payload = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        transport.outbound_tx.send(payload.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), transport.inbound_rx.recv())
            .await
            .expect("no timeout")
            .expect("channel open")
            .expect("valid message");
        assert_eq!(received.value, payload);

        transport.close().await;
    }
}
