//! WebSocket ↔ child-process stdio relay.
//!
//! One binding per `/run/<program>` connection. WebSocket frames feed the
//! child's stdin; stdout is forwarded line by line. Stderr is captured and
//! logged locally, not forwarded.

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::BridgeError;

/// Arguments the default debugger is started with: machine interface mode,
/// quiet banner, and no source file prompts.
pub const DEBUGGER_MI_ARGS: &[&str] = &["--interpreter=mi", "--quiet", "-ex", "set source open off"];

/// Registry of live stdio bridges, keyed by the launched program.
#[derive(Default)]
pub struct StreamProxy {
    connections: DashMap<String, CancellationToken>,
}

impl StreamProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs with an active bridge.
    pub fn programs(&self) -> Vec<String> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn remove(&self, program: &str) {
        if let Some((_, token)) = self.connections.remove(program) {
            info!("Removing connector {program}");
            token.cancel();
        }
    }

    /// Spawn `program` with piped stdio and relay until either side closes.
    /// The child is terminated on every exit path.
    pub async fn run(
        &self,
        program: &str,
        args: &[&str],
        socket: WebSocket,
    ) -> Result<(), BridgeError> {
        debug!("stream: starting {program}");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Launch {
                program: program.to_string(),
                source,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| BridgeError::Launch {
            program: program.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "stdin unavailable"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Launch {
            program: program.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "stdout unavailable"),
        })?;
        if let Some(stderr) = child.stderr.take() {
            let name = program.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(target: "renode_gateway::stream", "stderr:{name} >>> {line}");
                    }
                }
            });
        }

        let token = CancellationToken::new();
        self.connections.insert(program.to_string(), token.clone());

        let mut stdout = BufReader::new(stdout);
        let (mut ws_sink, mut ws_stream) = socket.split();
        let mut line = Vec::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,

                frame = ws_stream.next() => {
                    let data = match frame {
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => continue,
                    };
                    if data.is_empty() {
                        break;
                    }
                    trace!("WebSocket -> stdin:{program} >>> {} bytes", data.len());
                    if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }

                read = stdout.read_until(b'\n', &mut line) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let text = String::from_utf8_lossy(&line).into_owned();
                            trace!("stdout:{program} -> WebSocket >>> {text:?}");
                            line.clear();
                            if ws_sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.connections.remove(program);
        if let Err(e) = child.start_kill() {
            debug!("stream: {program} already finished: {e}");
        }
        let _ = ws_sink.close().await;
        debug!("stream: {program} bridge finished");
        Ok(())
    }
}
