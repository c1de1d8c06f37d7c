//! WebSocket ↔ local TCP relay.
//!
//! One binding per `/telnet/<port>` connection. The byte stream is not
//! interpreted; TCP reads are forwarded in chunks of up to 128 bytes.

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::BridgeError;

const READ_CHUNK: usize = 128;

/// Registry of live TCP bridges, keyed by target port.
#[derive(Default)]
pub struct TelnetProxy {
    connections: DashMap<u16, CancellationToken>,
}

impl TelnetProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports with an active bridge.
    pub fn ports(&self) -> Vec<u16> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Tear down the bridge for one port, if any.
    pub fn remove(&self, port: u16) {
        if let Some((_, token)) = self.connections.remove(&port) {
            info!("Removing Telnet:{port} proxy");
            token.cancel();
        }
    }

    /// Tear down every bridge; used when the emulator they target is killed.
    pub fn remove_all(&self) {
        let ports: Vec<u16> = self.ports();
        for port in ports {
            self.remove(port);
        }
    }

    /// Relay between the WebSocket and `localhost:<port>` until either side
    /// closes or errors. Owns the binding for its whole lifetime.
    pub async fn run(&self, port: u16, socket: WebSocket) -> Result<(), BridgeError> {
        let tcp = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|source| BridgeError::Connect { port, source })?;
        let token = CancellationToken::new();
        self.connections.insert(port, token.clone());

        let (mut tcp_read, mut tcp_write) = tcp.into_split();
        let (mut ws_sink, mut ws_stream) = socket.split();
        let mut buf = [0u8; READ_CHUNK];

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
                    trace!("WebSocket -> Telnet:{port} >>> {} bytes", data.len());
                    if tcp_write.write_all(&data).await.is_err() {
                        break;
                    }
                }

                read = tcp_read.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            trace!("Telnet:{port} -> WebSocket >>> {n} bytes");
                            if ws_sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.connections.remove(&port);
        let _ = ws_sink.close().await;
        debug!("Telnet:{port} bridge finished");
        Ok(())
    }
}
