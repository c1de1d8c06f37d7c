//! Common test utilities for integration tests

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use renode_gateway::protocol::PROTOCOL_VERSION;
use renode_gateway::server::{GatewayConfig, GatewayServer};
use renode_gateway::supervisor::AgentCommand;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Stand-in emulator agent: handshakes, answers every request, quits on
/// demand.
pub const FAKE_AGENT: &str = r#"
echo '{"rsp":"ready"}'
while read line; do
  case "$line" in
    *quit*) echo '{"rsp":"closing"}'; exit 0 ;;
    *) echo '{"out":["ok",""]}' ;;
  esac
done
"#;

/// A gateway bound to an ephemeral port, backed by a temporary workspace
/// and the fake shell agent.
pub struct TestServer {
    pub addr: SocketAddr,
    pub workspace: tempfile::TempDir,
    task: JoinHandle<renode_gateway::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_gdb(None).await
    }

    pub async fn start_with_gdb(gdb: Option<String>) -> Self {
        let workspace = tempfile::tempdir().expect("temp workspace");
        let config = GatewayConfig {
            renode_path: PathBuf::from("/bin/true"),
            workspace: workspace.path().to_path_buf(),
            port: 0,
            gdb,
            gui_disabled: true,
            monitor_forwarding_disabled: false,
            agent: AgentCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), FAKE_AGENT.to_string(), "fake-agent".to_string()],
            },
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        // The harness never signals shutdown; the server dies with the
        // test runtime.
        let task = tokio::spawn(
            GatewayServer::new(config).serve(listener, std::future::pending::<()>()),
        );

        Self {
            addr,
            workspace,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Open a raw WebSocket to any of the routed paths.
    pub async fn open(&self, path: &str) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
        let (ws, _) = connect_async(self.url(path)).await.expect("connect");
        ws
    }

    pub async fn control(&self) -> ControlClient {
        ControlClient {
            ws: self.open("/proxy").await,
            next_id: 1,
        }
    }
}

/// Typed client for the control protocol: sends numbered requests and
/// collects the matching responses, surfacing events separately.
pub struct ControlClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: i64,
}

impl ControlClient {
    pub fn from_socket(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self { ws, next_id: 1 }
    }

    /// Send one request and await its response, skipping any event frames
    /// that arrive in between.
    pub async fn request(&mut self, action: &str, payload: Value) -> Value {
        let id = self.send(action, payload).await;
        loop {
            let frame = self.next_json().await.expect("response frame");
            if frame.get("event").is_some() {
                continue;
            }
            assert_eq!(frame["id"], json!(id), "response answers the request");
            return frame;
        }
    }

    /// Fire a request without waiting; returns the id used.
    pub async fn send(&mut self, action: &str, payload: Value) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        let raw = json!({
            "version": PROTOCOL_VERSION,
            "action": action,
            "id": id,
            "payload": payload,
        });
        self.send_raw(&raw.to_string()).await;
        id
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.ws
            .send(WsMessage::Text(raw.to_string()))
            .await
            .expect("send frame");
    }

    /// Next text frame decoded as JSON, or `None` when the server closed.
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            match self.ws.next().await? {
                Ok(WsMessage::Text(text)) => {
                    return Some(serde_json::from_str(&text).expect("frame is JSON"))
                }
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
