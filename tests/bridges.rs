//! Integration tests for the telnet and stream bridges.

mod common;

use common::TestServer;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// A local TCP echo endpoint standing in for an emulator terminal.
async fn echo_listener() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn telnet_bridge_relays_bytes_both_ways() {
    let server = TestServer::start().await;
    let port = echo_listener().await;

    let mut ws = server.open(&format!("/telnet/{port}")).await;
    ws.send(WsMessage::Binary(b"hello terminal".to_vec()))
        .await
        .unwrap();

    let mut received = Vec::new();
    while received.len() < b"hello terminal".len() {
        match ws.next().await.expect("frame").expect("no error") {
            WsMessage::Binary(chunk) => received.extend_from_slice(&chunk),
            WsMessage::Close(_) => panic!("bridge closed early"),
            _ => {}
        }
    }
    assert_eq!(received, b"hello terminal");
}

#[tokio::test]
async fn telnet_bridge_registers_and_unregisters() {
    let server = TestServer::start().await;
    let port = echo_listener().await;
    let mut control = server.control().await;

    let response = control.request("status", json!({"name": "telnet"})).await;
    assert_eq!(response["error"], "No telnet connections");

    let mut ws = server.open(&format!("/telnet/{port}")).await;
    // Ensure the binding is live before asking.
    ws.send(WsMessage::Binary(b"x".to_vec())).await.unwrap();
    let _ = ws.next().await;

    let response = control.request("status", json!({"name": "telnet"})).await;
    assert_eq!(response["status"], "success");
    assert_eq!(response["data"], json!([port]));

    ws.close(None).await.unwrap();
    // The binding disappears once either side closes.
    let mut attempts = 0;
    loop {
        let response = control.request("status", json!({"name": "telnet"})).await;
        if response["status"] == "failure" {
            break;
        }
        attempts += 1;
        assert!(attempts < 50, "telnet binding was never removed");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn telnet_bridge_to_closed_port_shuts_the_socket() {
    let server = TestServer::start().await;
    // Nothing listens on this port; the handler closes the WebSocket.
    let mut ws = server.open("/telnet/1").await;
    loop {
        match ws.next().await {
            None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn killing_the_emulator_drops_telnet_bridges() {
    let server = TestServer::start().await;
    let port = echo_listener().await;
    let mut control = server.control().await;

    control.request("spawn", json!({"name": "renode"})).await;
    let mut ws = server.open(&format!("/telnet/{port}")).await;
    ws.send(WsMessage::Binary(b"x".to_vec())).await.unwrap();
    let _ = ws.next().await;

    let response = control.request("status", json!({"name": "telnet"})).await;
    assert_eq!(response["status"], "success");

    let response = control.request("kill", json!({"name": "renode"})).await;
    assert_eq!(response["status"], "success");

    let response = control.request("status", json!({"name": "telnet"})).await;
    assert_eq!(response["error"], "No telnet connections");

    // The bridge's side of the socket closes too.
    loop {
        match ws.next().await {
            None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn stream_bridge_relays_child_stdio() {
    let server = TestServer::start().await;
    let mut ws = server.open("/run/cat").await;

    ws.send(WsMessage::Text("hello stream\n".to_string()))
        .await
        .unwrap();
    loop {
        match ws.next().await.expect("frame").expect("no error") {
            WsMessage::Text(text) => {
                assert_eq!(text, "hello stream\n");
                break;
            }
            WsMessage::Close(_) => panic!("bridge closed early"),
            _ => {}
        }
    }

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn stream_bridge_reports_in_status() {
    let server = TestServer::start().await;
    let mut control = server.control().await;

    let response = control.request("status", json!({"name": "run"})).await;
    assert_eq!(response["error"], "No stream connections");

    let mut ws = server.open("/run/cat").await;
    ws.send(WsMessage::Text("ping\n".to_string())).await.unwrap();
    let _ = ws.next().await;

    let response = control.request("status", json!({"name": "run"})).await;
    assert_eq!(response["status"], "success");
    assert_eq!(response["data"], json!(["cat"]));

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn run_without_program_requires_a_default_debugger() {
    let server = TestServer::start().await;
    // No -g configured: the connection is closed without relaying anything.
    let mut ws = server.open("/run/").await;
    loop {
        match ws.next().await {
            None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn unknown_paths_are_not_upgraded() {
    let server = TestServer::start().await;
    let result = tokio_tungstenite::connect_async(server.url("/nope")).await;
    assert!(result.is_err());
}
