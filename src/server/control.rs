//! Control protocol sessions.
//!
//! One session per `/proxy` WebSocket. Requests are decoded, dispatched and
//! answered strictly in arrival order; emulator events are interleaved as
//! unsolicited frames whenever the subprocess bridge yields one. Whatever
//! ends the session also kills the session's emulator.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::protocol::{is_truthy, Event, Message, Response};
use crate::sandbox::Sandbox;
use crate::server::AppState;
use crate::supervisor::{EmulatorSupervisor, SupervisorConfig};

#[derive(Debug, Error)]
#[error("{0}")]
struct ActionError(String);

impl ActionError {
    fn bad_payload() -> Self {
        Self("Bad payload".to_string())
    }
}

type ActionResult = std::result::Result<(), ActionError>;

/// Drive one control connection until the client goes away, then tear the
/// emulator down.
pub async fn session(state: AppState, socket: WebSocket, cwd: Option<String>) {
    let sandbox = match Sandbox::new(&state.config.workspace, cwd.as_deref()).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            error!("Failed to open the session sandbox: {e}");
            return;
        }
    };

    let supervisor = Arc::new(EmulatorSupervisor::new(
        supervisor_config(&state),
        state.tasks.clone(),
    ));
    let conn = state.register_supervisor(supervisor.clone());

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                debug!("WebSocket protocol request: {}", truncate(&text, 300));
                let reply = dispatch(&state, &sandbox, &supervisor, &text).await.to_json();
                debug!("WebSocket protocol respond: {}", truncate(&reply, 300));
                if sink.send(WsMessage::Text(reply)).await.is_err() {
                    break;
                }
            }

            raw_event = supervisor.next_event() => {
                let Some(fields) = raw_event.as_object().cloned() else { continue };
                let Some(event) = Event::from_child(fields) else { continue };
                if sink.send(WsMessage::Text(event.to_json())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("Running post disconnect handler");
    state.unregister_supervisor(conn);
    supervisor.kill().await;
}

fn supervisor_config(state: &AppState) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(
        state.config.renode_path.clone(),
        state.config.agent.clone(),
    );
    config.gui_disabled = state.config.gui_disabled;
    config.monitor_forwarding_disabled = state.config.monitor_forwarding_disabled;
    config
}

/// Decode one request and produce exactly one response, never an error.
async fn dispatch(
    state: &AppState,
    sandbox: &Sandbox,
    supervisor: &Arc<EmulatorSupervisor>,
    raw: &str,
) -> Response {
    let mut ret = Response::failure();

    let message = match Message::from_json(raw) {
        Ok(message) => message,
        Err(e) => {
            ret.fail(e.to_string());
            return ret;
        }
    };
    ret.id = Some(message.id);

    if let Err(e) = message.check_version() {
        ret.fail(e.to_string());
        return ret;
    }
    if message.action.is_empty() {
        return ret;
    }

    if let Err(ActionError(text)) =
        handle_action(state, sandbox, supervisor, &message, &mut ret).await
    {
        ret.fail(text);
    }
    ret
}

async fn handle_action(
    state: &AppState,
    sandbox: &Sandbox,
    supervisor: &Arc<EmulatorSupervisor>,
    message: &Message,
    ret: &mut Response,
) -> ActionResult {
    let payload = &message.payload;
    match message.action.as_str() {
        "spawn" => handle_spawn(state, sandbox, supervisor, payload, ret).await,
        "kill" => handle_kill(state, supervisor, payload, ret).await,
        "status" => handle_status(state, supervisor, payload, ret),
        "command" => handle_command(payload, ret).await,
        "exec-monitor" => handle_exec_monitor(supervisor, payload, ret).await,
        "exec-renode" => handle_exec_renode(supervisor, payload, ret).await,

        "fs/list" => {
            let args = str_args(payload, 1)?;
            match sandbox.list(&args[0]).await {
                Ok(entries) => {
                    ret.data = serde_json::to_value(entries).unwrap_or_default();
                    ret.succeed();
                }
                Err(e) => {
                    ret.fail(e.to_string());
                }
            }
            Ok(())
        }
        "fs/mkdir" => {
            let args = str_args(payload, 1)?;
            match sandbox.mkdir(&args[0]).await {
                Ok(_) => {
                    ret.succeed();
                }
                Err(e) => {
                    ret.fail(e.to_string());
                }
            }
            Ok(())
        }
        "fs/stat" => {
            let args = str_args(payload, 1)?;
            match sandbox.stat(&args[0]).await {
                Ok(stat) => {
                    let mut data = serde_json::to_value(&stat).unwrap_or_default();
                    if let Some(fields) = data.as_object_mut() {
                        fields.insert("success".to_string(), json!(true));
                    }
                    ret.data = data;
                    ret.succeed();
                }
                Err(e) => {
                    ret.data = json!({"success": false, "error": e.to_string()});
                }
            }
            Ok(())
        }
        "fs/dwnl" => {
            let args = str_args(payload, 1)?;
            match sandbox.download(&args[0]).await {
                Ok(data) => {
                    ret.data = json!(BASE64.encode(data));
                    ret.succeed();
                }
                Err(e) => {
                    ret.fail(e.to_string());
                }
            }
            Ok(())
        }
        "fs/upld" => {
            let args = str_args(payload, 1)?;
            let encoded = payload
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(ActionError::bad_payload)?;
            let data = BASE64
                .decode(encoded)
                .map_err(|e| ActionError(e.to_string()))?;
            match sandbox.upload(&args[0], &data).await {
                Ok(path) => {
                    ret.data = json!({"success": true, "path": path});
                    ret.succeed();
                }
                Err(e) => {
                    ret.data = json!({"success": false, "error": e.to_string()});
                }
            }
            Ok(())
        }
        "fs/remove" => {
            let args = str_args(payload, 1)?;
            match sandbox.remove(&args[0]).await {
                Ok(path) => {
                    ret.data = json!({"success": true, "path": path});
                    ret.succeed();
                }
                Err(e) => {
                    ret.data = json!({"success": false, "error": e.to_string()});
                }
            }
            Ok(())
        }
        "fs/move" => {
            let args = str_args(payload, 2)?;
            match sandbox.rename(&args[0], &args[1]).await {
                Ok((from, to)) => {
                    ret.data = json!({"success": true, "from": from, "to": to});
                    ret.succeed();
                }
                Err(e) => {
                    ret.data = json!({"success": false, "error": e.to_string()});
                }
            }
            Ok(())
        }
        "fs/copy" => {
            let args = str_args(payload, 2)?;
            match sandbox.copy(&args[0], &args[1]).await {
                Ok((from, to)) => {
                    ret.data = json!({"success": true, "from": from, "to": to});
                    ret.succeed();
                }
                Err(e) => {
                    ret.data = json!({"success": false, "error": e.to_string()});
                }
            }
            Ok(())
        }
        "fs/fetch" => {
            let args = str_args(payload, 1)?;
            match sandbox.fetch_from_url(&args[0]).await {
                Ok(path) => {
                    ret.data = json!({"success": true, "path": path});
                    ret.succeed();
                }
                Err(e) => {
                    ret.data = json!({"success": false, "error": e.to_string()});
                }
            }
            Ok(())
        }
        "fs/zip" => {
            let args = str_args(payload, 1)?;
            match sandbox.download_extract_zip(&args[0]).await {
                Ok(path) => {
                    ret.data = json!({"success": true, "path": path});
                    ret.succeed();
                }
                Err(e) => {
                    ret.data = json!({"success": false, "error": e.to_string()});
                }
            }
            Ok(())
        }
        "tweak/socket" => {
            let args = str_args(payload, 1)?;
            match sandbox.replace_analyzer(&args[0]).await {
                Ok(path) => {
                    ret.data = json!({"success": true, "path": path});
                    ret.succeed();
                }
                Err(e) => {
                    ret.data = json!({"success": false, "error": e.to_string()});
                }
            }
            Ok(())
        }
        "filter-events" => {
            let names = payload
                .get("args")
                .and_then(Value::as_array)
                .ok_or_else(ActionError::bad_payload)?
                .iter()
                .map(|name| name.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(ActionError::bad_payload)?;
            supervisor.filter_events(names);
            ret.succeed();
            Ok(())
        }

        other => Err(ActionError(format!("Operation {other} not supported"))),
    }
}

async fn handle_spawn(
    state: &AppState,
    sandbox: &Sandbox,
    supervisor: &Arc<EmulatorSupervisor>,
    payload: &Map<String, Value>,
    ret: &mut Response,
) -> ActionResult {
    let software = required_str(payload, "name")?;
    if software != "renode" {
        return Ok(());
    }

    let cwd = match payload.get("cwd").and_then(Value::as_str) {
        Some(path) => sandbox.resolve(path),
        None => sandbox.root().to_path_buf(),
    };
    let gui = payload.get("gui").and_then(Value::as_bool).unwrap_or(false)
        && !state.config.gui_disabled;

    debug!("Spawning new emulator instance in {}", cwd.display());
    match supervisor.spawn(gui, &cwd).await {
        Ok(pid) => {
            ret.data = json!({"pid": pid});
            ret.succeed();
        }
        Err(e) => {
            ret.fail(e.to_string());
        }
    }
    Ok(())
}

async fn handle_kill(
    state: &AppState,
    supervisor: &Arc<EmulatorSupervisor>,
    payload: &Map<String, Value>,
    ret: &mut Response,
) -> ActionResult {
    let software = required_str(payload, "name")?;
    if software != "renode" {
        return Err(ActionError(format!("Killing {software} is not supported")));
    }

    // The emulator owns every bridged TCP endpoint; drop the bridges first.
    state.telnet.remove_all();
    if supervisor.kill().await {
        ret.succeed();
    }
    Ok(())
}

fn handle_status(
    state: &AppState,
    supervisor: &Arc<EmulatorSupervisor>,
    payload: &Map<String, Value>,
    ret: &mut Response,
) -> ActionResult {
    let software = required_str(payload, "name")?;
    match software.as_str() {
        "renode" => {
            if supervisor.is_alive() {
                ret.succeed();
            } else {
                ret.error = Some("Emulator not started".to_string());
            }
        }
        "telnet" => {
            let ports = state.telnet.ports();
            if ports.is_empty() {
                ret.error = Some("No telnet connections".to_string());
            } else {
                ret.data = json!(ports);
                ret.succeed();
            }
        }
        "run" => {
            let programs = state.stream.programs();
            if programs.is_empty() {
                ret.error = Some("No stream connections".to_string());
            } else {
                ret.data = json!(programs);
                ret.succeed();
            }
        }
        other => {
            return Err(ActionError(format!(
                "Getting status for {other} is not supported"
            )));
        }
    }
    Ok(())
}

/// Run a local shell command and report its streams; success iff exit code 0.
async fn handle_command(payload: &Map<String, Value>, ret: &mut Response) -> ActionResult {
    let command_line = required_str(payload, "name")?;
    let mut parts = command_line.split_whitespace();
    let program = parts.next().ok_or_else(ActionError::bad_payload)?;
    info!("Executing {:?}", command_line.split_whitespace().collect::<Vec<_>>());

    let output = tokio::process::Command::new(program)
        .args(parts)
        .output()
        .await
        .map_err(|e| ActionError(e.to_string()))?;

    ret.data = json!({
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    });
    if output.status.success() {
        ret.succeed();
    }
    Ok(())
}

/// Run monitor commands sequentially, stopping at the first failure.
async fn handle_exec_monitor(
    supervisor: &Arc<EmulatorSupervisor>,
    payload: &Map<String, Value>,
    ret: &mut Response,
) -> ActionResult {
    let commands = payload
        .get("commands")
        .and_then(Value::as_array)
        .ok_or_else(ActionError::bad_payload)?;

    let mut data = Vec::new();
    for command in commands {
        let command = command.as_str().ok_or_else(ActionError::bad_payload)?;
        debug!("Executing monitor command: '{command}'");
        let (result, error) = supervisor.execute(command, Map::new()).await;
        match error {
            Some(error) if !is_truthy(&result) => {
                ret.data = json!(data);
                ret.fail(error);
                return Ok(());
            }
            _ => data.push(result),
        }
    }
    ret.data = json!(data);
    ret.succeed();
    Ok(())
}

/// Call into the agent's command registry.
async fn handle_exec_renode(
    supervisor: &Arc<EmulatorSupervisor>,
    payload: &Map<String, Value>,
    ret: &mut Response,
) -> ActionResult {
    let command = required_str(payload, "command")?;
    let kwargs = payload
        .get("args")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    debug!("Executing command: '{command}'");

    let (result, error) = supervisor.execute(&command, kwargs).await;
    match error {
        Some(error) if !is_truthy(&result) => {
            ret.fail(error);
        }
        _ => {
            ret.data = result;
            ret.succeed();
        }
    }
    Ok(())
}

fn required_str(payload: &Map<String, Value>, key: &str) -> Result<String, ActionError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(ActionError::bad_payload)
}

/// The `args` list shared by the filesystem actions: at least `arity`
/// string entries.
fn str_args(payload: &Map<String, Value>, arity: usize) -> Result<Vec<String>, ActionError> {
    let args = payload
        .get("args")
        .and_then(Value::as_array)
        .ok_or_else(ActionError::bad_payload)?;
    if args.len() < arity {
        return Err(ActionError::bad_payload());
    }
    args.iter()
        .map(|arg| arg.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(ActionError::bad_payload)
}

fn truncate(message: &str, length: usize) -> String {
    if message.len() > length {
        let cut: String = message.chars().take(length).collect();
        format!("{cut} [...]")
    } else {
        message.to_string()
    }
}
