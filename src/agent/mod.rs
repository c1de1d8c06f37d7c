//! The emulator agent.
//!
//! Runs as a child of the gateway with NDJSON on its stdio: requests in,
//! exactly one response per request out, events interleaved as `{"evt": …}`
//! lines. Positional arguments: logging port, GUI flag, monitor-forwarding
//! flag. The emulator binary arrives through `PYRENODE_BIN`.

pub mod backend;
pub mod monitor;
pub mod registry;
pub mod sensors;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use backend::{AgentEvent, Emulation};
use monitor::RenodeBackend;

use crate::protocol::encode_line;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("usage: renode-agent <LOGGING_PORT> [GUI_ENABLED] [MONITOR_FORWARDING_DISABLED]")]
    Usage,

    #[error("PYRENODE_BIN is not set")]
    MissingBinary,

    #[error("failed to spawn the emulator: {0}")]
    Spawn(std::io::Error),

    #[error("failed to reach the emulator monitor: {0}")]
    Monitor(std::io::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Mutable agent state threaded through every command handler.
pub struct AgentState {
    pub running: bool,
    pub backend: Box<dyn Emulation>,
    monitor_forwarding_disabled: bool,
}

impl AgentState {
    pub fn new(backend: Box<dyn Emulation>, monitor_forwarding_disabled: bool) -> Self {
        Self {
            running: true,
            backend,
            monitor_forwarding_disabled,
        }
    }

    /// Run a raw monitor command. Unless forwarding is disabled, the
    /// interaction is echoed to the log so an operator following the
    /// monitor log sees protocol traffic too.
    pub async fn execute(&mut self, command: &str) -> (String, String) {
        let forward = !self.monitor_forwarding_disabled;
        if forward {
            info!(target: "renode_agent::monitor", "(protocol) {command}");
        }
        let (out, err) = self.backend.execute(command).await;
        if forward {
            if !out.is_empty() {
                info!(target: "renode_agent::monitor", "{out}");
            }
            if !err.is_empty() {
                warn!(target: "renode_agent::monitor", "{err}");
            }
        }
        (out, err)
    }

    pub async fn quit(&mut self) {
        self.backend.quit().await;
        self.running = false;
    }
}

/// Boolean flags arrive as the launcher's `true`/`false` spelling; accept
/// any case-insensitive prefix of "true".
fn parse_flag(value: &str) -> bool {
    !value.is_empty() && "true".starts_with(&value.to_lowercase())
}

/// Entry point of the `renode-agent` binary.
pub async fn run() -> Result<(), AgentError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(port_arg) = args.first() else {
        return Err(AgentError::Usage);
    };
    let logging_port: u16 = port_arg.parse().map_err(|_| AgentError::Usage)?;
    let gui_enabled = args.get(1).map(|arg| parse_flag(arg)).unwrap_or(false);
    let monitor_forwarding_disabled = args.get(2).map(|arg| parse_flag(arg)).unwrap_or(false);

    if gui_enabled {
        info!("GUI is enabled");
    }
    debug!("Starting the emulator with logs on port {logging_port}");

    let renode_path = std::env::var("PYRENODE_BIN").map_err(|_| AgentError::MissingBinary)?;
    let mut backend = RenodeBackend::start(renode_path.into(), logging_port, gui_enabled).await?;
    let events = backend
        .take_events()
        .expect("the event stream is handed out exactly once");
    let state = AgentState::new(Box::new(backend), monitor_forwarding_disabled);

    run_loop(state, events, tokio::io::stdin(), tokio::io::stdout()).await
}

/// The agent main loop: readiness handshake, then requests and events
/// multiplexed onto one NDJSON stdout.
pub async fn run_loop<R, W>(
    mut state: AgentState,
    mut events: UnboundedReceiver<AgentEvent>,
    input: R,
    mut output: W,
) -> Result<(), AgentError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    write_line(&mut output, &json!({"rsp": "ready"})).await?;

    while state.running {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&mut state, &line).await;
                write_line(&mut output, &response).await?;
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                let quitting = event == AgentEvent::Quitted;
                write_line(&mut output, &json!({"evt": event.to_wire()})).await?;
                if quitting {
                    state.running = false;
                }
            }
        }
    }
    Ok(())
}

/// Decode one request and dispatch it; never fails, the worst outcome is an
/// `{"err": …}` response.
async fn handle_line(state: &mut AgentState, line: &str) -> Value {
    match serde_json::from_str::<Value>(line) {
        Err(e) => {
            error!("Parsing error: {e}");
            json!({"err": format!("parsing error: {e}")})
        }
        Ok(Value::Object(message)) => dispatch(state, message).await,
        Ok(_) => json!({"err": "parsing error: request is not an object"}),
    }
}

async fn dispatch(state: &mut AgentState, message: Map<String, Value>) -> Value {
    let Some(command) = message.get("cmd").and_then(Value::as_str).map(str::to_string) else {
        return json!({"err": "internal error: missing required 'cmd'"});
    };
    registry::run(state, &command, &message).await
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, value: &Value) -> std::io::Result<()> {
    output.write_all(encode_line(value).as_bytes()).await?;
    output.flush().await
}
