//! WebSocket server wiring.
//!
//! Builds the axum router that multiplexes the three services over one
//! port, owns the process-wide registries (bridges, live supervisors, tasks
//! to cancel on forced exit) and runs the accept loop with graceful
//! shutdown.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::bridge::stream::DEBUGGER_MI_ARGS;
use crate::bridge::{StreamProxy, TelnetProxy};
use crate::error::{Error, Result};
use crate::supervisor::{AgentCommand, EmulatorSupervisor, TaskRegistry};

pub mod control;

/// Raised well above any sane frame size so large binary uploads fit in a
/// single message.
pub const MAX_WS_MESSAGE_SIZE: usize = 100_000_000;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Emulator binary handed to spawned agents via `PYRENODE_BIN`.
    pub renode_path: PathBuf,
    /// Workspace directory all sandboxes are rooted at.
    pub workspace: PathBuf,
    pub port: u16,
    /// Default debugger for `/run/` connections with no program named.
    pub gdb: Option<String>,
    pub gui_disabled: bool,
    pub monitor_forwarding_disabled: bool,
    pub agent: AgentCommand,
}

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub telnet: Arc<TelnetProxy>,
    pub stream: Arc<StreamProxy>,
    pub tasks: Arc<TaskRegistry>,
    supervisors: Arc<DashMap<u64, Arc<EmulatorSupervisor>>>,
    next_connection: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Arc::new(config),
            telnet: Arc::new(TelnetProxy::new()),
            stream: Arc::new(StreamProxy::new()),
            tasks: Arc::new(TaskRegistry::default()),
            supervisors: Arc::new(DashMap::new()),
            next_connection: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Track a control connection's supervisor so a forced exit can finish
    /// its emulator.
    pub fn register_supervisor(&self, supervisor: Arc<EmulatorSupervisor>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        self.supervisors.insert(id, supervisor);
        id
    }

    pub fn unregister_supervisor(&self, id: u64) {
        self.supervisors.remove(&id);
    }

    /// Forced-exit cascade: cancel registered tasks, then finalize every
    /// live emulator.
    pub async fn shutdown(&self) {
        self.tasks.abort_all();
        let live: Vec<_> = self
            .supervisors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for supervisor in live {
            supervisor.kill().await;
        }
        self.telnet.remove_all();
    }
}

/// The gateway server: one TCP port, three multiplexed WebSocket services.
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            state: AppState::new(config),
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind the configured port and serve until SIGINT or SIGTERM starts
    /// the forced-exit cascade.
    pub async fn run(self) -> Result<()> {
        tokio::fs::create_dir_all(&self.state.config.workspace).await?;
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("Failed to bind: {e}")))?;
        let shutdown = shutdown_signal()?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves (tests
    /// bind port 0 and pass a never-resolving future).
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Server listening on {addr}");
        }
        let state = self.state.clone();
        let router = self.router();

        tokio::select! {
            result = axum::serve(listener, router).into_future() => {
                result.map_err(|e| Error::Server(format!("Server error: {e}")))
            }
            _ = shutdown => {
                error!("exit requested");
                state.shutdown().await;
                Ok(())
            }
        }
    }
}

/// A future that resolves on the first SIGINT or SIGTERM. Registration
/// happens up front so a dead handler surfaces at startup, not at the
/// first signal.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())
        .map_err(|e| Error::Server(format!("Cannot listen for SIGINT: {e}")))?;
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| Error::Server(format!("Cannot listen for SIGTERM: {e}")))?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT, initiating forced exit"),
            _ = terminate.recv() => info!("Received SIGTERM, initiating forced exit"),
        }
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/proxy", get(proxy_handler))
        .route("/proxy/*cwd", get(proxy_cwd_handler))
        .route("/telnet/:port", get(telnet_handler))
        .route("/run/*program", get(run_handler))
        .fallback(bare_path_handler)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn upgrade(ws: WebSocketUpgrade) -> WebSocketUpgrade {
    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .max_frame_size(MAX_WS_MESSAGE_SIZE)
}

async fn proxy_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    info!("Connecting WebSocket /proxy");
    upgrade(ws).on_upgrade(move |socket| control::session(state, socket, None))
}

async fn proxy_cwd_handler(
    State(state): State<AppState>,
    Path(cwd): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("Connecting WebSocket /proxy/{cwd}");
    upgrade(ws).on_upgrade(move |socket| control::session(state, socket, Some(cwd)))
}

async fn telnet_handler(
    State(state): State<AppState>,
    Path(port): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("Connecting WebSocket /telnet/{port}");
    upgrade(ws).on_upgrade(move |socket| async move {
        match port.parse::<u16>() {
            Ok(port) => {
                if let Err(e) = state.telnet.run(port, socket).await {
                    error!("Connection error: {e}");
                }
            }
            Err(e) => error!("Connection error: {e}"),
        }
    })
}

async fn run_handler(
    State(state): State<AppState>,
    Path(program): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("Connecting WebSocket /run/{program}");
    upgrade(ws).on_upgrade(move |socket| stream_session(state, program, socket))
}

/// The `/proxy/` and `/run/` forms carry an empty parameter the wildcard
/// routes cannot express; everything else is an unknown path.
async fn bare_path_handler(
    State(state): State<AppState>,
    uri: Uri,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match uri.path() {
        "/proxy/" => {
            info!("Connecting WebSocket /proxy/");
            upgrade(ws).on_upgrade(move |socket| control::session(state, socket, None))
        }
        "/run/" => {
            info!("Connecting WebSocket /run/");
            upgrade(ws).on_upgrade(move |socket| stream_session(state, String::new(), socket))
        }
        other => {
            error!("No handler for path: {other}");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Resolve the program for a `/run` connection and relay its stdio. The
/// configured default debugger is started in machine-interface mode;
/// explicitly named programs are spawned bare.
async fn stream_session(state: AppState, program: String, socket: axum::extract::ws::WebSocket) {
    let (resolved, args): (String, &[&str]) = if program.is_empty() {
        match &state.config.gdb {
            Some(gdb) => (gdb.clone(), DEBUGGER_MI_ARGS),
            None => {
                error!(
                    "Can't open a debugger connection without its binary. \
                     Pass it using the -g [gdb] flag or name a valid program in the URL."
                );
                return;
            }
        }
    } else {
        (program, &[])
    };

    if let Err(e) = state.stream.run(&resolved, args, socket).await {
        error!("Connection error: {e}");
    }
}
