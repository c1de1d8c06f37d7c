//! renode-gateway - WebSocket control plane for a remote Renode instance.
//!
//! One listening port multiplexes the control protocol, transparent
//! bridges to the emulator's telnet endpoints, and a bridge to a debugger's
//! standard streams.

use clap::Parser;
use renode_gateway::error::Error;
use renode_gateway::protocol::PROTOCOL_VERSION;
use renode_gateway::server::GatewayConfig;
use renode_gateway::supervisor::AgentCommand;
use renode_gateway::{GatewayServer, Result};
use std::path::PathBuf;
use tracing::info;

const PREDEFINED_DEBUGGERS: &[&str] = &["gdb-multiarch", "gdb"];

fn version_str() -> &'static str {
    Box::leak(
        format!(
            "renode-gateway={} protocol={}",
            env!("CARGO_PKG_VERSION"),
            PROTOCOL_VERSION
        )
        .into_boxed_str(),
    )
}

#[derive(Parser)]
#[command(name = "renode-gateway")]
#[command(about = "WebSocket based server for managing a remote Renode instance")]
#[command(version = version_str(), disable_version_flag = true)]
struct Cli {
    /// Path to the Renode portable binary
    #[arg(value_name = "RENODE_BINARY", value_parser = valid_program)]
    renode_binary: PathBuf,

    /// Directory used as the Renode workspace
    #[arg(value_name = "WORKSPACE_DIR")]
    workspace: PathBuf,

    /// Path to the gdb binary used for /run connections; an empty value
    /// auto-detects one of the predefined debuggers
    #[arg(
        short = 'g',
        long = "gdb",
        num_args = 0..=1,
        default_missing_value = "",
        value_name = "PATH"
    )]
    gdb: Option<String>,

    /// WebSocket server port
    #[arg(short = 'p', long, default_value_t = 21234)]
    port: u16,

    /// Turn off the Renode GUI
    #[arg(long)]
    disable_renode_gui: bool,

    #[arg(long, conflicts_with = "disable_renode_gui", hide_short_help = true)]
    no_disable_renode_gui: bool,

    /// Turn off writing protocol based Monitor interactions to the Monitor log
    #[arg(long)]
    disable_proxy_monitor_forwarding: bool,

    #[arg(long, conflicts_with = "disable_proxy_monitor_forwarding", hide_short_help = true)]
    no_disable_proxy_monitor_forwarding: bool,

    /// Display renode-gateway and data protocol version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RENODE_GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Accept a path or a `$PATH` name as long as it resolves to an executable.
fn valid_program(raw: &str) -> std::result::Result<PathBuf, String> {
    which::which(raw).map_err(|_| format!("{raw} is not a file or cannot be executed"))
}

/// The `1|true|yes` convention for boolean environment switches.
fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name),
        Ok(value) if ["1", "true", "yes"].contains(&value.to_lowercase().as_str())
    )
}

/// A `--flag` / `--no-flag` pair with an environment default.
fn resolve_flag(yes: bool, no: bool, env_name: &str) -> bool {
    if yes {
        true
    } else if no {
        false
    } else {
        env_flag(env_name)
    }
}

/// Three cases: flag absent (no default debugger), flag without a value
/// (auto-detect), flag with a path (validate it).
fn resolve_gdb(arg: Option<String>) -> Result<Option<String>> {
    match arg {
        None => Ok(None),
        Some(path) if !path.is_empty() => {
            let resolved = valid_program(&path).map_err(Error::Config)?;
            Ok(Some(resolved.to_string_lossy().into_owned()))
        }
        Some(_) => {
            for candidate in PREDEFINED_DEBUGGERS {
                if which::which(candidate).is_ok() {
                    return Ok(Some(candidate.to_string()));
                }
            }
            Err(Error::Config(format!(
                "Could not detect any gdb from {PREDEFINED_DEBUGGERS:?} in PATH. \
                 Try passing a custom path with the '-g' flag."
            )))
        }
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    info!("Running {}", version_str());

    if cli.workspace.exists() && !cli.workspace.is_dir() {
        return Err(Error::Config(format!(
            "{} is not a directory",
            cli.workspace.display()
        )));
    }

    let gdb = resolve_gdb(cli.gdb)?;
    let gui_disabled = resolve_flag(
        cli.disable_renode_gui,
        cli.no_disable_renode_gui,
        "RENODE_PROXY_GUI_DISABLED",
    );
    let monitor_forwarding_disabled = resolve_flag(
        cli.disable_proxy_monitor_forwarding,
        cli.no_disable_proxy_monitor_forwarding,
        "RENODE_PROXY_MONITOR_FORWARDING_DISABLED",
    );

    if gui_disabled {
        info!("RENODE_PROXY_GUI_DISABLED is set, Renode cannot be run with GUI");
    }
    if monitor_forwarding_disabled {
        info!(
            "RENODE_PROXY_MONITOR_FORWARDING_DISABLED is set, Renode won't write \
             protocol based Monitor interactions to the Monitor log"
        );
    }

    let agent = AgentCommand::discover().map_err(|e| Error::Config(e.to_string()))?;

    let server = GatewayServer::new(GatewayConfig {
        renode_path: cli.renode_binary,
        workspace: cli.workspace,
        port: cli.port,
        gdb,
        gui_disabled,
        monitor_forwarding_disabled,
        agent,
    });

    server.run().await?;

    info!("Server stopped");
    Ok(())
}
