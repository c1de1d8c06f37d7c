//! renode-agent - the in-child emulator agent.
//!
//! Spawned by renode-gateway with NDJSON on stdio. Logs go to stderr;
//! stdout carries only protocol lines.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    renode_gateway::agent::run().await?;
    Ok(())
}
