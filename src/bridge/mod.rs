//! Transparent WebSocket bridges.
//!
//! A bridge is a pair of long-lived pumps moving bytes between a WebSocket
//! and another endpoint without interpreting them: a local TCP connection
//! (the emulator's telnet monitor and UART terminals) or the standard
//! streams of a debugger child process. Either side closing or failing
//! tears both down.

pub mod stream;
pub mod telnet;

pub use stream::StreamProxy;
pub use telnet::TelnetProxy;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to connect to localhost:{port}: {source}")]
    Connect {
        port: u16,
        source: std::io::Error,
    },

    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },
}
