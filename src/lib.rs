//! Renode Gateway Library
//!
//! Core functionality for the Renode WebSocket control plane.
//! One listening port multiplexes three services: the control protocol that
//! lifecycles the emulator, a transparent bridge to its telnet endpoints,
//! and a transparent bridge to a debugger's standard streams.

pub mod agent;
pub mod bridge;
pub mod error;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod supervisor;

pub use error::{Error, Result};
pub use server::GatewayServer;
