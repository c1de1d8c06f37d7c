//! The emulation seam.
//!
//! The agent's command handlers never talk to the emulator directly; they
//! go through [`Emulation`], which the monitor-driven backend implements in
//! production and a mock implements in tests. Errors are plain strings:
//! they travel to the client verbatim inside `{"err": …}` responses.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;

/// One peripheral of a machine, addressed by its dotted path rooted at
/// `sysbus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub path: String,
    /// The emulator's type name for the peripheral, e.g. `Button` or
    /// `UARTLite`.
    pub type_name: String,
}

impl Peripheral {
    pub fn is_uart(&self) -> bool {
        self.type_name.contains("UART")
    }

    pub fn is_button(&self) -> bool {
        self.type_name.contains("Button")
    }

    pub fn is_led(&self) -> bool {
        self.type_name.contains("LED") || self.type_name.contains("Led")
    }
}

/// Asynchronous events originating in the emulator rather than in a
/// request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    UartOpened {
        port: u16,
        name: String,
        machine_name: String,
    },
    Quitted,
}

impl AgentEvent {
    /// The `evt` object written to stdout, with the event name under
    /// `event` and the remaining keys as payload.
    pub fn to_wire(&self) -> Value {
        let mut fields = Map::new();
        match self {
            AgentEvent::UartOpened {
                port,
                name,
                machine_name,
            } => {
                fields.insert("event".into(), Value::from("uart-opened"));
                fields.insert("port".into(), Value::from(*port));
                fields.insert("name".into(), Value::from(name.clone()));
                fields.insert("machineName".into(), Value::from(machine_name.clone()));
            }
            AgentEvent::Quitted => {
                fields.insert("event".into(), Value::from("renode-quitted"));
            }
        }
        Value::Object(fields)
    }
}

/// Everything the command registry needs from the emulator.
#[async_trait]
pub trait Emulation: Send {
    /// Run a raw monitor command, returning its (stdout, stderr) pair.
    async fn execute(&mut self, command: &str) -> (String, String);

    /// Names of all machines in the emulation.
    async fn machines(&mut self) -> Result<Vec<String>, String>;

    /// All peripherals of one machine.
    async fn peripherals(&mut self, machine: &str) -> Result<Vec<Peripheral>, String>;

    /// Read a property (or argumentless getter) of a peripheral, scoped to
    /// a machine. Returns the trimmed textual value.
    async fn get_property(
        &mut self,
        machine: &str,
        peripheral: &str,
        request: &str,
    ) -> Result<String, String>;

    /// Invoke a setter or method on a peripheral, scoped to a machine.
    async fn invoke(
        &mut self,
        machine: &str,
        peripheral: &str,
        invocation: &str,
    ) -> Result<(), String>;

    /// Ask the emulator to terminate.
    async fn quit(&mut self);

    /// Hand out the event stream. Called once at startup.
    fn take_events(&mut self) -> Option<UnboundedReceiver<AgentEvent>>;
}
