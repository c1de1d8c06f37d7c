//! Monitor-socket emulation backend.
//!
//! Drives a headless emulator process through its interactive monitor TCP
//! endpoint: commands are written as lines, replies are read up to the next
//! prompt. Machine and peripheral queries are answered by parsing the
//! monitor's `peripherals` tree. In headless mode the backend also applies
//! the socket analyzer strategy itself: every newly discovered UART gets a
//! server socket terminal and a `uart-opened` event.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use super::backend::{AgentEvent, Emulation, Peripheral};
use super::AgentError;

static ANSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("static regex"));
static PROMPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\([^)]*\)\s?$").expect("static regex"));
static MACHINE_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\[\d+\]|[-•*])\s+(\S+)").expect("static regex"));
static PERIPHERAL_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s+\(([A-Za-z0-9_.]+)\)").expect("static regex"));

const CONNECT_ATTEMPTS: u32 = 60;

/// Raw line-oriented connection to the emulator's monitor socket.
pub struct MonitorConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl MonitorConnection {
    /// Connect to `localhost:<port>`, retrying while the emulator is still
    /// opening its sockets.
    pub async fn connect(port: u16) -> std::io::Result<Self> {
        for attempt in 1..=CONNECT_ATTEMPTS {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    let mut connection = Self { reader, writer };
                    // Swallow the banner up to the first prompt.
                    connection.read_until_prompt().await?;
                    return Ok(connection);
                }
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    debug!("Monitor socket not open yet ({attempt}/{CONNECT_ATTEMPTS}): {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("connect loop always returns");
    }

    /// Run one monitor command and split its output into (stdout, stderr).
    pub async fn execute(&mut self, command: &str) -> std::io::Result<(String, String)> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let raw = self.read_until_prompt().await?;
        Ok(split_reply(&raw, command))
    }

    async fn read_until_prompt(&mut self) -> std::io::Result<String> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "monitor connection closed",
                ));
            }
            buffer.extend_from_slice(&chunk[..n]);
            let text = strip_ansi(&String::from_utf8_lossy(&buffer));
            if let Some(last) = text.replace('\r', "").rsplit('\n').next() {
                if PROMPT.is_match(last) {
                    return Ok(text);
                }
            }
        }
    }
}

fn strip_ansi(text: &str) -> String {
    ANSI.replace_all(text, "").into_owned()
}

/// Drop the command echo and the prompt, then split the remaining lines
/// into output and error text. The monitor multiplexes both streams onto
/// one socket; the split is by message shape.
fn split_reply(raw: &str, command: &str) -> (String, String) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    for line in raw.replace('\r', "").split('\n') {
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed == command || PROMPT.is_match(trimmed) {
            continue;
        }
        if is_error_line(trimmed) {
            err.push(trimmed.to_string());
        } else {
            out.push(trimmed.to_string());
        }
    }
    (out.join("\n"), err.join("\n"))
}

fn is_error_line(line: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "Could not",
        "There is no",
        "No machine",
        "Invalid",
        "Unhandled",
        "Error",
        "Failed",
    ];
    PREFIXES.iter().any(|prefix| line.starts_with(prefix)) || line.contains("exception")
}

/// Parse the `mach` listing into machine names.
fn parse_machines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| MACHINE_ENTRY.captures(line))
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Parse the `peripherals` tree into dotted paths. Depth is tracked by the
/// column at which an entry's name starts.
fn parse_peripherals(output: &str) -> Vec<Peripheral> {
    let mut peripherals = Vec::new();
    // (column, path) of the open ancestors, innermost last.
    let mut stack: Vec<(usize, String)> = Vec::new();

    for line in output.lines() {
        let Some(found) = PERIPHERAL_ENTRY.captures(line) else {
            continue;
        };
        let name_match = found.get(1).expect("group 1 always present");
        let name = name_match.as_str();
        let type_name = found[2].to_string();
        let column = name_match.start();

        while let Some((depth, _)) = stack.last() {
            if *depth >= column {
                stack.pop();
            } else {
                break;
            }
        }

        let path = match stack.last() {
            None => name.to_string(),
            Some((_, parent)) => format!("{parent}.{name}"),
        };
        stack.push((column, path.clone()));

        if path != "sysbus" {
            peripherals.push(Peripheral { path, type_name });
        }
    }
    peripherals
}

/// The production [`Emulation`]: a headless emulator child plus its monitor
/// socket.
pub struct RenodeBackend {
    monitor: MonitorConnection,
    events_tx: UnboundedSender<AgentEvent>,
    events_rx: Option<UnboundedReceiver<AgentEvent>>,
    current_machine: Option<String>,
    gui_enabled: bool,
    known_uarts: HashSet<(String, String)>,
    next_terminal: u32,
}

impl RenodeBackend {
    /// Spawn the emulator and attach to its monitor. The monitor listens
    /// one below the network log port.
    pub async fn start(
        renode_path: PathBuf,
        logging_port: u16,
        gui_enabled: bool,
    ) -> Result<Self, AgentError> {
        let monitor_port = logging_port - 1;
        let mut command = Command::new(&renode_path);
        command
            .arg("-P")
            .arg(monitor_port.to_string())
            .arg("-e")
            .arg(format!("logNetwork {logging_port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if !gui_enabled {
            command.args(["--hide-monitor", "--hide-log", "--hide-analyzers", "--disable-xwt"]);
        }

        let mut child = command.spawn().map_err(AgentError::Spawn)?;
        info!(
            "Started the emulator from {} (monitor on port {monitor_port})",
            renode_path.display()
        );

        let (events_tx, events_rx) = unbounded_channel();

        // The child is owned by a waiter so its exit always surfaces as an
        // event, whatever triggered it.
        let quitted_tx = events_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            debug!("Emulator process finished: {status:?}");
            let _ = quitted_tx.send(AgentEvent::Quitted);
        });

        let monitor = MonitorConnection::connect(monitor_port)
            .await
            .map_err(AgentError::Monitor)?;
        info!("Emulator logs available at port {logging_port}");

        Ok(Self {
            monitor,
            events_tx,
            events_rx: Some(events_rx),
            current_machine: None,
            gui_enabled,
            known_uarts: HashSet::new(),
            next_terminal: 0,
        })
    }

    async fn run_monitor(&mut self, command: &str) -> (String, String) {
        match self.monitor.execute(command).await {
            Ok(pair) => pair,
            Err(e) => (String::new(), format!("monitor connection lost: {e}")),
        }
    }

    /// Select a machine before running a command in its context.
    async fn run_scoped(&mut self, machine: &str, command: &str) -> (String, String) {
        if self.current_machine.as_deref() != Some(machine) {
            let (_, err) = self.run_monitor(&format!("mach set \"{machine}\"")).await;
            if !err.is_empty() {
                return (String::new(), err);
            }
            self.current_machine = Some(machine.to_string());
        }
        self.run_monitor(command).await
    }

    /// Bind an ephemeral port for a new server socket terminal.
    async fn free_port() -> Option<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.ok()?;
        let port = listener.local_addr().ok()?.port();
        drop(listener);
        Some(port)
    }

    /// Re-scan for UARTs and open a socket terminal for every new one.
    /// Replaces the GUI's per-UART analyzer windows in headless mode.
    async fn watch_uarts(&mut self) {
        if self.gui_enabled {
            return;
        }
        let machines = match self.list_machines().await {
            Ok(machines) => machines,
            Err(_) => return,
        };
        for machine in machines {
            let (tree, err) = self.run_scoped(&machine, "peripherals").await;
            if !err.is_empty() {
                continue;
            }
            let uarts: Vec<Peripheral> = parse_peripherals(&tree)
                .into_iter()
                .filter(Peripheral::is_uart)
                .collect();
            for uart in uarts {
                let key = (machine.clone(), uart.path.clone());
                if self.known_uarts.contains(&key) {
                    continue;
                }
                let Some(port) = Self::free_port().await else {
                    continue;
                };
                let terminal = format!("term{}", self.next_terminal);
                self.next_terminal += 1;

                let create = format!("emulation CreateServerSocketTerminal {port} \"{terminal}\" false");
                let (_, err) = self.run_scoped(&machine, &create).await;
                if !err.is_empty() {
                    warn!("Could not open a terminal for {}: {err}", uart.path);
                    continue;
                }
                let connect = format!("connector Connect {} {terminal}", uart.path);
                let (_, err) = self.run_scoped(&machine, &connect).await;
                if !err.is_empty() {
                    warn!("Could not connect {} to its terminal: {err}", uart.path);
                    continue;
                }

                self.known_uarts.insert(key);
                let _ = self.events_tx.send(AgentEvent::UartOpened {
                    port,
                    name: uart.path,
                    machine_name: machine.clone(),
                });
            }
        }
    }

    async fn list_machines(&mut self) -> Result<Vec<String>, String> {
        let (out, err) = self.run_monitor("mach").await;
        if !err.is_empty() {
            return Err(err);
        }
        Ok(parse_machines(&out))
    }
}

#[async_trait]
impl Emulation for RenodeBackend {
    async fn execute(&mut self, command: &str) -> (String, String) {
        let result = self.run_monitor(command).await;
        // A raw command may have switched the machine context.
        self.current_machine = None;
        // Creating machines or loading platforms may have brought up UARTs.
        self.watch_uarts().await;
        result
    }

    async fn machines(&mut self) -> Result<Vec<String>, String> {
        self.list_machines().await
    }

    async fn peripherals(&mut self, machine: &str) -> Result<Vec<Peripheral>, String> {
        let (out, err) = self.run_scoped(machine, "peripherals").await;
        if !err.is_empty() {
            return Err(err);
        }
        Ok(parse_peripherals(&out))
    }

    async fn get_property(
        &mut self,
        machine: &str,
        peripheral: &str,
        request: &str,
    ) -> Result<String, String> {
        let (out, err) = self.run_scoped(machine, &format!("{peripheral} {request}")).await;
        if !err.is_empty() {
            return Err(err);
        }
        Ok(out.trim().to_string())
    }

    async fn invoke(
        &mut self,
        machine: &str,
        peripheral: &str,
        invocation: &str,
    ) -> Result<(), String> {
        let (_, err) = self.run_scoped(machine, &format!("{peripheral} {invocation}")).await;
        if !err.is_empty() {
            return Err(err);
        }
        Ok(())
    }

    async fn quit(&mut self) {
        let _ = self.monitor.execute("quit").await;
    }

    fn take_events(&mut self) -> Option<UnboundedReceiver<AgentEvent>> {
        self.events_rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_sequences() {
        assert_eq!(strip_ansi("\x1b[31mError\x1b[0m text"), "Error text");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn reply_split_drops_echo_and_prompt() {
        let raw = "version\r\nRenode v1.15\r\n(monitor) ";
        let (out, err) = split_reply(raw, "version");
        assert_eq!(out, "Renode v1.15");
        assert!(err.is_empty());
    }

    #[test]
    fn reply_split_classifies_errors() {
        let raw = "mach set \"nope\"\nCould not find machine nope\n(monitor) ";
        let (out, err) = split_reply(raw, "mach set \"nope\"");
        assert!(out.is_empty());
        assert_eq!(err, "Could not find machine nope");
    }

    #[test]
    fn machine_listing_parses_indexed_entries() {
        let output = "Available machines:\n  [0] machine-0\n  [1] stm32\n";
        assert_eq!(parse_machines(output), vec!["machine-0", "stm32"]);
        assert!(parse_machines("Usage: mach set ...").is_empty());
    }

    #[test]
    fn peripheral_tree_builds_dotted_paths() {
        let output = "\
Available peripherals:
  sysbus (SystemBus)
  │
  ├── uart0 (UARTLite)
  │     <0x40600000, 0x4060FFFF>
  │
  └── gpio (GPIOPort)
        ├── button0 (Button)
        └── led0 (LED)
";
        let peripherals = parse_peripherals(output);
        let paths: Vec<&str> = peripherals.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "sysbus.uart0",
                "sysbus.gpio",
                "sysbus.gpio.button0",
                "sysbus.gpio.led0"
            ]
        );
        assert!(peripherals[0].is_uart());
        assert!(peripherals[2].is_button());
        assert!(peripherals[3].is_led());
    }

    #[test]
    fn prompt_detection() {
        assert!(PROMPT.is_match("(monitor) "));
        assert!(PROMPT.is_match("(machine-0) "));
        assert!(!PROMPT.is_match("not a prompt"));
    }
}
