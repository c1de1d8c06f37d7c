//! Emulator child supervision.
//!
//! Owns the `renode-agent` subprocess and presents two abstractions to the
//! rest of the server: a serialized `execute` call returning `(result,
//! error)` and a consumable stream of emulator events. The child's stdout
//! carries one JSON object per line; objects with an `evt` key are events,
//! everything else is the response to the most recent unanswered request.
//! The single-writer lock keeps that pairing exact across any number of
//! callers.

use parking_lot::{Mutex as SyncMutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::protocol::encode_line;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("the emulator is already running")]
    AlreadyRunning,

    #[error("failed to spawn the emulator agent: {0}")]
    Spawn(std::io::Error),

    #[error("illegal starting response: {0}")]
    Handshake(String),

    #[error("timed out waiting for the emulator agent to become ready")]
    ReadyTimeout,

    #[error("could not locate the renode-agent binary")]
    AgentNotFound,
}

/// Tasks to cancel when the server is forced to exit. The subprocess readers
/// register here; aborting them lets a shutdown proceed even while a child
/// is still streaming.
#[derive(Default)]
pub struct TaskRegistry {
    handles: SyncMutex<Vec<AbortHandle>>,
}

impl TaskRegistry {
    pub fn register(&self, task: &JoinHandle<()>) {
        self.handles.lock().push(task.abort_handle());
    }

    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

/// How to launch the emulator agent. The positional arguments required by
/// the agent (logging port and the two boolean flags) are appended to
/// `args` at spawn time.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl AgentCommand {
    /// Find `renode-agent` next to the current executable, falling back to
    /// `$PATH`.
    pub fn discover() -> Result<Self, SupervisorError> {
        if let Ok(exe) = std::env::current_exe() {
            let sibling = exe.with_file_name("renode-agent");
            if sibling.is_file() {
                return Ok(Self {
                    program: sibling,
                    args: Vec::new(),
                });
            }
        }
        which::which("renode-agent")
            .map(|program| Self {
                program,
                args: Vec::new(),
            })
            .map_err(|_| SupervisorError::AgentNotFound)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the emulator binary, exported to the agent as `PYRENODE_BIN`.
    pub renode_path: PathBuf,
    pub agent: AgentCommand,
    pub logging_port: u16,
    pub gui_disabled: bool,
    pub monitor_forwarding_disabled: bool,
    pub ready_attempts: u32,
    pub ready_timeout: Duration,
    pub quit_deadline: Duration,
    pub exit_poll_attempts: u32,
    pub exit_poll_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(renode_path: PathBuf, agent: AgentCommand) -> Self {
        Self {
            renode_path,
            agent,
            logging_port: 29170,
            gui_disabled: true,
            monitor_forwarding_disabled: false,
            ready_attempts: 10,
            ready_timeout: Duration::from_secs(1),
            quit_deadline: Duration::from_millis(500),
            exit_poll_attempts: 10,
            exit_poll_interval: Duration::from_secs(1),
        }
    }
}

struct EmulatorChild {
    child: Child,
    stdin: ChildStdin,
    pid: u32,
}

/// Supervises one emulator child for one control connection.
pub struct EmulatorSupervisor {
    config: SupervisorConfig,
    /// Single-writer lock: whoever holds it owns the wire until the
    /// response for its request has been read.
    child: Mutex<Option<EmulatorChild>>,
    started: AtomicBool,
    present: AtomicBool,
    responses: Mutex<UnboundedReceiver<Value>>,
    responses_tx: UnboundedSender<Value>,
    events: Mutex<UnboundedReceiver<Value>>,
    events_tx: UnboundedSender<Value>,
    event_filter: RwLock<HashSet<String>>,
    tasks: Arc<TaskRegistry>,
}

impl EmulatorSupervisor {
    pub fn new(config: SupervisorConfig, tasks: Arc<TaskRegistry>) -> Self {
        let (responses_tx, responses_rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();
        Self {
            config,
            child: Mutex::new(None),
            started: AtomicBool::new(false),
            present: AtomicBool::new(false),
            responses: Mutex::new(responses_rx),
            responses_tx,
            events: Mutex::new(events_rx),
            events_tx,
            event_filter: RwLock::new(HashSet::new()),
            tasks,
        }
    }

    /// Whether a child currently exists (it may still be shutting down).
    pub fn is_alive(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    /// Launch the agent and wait for its readiness handshake. Refuses when
    /// a live child already exists.
    pub async fn spawn(&self, gui: bool, cwd: &Path) -> Result<u32, SupervisorError> {
        let mut slot = self.child.lock().await;
        if let Some(existing) = slot.as_mut() {
            if !matches!(existing.child.try_wait(), Ok(Some(_))) {
                warn!("Attempting to start the emulator, but it is already running");
                return Err(SupervisorError::AlreadyRunning);
            }
        }

        debug!("Loading the emulator from {}", self.config.renode_path.display());
        let mut command = Command::new(&self.config.agent.program);
        command
            .args(&self.config.agent.args)
            .arg(self.config.logging_port.to_string())
            .arg(gui.to_string())
            .arg(self.config.monitor_forwarding_disabled.to_string())
            .env("PYRENODE_BIN", &self.config.renode_path)
            .env("PYRENODE_RUNTIME", "coreclr")
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The child gets a fresh session group so it never receives the
        // terminal's signals meant for the server.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            SupervisorError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "stdin unavailable"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SupervisorError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "stdout unavailable"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SupervisorError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "stderr unavailable"))
        })?;
        let pid = child.id().unwrap_or_default();
        info!("Started the emulator agent with PID: {pid}");

        let mut lines = BufReader::new(stdout).lines();
        let mut handle = EmulatorChild { child, stdin, pid };

        match self.await_ready(&mut lines).await {
            Ok(()) => {}
            Err(e) => {
                self.dispose(&mut handle).await;
                return Err(e);
            }
        }

        // Leftover responses from a previous child would break the FIFO
        // pairing; events are still deliverable.
        {
            let mut responses = self.responses.lock().await;
            while responses.try_recv().is_ok() {}
        }

        let read_task = tokio::spawn(read_loop(
            lines,
            self.responses_tx.clone(),
            self.events_tx.clone(),
        ));
        let log_task = tokio::spawn(log_loop(stderr));
        self.tasks.register(&read_task);
        self.tasks.register(&log_task);

        self.started.store(true, Ordering::SeqCst);
        self.present.store(true, Ordering::SeqCst);
        *slot = Some(handle);
        info!("Emulator instance is ready");
        Ok(pid)
    }

    async fn await_ready(
        &self,
        lines: &mut Lines<BufReader<ChildStdout>>,
    ) -> Result<(), SupervisorError> {
        for attempt in 1..=self.config.ready_attempts {
            debug!(
                "Waiting for the emulator instance ({attempt}/{})",
                self.config.ready_attempts
            );
            let line = match timeout(self.config.ready_timeout, lines.next_line()).await {
                Err(_) => continue,
                Ok(Err(_)) | Ok(Ok(None)) => return Err(SupervisorError::ReadyTimeout),
                Ok(Ok(Some(line))) => line,
            };
            let message: Value = serde_json::from_str(&line)
                .map_err(|_| SupervisorError::Handshake(line.clone()))?;
            if message.get("rsp").and_then(Value::as_str) == Some("ready") {
                return Ok(());
            }
            error!("Received illegal starting response: {message}");
            return Err(SupervisorError::Handshake(message.to_string()));
        }
        Err(SupervisorError::ReadyTimeout)
    }

    /// Run one agent command. Calls from any number of tasks are linearized
    /// by the child lock, so the on-wire order equals the response order.
    /// Never fails: errors come back as `(false, Some(text))`.
    pub async fn execute(&self, command: &str, kwargs: Map<String, Value>) -> (Value, Option<String>) {
        let mut slot = self.child.lock().await;
        let Some(handle) = slot.as_mut() else {
            warn!("Attempted to issue a request to the emulator, but it was never started");
            return (json!(false), Some("Emulator not started".to_string()));
        };
        if matches!(handle.child.try_wait(), Ok(Some(_))) {
            warn!("Attempted to issue a request to the emulator, but it is closed");
            return (json!(false), Some("Emulator is closed".to_string()));
        }
        self.execute_locked(handle, command, kwargs).await
    }

    /// Body of `execute`, assuming the child lock is held. `kill` reuses it
    /// for the graceful `quit` without re-acquiring the lock.
    async fn execute_locked(
        &self,
        handle: &mut EmulatorChild,
        command: &str,
        kwargs: Map<String, Value>,
    ) -> (Value, Option<String>) {
        let mut request = Map::new();
        request.insert("cmd".to_string(), json!(command));
        request.extend(kwargs);
        let line = encode_line(&Value::Object(request));

        if handle.stdin.write_all(line.as_bytes()).await.is_err()
            || handle.stdin.flush().await.is_err()
        {
            return (
                json!(false),
                Some("Communication with the emulator failed".to_string()),
            );
        }

        let mut responses = self.responses.lock().await;
        tokio::select! {
            response = responses.recv() => match response {
                Some(output) => map_child_response(output),
                None => (
                    json!(false),
                    Some("Communication with the emulator failed".to_string()),
                ),
            },
            // The child dying mid-request must still produce exactly one
            // answer for this request.
            _ = handle.child.wait() => {
                (json!(false), Some("Emulator is closed".to_string()))
            }
        }
    }

    /// Await the next emulator event, transparently dropping events whose
    /// name is filtered out. Pends forever while no child is producing.
    pub async fn next_event(&self) -> Value {
        loop {
            let event = {
                let mut events = self.events.lock().await;
                events.recv().await
            };
            let Some(event) = event else {
                std::future::pending::<()>().await;
                unreachable!();
            };
            let name = event.get("event").and_then(Value::as_str).unwrap_or("");
            {
                let filter = self.event_filter.read();
                if !filter.is_empty() && !filter.contains(name) {
                    debug!("Dropping filtered emulator event '{name}'");
                    continue;
                }
            }
            return event;
        }
    }

    /// Replace the event name filter. An empty set passes every event.
    /// Takes effect on subsequent events.
    pub fn filter_events(&self, names: Vec<String>) {
        *self.event_filter.write() = names.into_iter().collect();
    }

    /// Stop the child: graceful `quit` under a deadline, bounded exit poll,
    /// then the hard kill signal and another poll. Idempotent; returns
    /// whether a child was actually brought down.
    pub async fn kill(&self) -> bool {
        self.started.store(false, Ordering::SeqCst);
        let mut slot = self.child.lock().await;
        let Some(mut handle) = slot.take() else {
            warn!("Requested to kill the emulator, but no subprocess has been created");
            return false;
        };

        let _ = timeout(
            self.config.quit_deadline,
            self.execute_locked(&mut handle, "quit", Map::new()),
        )
        .await;
        if self
            .wait_for_termination(&mut handle, "Waiting for the emulator instance to finish")
            .await
        {
            info!("Emulator has been shut down");
            self.present.store(false, Ordering::SeqCst);
            return true;
        }

        if let Err(e) = handle.child.start_kill() {
            warn!("Failed to signal the emulator child: {e}");
        }
        if self
            .wait_for_termination(&mut handle, "Waiting for the emulator process to terminate")
            .await
        {
            info!("Emulator has been killed");
            self.present.store(false, Ordering::SeqCst);
            return true;
        }

        error!("Failed to kill emulator PID: {}", handle.pid);
        *slot = Some(handle);
        false
    }

    async fn wait_for_termination(&self, handle: &mut EmulatorChild, what: &str) -> bool {
        for attempt in 1..=self.config.exit_poll_attempts {
            if matches!(handle.child.try_wait(), Ok(Some(_))) {
                return true;
            }
            debug!("{what} ({attempt}/{})", self.config.exit_poll_attempts);
            if timeout(self.config.exit_poll_interval, handle.child.wait())
                .await
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Tear down a child that never became ready.
    async fn dispose(&self, handle: &mut EmulatorChild) {
        let _ = handle.child.start_kill();
        let _ = timeout(self.config.exit_poll_interval, handle.child.wait()).await;
    }
}

/// Drain the child's stdout, demultiplexing events from responses by the
/// `evt` key. A malformed line ends the stream; the child is contractually
/// strict about its framing.
async fn read_loop(
    mut lines: Lines<BufReader<ChildStdout>>,
    responses: UnboundedSender<Value>,
    events: UnboundedSender<Value>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(message) => {
                        if let Some(event) = message.get("evt") {
                            let _ = events.send(event.clone());
                        } else {
                            let _ = responses.send(message);
                        }
                    }
                    Err(e) => {
                        error!("Malformed line from the emulator agent: {e}");
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Emulator stdout closed: {e}");
                break;
            }
        }
    }
    debug!("Emulator stdout reader finished");
}

/// Forward the child's stderr to the log sink.
async fn log_loop(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim_end();
        if !trimmed.is_empty() {
            debug!(target: "renode_gateway::emulator", "{trimmed}");
        }
    }
}

/// Map a child response object onto the `(result, error)` pair handed to
/// action handlers. An empty `out` stderr counts as no error.
fn map_child_response(output: Value) -> (Value, Option<String>) {
    if let Some(rsp) = output.get("rsp") {
        return (rsp.clone(), None);
    }
    if let Some(out) = output.get("out").and_then(Value::as_array) {
        if out.len() == 2 {
            let err = match out[1].as_str() {
                Some("") | None => None,
                Some(text) => Some(text.to_string()),
            };
            return (out[0].clone(), err);
        }
    }
    if let Some(err) = output.get("err").and_then(Value::as_str) {
        return (json!(false), Some(format!("Emulator: {err}")));
    }
    (
        json!(false),
        Some("Communication with the emulator failed".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;

    fn fake_agent(script: &str) -> AgentCommand {
        AgentCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string(), "fake-agent".to_string()],
        }
    }

    fn quick_config(script: &str) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(PathBuf::from("/bin/true"), fake_agent(script));
        config.ready_attempts = 4;
        config.ready_timeout = Duration::from_millis(250);
        config.quit_deadline = Duration::from_millis(200);
        config.exit_poll_attempts = 4;
        config.exit_poll_interval = Duration::from_millis(250);
        config
    }

    fn supervisor(script: &str) -> EmulatorSupervisor {
        EmulatorSupervisor::new(quick_config(script), Arc::new(TaskRegistry::default()))
    }

    const ECHO_AGENT: &str = r#"
echo '{"rsp":"ready"}'
i=0
while read line; do
  case "$line" in
    *quit*) echo '{"rsp":"closing"}'; exit 0 ;;
    *) i=$((i+1)); echo "{\"rsp\":$i}" ;;
  esac
done
"#;

    #[tokio::test]
    async fn execute_without_spawn_reports_not_started() {
        let sup = supervisor(ECHO_AGENT);
        let (result, error) = sup.execute("version", Map::new()).await;
        assert_eq!(result, json!(false));
        assert_eq!(error.as_deref(), Some("Emulator not started"));
    }

    #[tokio::test]
    async fn spawn_handshake_and_execute() {
        let sup = supervisor(ECHO_AGENT);
        let pid = sup.spawn(false, Path::new("/tmp")).await.unwrap();
        assert!(pid > 0);
        assert!(sup.is_alive());

        let (result, error) = sup.execute("poke", Map::new()).await;
        assert_eq!(result, json!(1));
        assert!(error.is_none());

        assert!(sup.kill().await);
        assert!(!sup.is_alive());
    }

    #[tokio::test]
    async fn spawn_refuses_while_running() {
        let sup = supervisor(ECHO_AGENT);
        sup.spawn(false, Path::new("/tmp")).await.unwrap();
        assert!(matches!(
            sup.spawn(false, Path::new("/tmp")).await,
            Err(SupervisorError::AlreadyRunning)
        ));
        sup.kill().await;
    }

    #[tokio::test]
    async fn spawn_rejects_illegal_first_message() {
        let sup = supervisor("echo '{\"rsp\":\"not-ready\"}'; sleep 5");
        assert!(matches!(
            sup.spawn(false, Path::new("/tmp")).await,
            Err(SupervisorError::Handshake(_))
        ));
        assert!(!sup.is_alive());
    }

    #[tokio::test]
    async fn spawn_times_out_without_handshake() {
        let sup = supervisor("sleep 30");
        assert!(matches!(
            sup.spawn(false, Path::new("/tmp")).await,
            Err(SupervisorError::ReadyTimeout)
        ));
    }

    #[tokio::test]
    async fn responses_pair_fifo_under_concurrency() {
        let sup = Arc::new(supervisor(ECHO_AGENT));
        sup.spawn(false, Path::new("/tmp")).await.unwrap();

        let calls = (0..10).map(|_| {
            let sup = sup.clone();
            async move { sup.execute("step", Map::new()).await }
        });
        let mut seen: Vec<i64> = join_all(calls)
            .await
            .into_iter()
            .map(|(result, error)| {
                assert!(error.is_none());
                result.as_i64().unwrap()
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());

        sup.kill().await;
    }

    #[tokio::test]
    async fn child_error_is_prefixed() {
        let sup = supervisor(
            r#"echo '{"rsp":"ready"}'; while read l; do echo '{"err":"machine not found"}'; done"#,
        );
        sup.spawn(false, Path::new("/tmp")).await.unwrap();
        let (result, error) = sup.execute("mach set", Map::new()).await;
        assert_eq!(result, json!(false));
        assert_eq!(error.as_deref(), Some("Emulator: machine not found"));
        sup.kill().await;
    }

    #[tokio::test]
    async fn monitor_output_maps_to_out_pair() {
        let sup = supervisor(
            r#"echo '{"rsp":"ready"}'; while read l; do echo '{"out":["machine created",""]}'; done"#,
        );
        sup.spawn(false, Path::new("/tmp")).await.unwrap();
        let (result, error) = sup.execute("mach create", Map::new()).await;
        assert_eq!(result, json!("machine created"));
        assert!(error.is_none());
        sup.kill().await;
    }

    #[tokio::test]
    async fn execute_after_child_death_reports_closed() {
        let sup = supervisor(r#"echo '{"rsp":"ready"}'"#);
        sup.spawn(false, Path::new("/tmp")).await.unwrap();
        // Give the child a moment to exit.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (result, error) = sup.execute("poke", Map::new()).await;
        assert_eq!(result, json!(false));
        assert_eq!(error.as_deref(), Some("Emulator is closed"));
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let sup = supervisor(ECHO_AGENT);
        assert!(!sup.kill().await);

        sup.spawn(false, Path::new("/tmp")).await.unwrap();
        assert!(sup.kill().await);
        assert!(!sup.kill().await);
    }

    #[tokio::test]
    async fn kill_falls_back_to_signal() {
        // Agent that ignores quit; only the kill signal brings it down.
        let sup = supervisor(
            r#"echo '{"rsp":"ready"}'; while read l; do :; done; sleep 30"#,
        );
        sup.spawn(false, Path::new("/tmp")).await.unwrap();
        assert!(sup.kill().await);
        assert!(!sup.is_alive());
    }

    #[tokio::test]
    async fn events_are_demuxed_and_filtered() {
        let script = r#"
echo '{"rsp":"ready"}'
while read line; do
  echo '{"evt":{"event":"uart-opened","port":3456}}'
  echo '{"evt":{"event":"renode-quitted"}}'
  echo '{"rsp":"ok"}'
done
"#;
        let sup = supervisor(script);
        sup.spawn(false, Path::new("/tmp")).await.unwrap();

        let (result, _) = sup.execute("poke", Map::new()).await;
        assert_eq!(result, json!("ok"));

        let first = sup.next_event().await;
        assert_eq!(first["event"], "uart-opened");
        assert_eq!(first["port"], 3456);
        let second = sup.next_event().await;
        assert_eq!(second["event"], "renode-quitted");

        // Only renode-quitted passes the filter now; the uart event between
        // them is dropped transparently.
        sup.filter_events(vec!["renode-quitted".to_string()]);
        let (result, _) = sup.execute("poke", Map::new()).await;
        assert_eq!(result, json!("ok"));
        let filtered = sup.next_event().await;
        assert_eq!(filtered["event"], "renode-quitted");

        sup.kill().await;
    }
}
