//! Process management for running MCP servers.
//!
//! The handle table is owned by a [`ProcessManager`] and shared with the
//! background tasks it spawns (output relays, exit watchers, socket
//! monitors, stop escalations). Command-kind handles are mirrored to a state
//! file so a later invocation of the tool can see and stop them.
//!
//! Servers that must outlive the manager are launched through a relay
//! helper (`<helper> log-relay --log <file> -- <program> <args>`), which
//! owns the child's pipes and keeps timestamping its output. The helper
//! runs [`relay_to_log`].

use crate::config::Settings;
use crate::fsio::{read_json, write_json_atomic, FileLock};
use crate::logs::{self, LogSink, TAG_ERROR, TAG_EXIT, TAG_FATAL};
use crate::paths::ConfigPaths;
use crate::server::{CommandSpec, ServerKind, ServerRecord, SocketConfig};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Subcommand a relay helper executable must implement.
pub const RELAY_COMMAND: &str = "log-relay";

/// How often a stopping process group is checked before escalating.
const TERMINATION_POLL: Duration = Duration::from_millis(100);
/// How often a directly-logged child's log is scanned for readiness.
const LOG_POLL: Duration = Duration::from_millis(100);
/// How long the exit watcher waits for output relays to drain.
const RELAY_DRAIN: Duration = Duration::from_secs(1);
/// Allowed gap between a handle's recorded start and the OS process start.
const START_TIME_SLACK_SECS: i64 = 5;

/// Where a spawned server's stdout/stderr go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogCapture {
    /// Piped through the manager, which timestamps every line.
    #[default]
    Relay,
    /// Piped through a relay helper process (the given executable), which
    /// timestamps every line and keeps running after the manager exits.
    Helper(PathBuf),
    /// The log file is handed to the child untouched. Output keeps flowing
    /// after the manager exits, but only events written by the manager carry
    /// timestamps.
    Direct,
}

/// Tunables for starting and stopping servers.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub capture: LogCapture,
    /// Substring that marks a server as ready; `None` means ready on spawn
    pub ready_pattern: Option<String>,
    pub ready_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub kill_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            capture: LogCapture::Relay,
            ready_pattern: None,
            ready_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
        }
    }
}

impl ManagerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            capture: LogCapture::Relay,
            ready_pattern: settings.ready_pattern.clone().filter(|p| !p.is_empty()),
            ready_timeout: settings.ready_timeout(),
            kill_timeout: settings.kill_timeout(),
        }
    }

    pub fn with_capture(mut self, capture: LogCapture) -> Self {
        self.capture = capture;
        self
    }
}

/// What a handle points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandleTarget {
    Process { pid: u32 },
    Socket { endpoint: String },
}

/// Runtime record of a started server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub name: String,
    #[serde(flatten)]
    pub target: HandleTarget,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        match self.target {
            HandleTarget::Process { pid } => Some(pid),
            HandleTarget::Socket { .. } => None,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match &self.target {
            HandleTarget::Socket { endpoint } => Some(endpoint),
            HandleTarget::Process { .. } => None,
        }
    }

    /// Time since the server was started.
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }
}

/// Result of looking a server up in the handle table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Running(ProcessHandle),
    /// Spawned but not yet ready
    Starting,
    Stopped,
}

enum Readiness {
    Ready,
    Exited(Option<i32>),
    TimedOut,
}

enum Slot {
    Starting,
    Process {
        pid: u32,
        handle: ProcessHandle,
    },
    Socket {
        handle: ProcessHandle,
        alive: Arc<AtomicBool>,
        monitor: JoinHandle<()>,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    servers: BTreeMap<String, ProcessHandle>,
}

fn read_state(path: &Path) -> State {
    match read_json::<State>(path) {
        Ok(state) => state.unwrap_or_default(),
        Err(e) => {
            warn!("Ignoring unreadable process state {}: {}", path.display(), e);
            State::default()
        }
    }
}

struct Inner {
    table: Mutex<HashMap<String, Slot>>,
    state_file: PathBuf,
    logs_dir: PathBuf,
    options: ManagerOptions,
    terminations: Mutex<JoinSet<()>>,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn terminations(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.terminations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read-modify-write the state file under its lock.
    fn update_state(&self, change: impl FnOnce(&mut State) -> bool) -> Result<()> {
        let _lock = FileLock::acquire(&self.state_file)?;
        let mut state = read_state(&self.state_file);
        if change(&mut state) {
            write_json_atomic(&self.state_file, &state)?;
        }
        Ok(())
    }

    fn record_started(&self, handle: &ProcessHandle) {
        let result = self.update_state(|state| {
            state.servers.insert(handle.name.clone(), handle.clone());
            true
        });
        if let Err(e) = result {
            warn!("Failed to record server '{}' in process state: {}", handle.name, e);
        }
    }

    fn record_stopped(&self, name: &str, pid: u32) {
        let result = self.update_state(|state| match state.servers.get(name) {
            Some(handle) if handle.pid() == Some(pid) => {
                state.servers.remove(name);
                true
            }
            _ => false,
        });
        if let Err(e) = result {
            warn!("Failed to remove server '{}' from process state: {}", name, e);
        }
    }

    /// Drop `name`'s handle if it still refers to `pid`.
    fn forget_process(&self, name: &str, pid: u32) {
        let removed = {
            let mut table = self.table();
            match table.get(name) {
                Some(Slot::Process { pid: current, .. }) if *current == pid => {
                    table.remove(name);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.record_stopped(name, pid);
        }
    }

    fn forget_socket(&self, name: &str, alive: &Arc<AtomicBool>) {
        let mut table = self.table();
        if let Some(Slot::Socket { alive: current, .. }) = table.get(name) {
            if Arc::ptr_eq(current, alive) {
                table.remove(name);
            }
        }
    }
}

/// Holds a `Starting` slot; removes it on drop unless committed.
struct Reservation {
    inner: Arc<Inner>,
    name: String,
    committed: bool,
}

impl Reservation {
    fn commit(mut self, slot: Slot) {
        self.committed = true;
        self.inner.table().insert(self.name.clone(), slot);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut table = self.inner.table();
        if matches!(table.get(&self.name), Some(Slot::Starting)) {
            table.remove(&self.name);
        }
    }
}

/// Starts, tracks and stops server processes.
///
/// Cheap to clone; clones share one handle table.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl ProcessManager {
    /// Build a manager, adopting live handles from the state file.
    ///
    /// Entries whose process is gone are purged from the file.
    pub fn load(paths: &ConfigPaths, options: ManagerOptions) -> Result<Self> {
        let state_file = paths.state_file();
        let mut table = HashMap::new();
        {
            let _lock = FileLock::acquire(&state_file)?;
            let state = read_state(&state_file);
            let total = state.servers.len();

            let mut live = BTreeMap::new();
            for (name, handle) in state.servers {
                match handle.pid() {
                    Some(pid) if owns_pid(pid, handle.started_at) => {
                        table.insert(
                            name.clone(),
                            Slot::Process {
                                pid,
                                handle: handle.clone(),
                            },
                        );
                        live.insert(name, handle);
                    }
                    _ => debug!("Purging stale handle for '{}'", name),
                }
            }

            if live.len() != total {
                write_json_atomic(&state_file, &State { servers: live })?;
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                table: Mutex::new(table),
                state_file,
                logs_dir: paths.logs_dir(),
                options,
                terminations: Mutex::new(JoinSet::new()),
            }),
        })
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        logs::log_path(&self.inner.logs_dir, name)
    }

    /// Start `record`.
    ///
    /// Fails with [`Error::AlreadyRunning`] if the server has a live handle
    /// or another start for it is in flight.
    pub async fn start(&self, record: &ServerRecord) -> Result<ProcessHandle> {
        record.validate()?;
        let reservation = self.reserve(&record.name)?;

        let slot = match &record.kind {
            ServerKind::Command(spec) => self.spawn_command(&record.name, spec).await?,
            ServerKind::Socket(socket) => self.connect_socket(&record.name, socket).await?,
        };

        match slot {
            Slot::Process { pid, handle } => {
                // An already exited server stays in the table until a probe
                // purges it, so the returned handle is always tracked.
                if is_alive(pid) {
                    self.inner.record_started(&handle);
                } else {
                    info!("Server '{}' (PID {}) exited right after starting", record.name, pid);
                }
                reservation.commit(Slot::Process {
                    pid,
                    handle: handle.clone(),
                });
                Ok(handle)
            }
            Slot::Socket {
                handle,
                alive,
                monitor,
            } => {
                let returned = handle.clone();
                reservation.commit(Slot::Socket {
                    handle,
                    alive,
                    monitor,
                });
                Ok(returned)
            }
            Slot::Starting => Err(Error::process(
                format!("Server '{}' produced no handle", record.name),
                None,
            )),
        }
    }

    fn reserve(&self, name: &str) -> Result<Reservation> {
        let stale = {
            let mut table = self.inner.table();
            let stale = match table.get(name) {
                Some(Slot::Starting) => return Err(Error::AlreadyRunning(name.to_string())),
                Some(Slot::Process { pid, handle }) if owns_pid(*pid, handle.started_at) => {
                    return Err(Error::AlreadyRunning(name.to_string()))
                }
                Some(Slot::Socket { alive, .. }) if alive.load(Ordering::SeqCst) => {
                    return Err(Error::AlreadyRunning(name.to_string()))
                }
                Some(Slot::Process { pid, .. }) => Some(*pid),
                Some(Slot::Socket { .. }) | None => None,
            };
            table.insert(name.to_string(), Slot::Starting);
            stale
        };

        if let Some(pid) = stale {
            debug!("Purging stale handle for '{}' (PID {})", name, pid);
            self.inner.record_stopped(name, pid);
        }

        Ok(Reservation {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
            committed: false,
        })
    }

    async fn spawn_command(&self, name: &str, spec: &CommandSpec) -> Result<Slot> {
        let options = &self.inner.options;
        let program = which::which(&spec.command).map_err(|e| {
            Error::process(
                format!("Cannot find command '{}' for server '{}': {}", spec.command, name, e),
                None,
            )
        })?;
        let log_file = self.log_file(name);

        let mut cmd = match &options.capture {
            LogCapture::Helper(helper) => {
                let mut cmd = Command::new(helper);
                cmd.arg(RELAY_COMMAND)
                    .arg("--log")
                    .arg(&log_file)
                    .arg("--")
                    .arg(&program);
                cmd
            }
            LogCapture::Relay | LogCapture::Direct => Command::new(&program),
        };
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            // Own process group, so stop reaches every descendant
            .process_group(0);

        let sink = match &options.capture {
            LogCapture::Relay => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                Some(Arc::new(LogSink::open(&log_file)?))
            }
            LogCapture::Helper(_) => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
                None
            }
            LogCapture::Direct => {
                let out = logs::open_for_child(&log_file)?;
                let err = out.try_clone().map_err(|e| Error::fs(&log_file, e))?;
                cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
                None
            }
        };
        // The helper logs the server's exit itself.
        let exit_log = match &options.capture {
            LogCapture::Helper(_) => None,
            LogCapture::Relay | LogCapture::Direct => Some(log_file.clone()),
        };
        let log_offset = std::fs::metadata(&log_file).map(|m| m.len()).unwrap_or(0);

        let mut child = cmd.spawn().map_err(|e| {
            let message = format!("Failed to spawn server '{}' ({})", name, program.display());
            if let Err(log_err) = logs::append_event(&log_file, TAG_FATAL, &format!("{}: {}", message, e)) {
                warn!("{}", log_err);
            }
            Error::process(message, Some(e))
        })?;
        let started_at = Utc::now();
        let pid = child.id().ok_or_else(|| {
            Error::process(format!("Server '{}' exited before its PID was read", name), None)
        })?;
        info!("Started server '{}' with PID {}", name, pid);

        let (ready_tx, ready_rx) = mpsc::channel::<()>(1);
        let pattern = options.ready_pattern.clone();
        let mut relays = Vec::new();

        if let Some(sink) = &sink {
            relays = spawn_relays(&mut child, sink, pattern.clone(), &ready_tx);
        } else if let Some(pattern) = &pattern {
            tokio::spawn(scan_log_for(
                log_file.clone(),
                log_offset,
                pattern.clone(),
                ready_tx.clone(),
            ));
        }
        drop(ready_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(watch_exit(
            Arc::clone(&self.inner),
            name.to_string(),
            pid,
            child,
            relays,
            sink.clone(),
            exit_log,
            exit_tx,
        ));

        if let Some(pattern) = &pattern {
            let scan_from = sink.is_none().then_some(log_offset);
            self.await_ready(name, pid, &log_file, pattern, scan_from, ready_rx, exit_rx)
                .await?;
        }

        Ok(Slot::Process {
            pid,
            handle: ProcessHandle {
                name: name.to_string(),
                target: HandleTarget::Process { pid },
                started_at,
                log_file: Some(log_file),
            },
        })
    }

    /// Wait for `pattern` in the server's output. `scan_from` is the log
    /// offset to search from when output is not relayed in-process.
    #[allow(clippy::too_many_arguments)]
    async fn await_ready(
        &self,
        name: &str,
        pid: u32,
        log_file: &Path,
        pattern: &str,
        scan_from: Option<u64>,
        mut ready_rx: mpsc::Receiver<()>,
        exit_rx: oneshot::Receiver<Option<i32>>,
    ) -> Result<()> {
        let timeout = self.inner.options.ready_timeout;

        let outcome = tokio::select! {
            biased;
            Some(()) = ready_rx.recv() => Readiness::Ready,
            code = exit_rx => Readiness::Exited(code.ok().flatten()),
            _ = tokio::time::sleep(timeout) => Readiness::TimedOut,
        };

        match outcome {
            Readiness::Ready => {
                info!("Server '{}' is ready", name);
                Ok(())
            }
            Readiness::Exited(code) => {
                // The ready line may have been written just before exiting.
                let seen = ready_rx.try_recv().is_ok()
                    || scan_from.is_some_and(|offset| log_has_pattern(log_file, offset, pattern));
                if seen {
                    info!("Server '{}' became ready and exited", name);
                    return Ok(());
                }
                let detail = match code {
                    Some(code) => format!("exit code {}", code),
                    None => "no exit code".to_string(),
                };
                Err(Error::process(
                    format!("Server '{}' exited before becoming ready ({})", name, detail),
                    None,
                ))
            }
            Readiness::TimedOut => {
                warn!("Server '{}' not ready after {:?}, killing PID {}", name, timeout, pid);
                if let Err(e) = signal_group(pid, libc::SIGKILL) {
                    warn!("Failed to kill server '{}' (PID {}): {}", name, pid, e);
                }
                let message = format!("Not ready within {}s, killed", timeout.as_secs());
                if let Err(e) = logs::append_event(log_file, TAG_FATAL, &message) {
                    warn!("{}", e);
                }
                Err(Error::StartTimeout {
                    name: name.to_string(),
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn connect_socket(&self, name: &str, socket: &SocketConfig) -> Result<Slot> {
        let address = socket.address();
        let timeout = self.inner.options.ready_timeout;

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::process(
                    format!("Failed to connect to server '{}' at {}", name, address),
                    Some(e),
                ))
            }
            Err(_) => {
                return Err(Error::StartTimeout {
                    name: name.to_string(),
                    secs: timeout.as_secs(),
                })
            }
        };
        info!("Connected to server '{}' at {}", name, address);

        let alive = Arc::new(AtomicBool::new(true));
        let monitor = tokio::spawn(monitor_socket(
            Arc::clone(&self.inner),
            name.to_string(),
            stream,
            Arc::clone(&alive),
        ));

        Ok(Slot::Socket {
            handle: ProcessHandle {
                name: name.to_string(),
                target: HandleTarget::Socket {
                    endpoint: socket.url(),
                },
                started_at: Utc::now(),
                log_file: None,
            },
            alive,
            monitor,
        })
    }

    /// Ask a server to terminate and forget its handle.
    ///
    /// Returns once SIGTERM has been sent to the server's process group; a
    /// background task sends SIGKILL if the group outlives the kill timeout.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let slot = {
            let mut table = self.inner.table();
            if matches!(table.get(name), Some(Slot::Starting)) {
                return Err(Error::process(
                    format!("Server '{}' is still starting", name),
                    None,
                ));
            }
            table
                .remove(name)
                .ok_or_else(|| Error::NotRunning(name.to_string()))?
        };

        match slot {
            Slot::Starting => Ok(()),
            Slot::Socket { alive, monitor, .. } => {
                alive.store(false, Ordering::SeqCst);
                monitor.abort();
                info!("Disconnected from server '{}'", name);
                Ok(())
            }
            Slot::Process { pid, handle } => {
                if !owns_pid(pid, handle.started_at) {
                    self.inner.record_stopped(name, pid);
                    return Err(Error::NotRunning(name.to_string()));
                }

                if let Err(e) = signal_group(pid, libc::SIGTERM) {
                    self.inner
                        .table()
                        .insert(name.to_string(), Slot::Process { pid, handle });
                    return Err(Error::process(
                        format!("Failed to stop server '{}' (PID {})", name, pid),
                        Some(e),
                    ));
                }
                info!("Sent SIGTERM to server '{}' (PID {})", name, pid);
                self.inner.record_stopped(name, pid);

                let grace = self.inner.options.kill_timeout;
                let name = name.to_string();
                self.inner
                    .terminations()
                    .spawn(escalate(name, pid, grace));
                Ok(())
            }
        }
    }

    /// Stop every tracked server, collecting each outcome.
    pub async fn stop_all(&self) -> BTreeMap<String, Result<()>> {
        let names: Vec<String> = self
            .inner
            .table()
            .iter()
            .filter(|(_, slot)| !matches!(slot, Slot::Starting))
            .map(|(name, _)| name.clone())
            .collect();

        let mut results = BTreeMap::new();
        for name in names {
            let result = self.stop(&name).await;
            if let Err(e) = &result {
                warn!("Failed to stop '{}': {}", name, e);
            }
            results.insert(name, result);
        }
        results
    }

    /// Wait for pending SIGTERM→SIGKILL escalations to finish.
    pub async fn wait_for_terminations(&self) {
        let mut pending = std::mem::take(&mut *self.inner.terminations());
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!("Termination task failed: {}", e);
            }
        }
    }

    /// Stop everything and wait until the stops are final. Embedding
    /// applications call this from their own exit path.
    pub async fn shutdown(&self) -> BTreeMap<String, Result<()>> {
        let results = self.stop_all().await;
        self.wait_for_terminations().await;
        results
    }

    /// Look up `name`, purging its handle if the process is gone.
    pub fn probe(&self, name: &str) -> Probe {
        let stale = {
            let mut table = self.inner.table();
            match table.get(name) {
                None => return Probe::Stopped,
                Some(Slot::Starting) => return Probe::Starting,
                Some(Slot::Process { pid, handle }) if owns_pid(*pid, handle.started_at) => {
                    return Probe::Running(handle.clone())
                }
                Some(Slot::Socket { handle, alive, .. }) if alive.load(Ordering::SeqCst) => {
                    return Probe::Running(handle.clone())
                }
                Some(_) => table.remove(name),
            }
        };

        if let Some(Slot::Process { pid, .. }) = stale {
            debug!("Purging stale handle for '{}' (PID {})", name, pid);
            self.inner.record_stopped(name, pid);
        }
        Probe::Stopped
    }

    pub fn is_running(&self, name: &str) -> bool {
        matches!(self.probe(name), Probe::Running(_))
    }

    /// Live handles, ordered by server name.
    pub fn running(&self) -> Vec<ProcessHandle> {
        let mut names: Vec<String> = self.inner.table().keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| match self.probe(&name) {
                Probe::Running(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }
}

/// Relay a child's stdout and stderr into `sink`, stderr lines tagged.
fn spawn_relays(
    child: &mut Child,
    sink: &Arc<LogSink>,
    pattern: Option<String>,
    ready: &mpsc::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let mut relays = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        relays.push(tokio::spawn(relay_lines(
            stdout,
            Arc::clone(sink),
            None,
            pattern.clone(),
            ready.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        relays.push(tokio::spawn(relay_lines(
            stderr,
            Arc::clone(sink),
            Some(TAG_ERROR),
            pattern,
            ready.clone(),
        )));
    }
    relays
}

async fn drain_relays(name: &str, relays: Vec<JoinHandle<()>>) {
    for relay in relays {
        if tokio::time::timeout(RELAY_DRAIN, relay).await.is_err() {
            debug!("Output of '{}' still open after exit", name);
        }
    }
}

/// Log tag, message and exit code describing how a child ended.
fn exit_event(status: &std::io::Result<ExitStatus>) -> (&'static str, String, Option<i32>) {
    match status {
        Ok(status) => match status.code() {
            Some(code) => (TAG_EXIT, format!("Process exited with code {}", code), Some(code)),
            None => (TAG_EXIT, format!("Process terminated ({})", status), None),
        },
        Err(e) => (TAG_FATAL, format!("Failed to wait for process: {}", e), None),
    }
}

/// Run `program` until it exits, appending its timestamped output and its
/// exit event to `log_file`. Returns the exit code.
///
/// This is the body of a relay helper process. The child inherits the
/// caller's process group and environment.
pub async fn relay_to_log(log_file: &Path, program: &Path, args: &[String]) -> Result<Option<i32>> {
    let sink = Arc::new(LogSink::open(log_file)?);

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            let message = format!("Failed to spawn {}", program.display());
            if let Err(log_err) = logs::append_event(log_file, TAG_FATAL, &format!("{}: {}", message, e)) {
                warn!("{}", log_err);
            }
            Error::process(message, Some(e))
        })?;

    // Nothing waits for readiness here; the manager scans the log instead.
    let (ready_tx, _) = mpsc::channel(1);
    let relays = spawn_relays(&mut child, &sink, None, &ready_tx);

    let status = child.wait().await;
    drain_relays(&program.display().to_string(), relays).await;

    let (tag, message, code) = exit_event(&status);
    sink.write_line(Some(tag), &message).await?;
    status.map_err(|e| Error::process(format!("Failed to wait for {}", program.display()), Some(e)))?;
    Ok(code)
}

/// Copy lines from a child's pipe into its log, flagging readiness.
async fn relay_lines<R>(
    stream: R,
    sink: Arc<LogSink>,
    tag: Option<&'static str>,
    pattern: Option<String>,
    ready: mpsc::Sender<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                let line = line.trim_end_matches('\r');
                if let Err(e) = sink.write_line(tag, line).await {
                    warn!("{}", e);
                }
                if pattern.as_deref().is_some_and(|p| line.contains(p)) {
                    let _ = ready.try_send(());
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Output relay for {} ended: {}", sink.path().display(), e);
                break;
            }
        }
    }
}

/// Poll a directly-written log for `pattern` past `offset`.
async fn scan_log_for(path: PathBuf, offset: u64, pattern: String, ready: mpsc::Sender<()>) {
    loop {
        tokio::time::sleep(LOG_POLL).await;
        if ready.is_closed() {
            return;
        }
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if contains_after(&bytes, offset, &pattern) {
                let _ = ready.send(()).await;
                return;
            }
        }
    }
}

fn contains_after(bytes: &[u8], offset: u64, pattern: &str) -> bool {
    let fresh = bytes.get(offset as usize..).unwrap_or_default();
    String::from_utf8_lossy(fresh).contains(pattern)
}

fn log_has_pattern(path: &Path, offset: u64, pattern: &str) -> bool {
    std::fs::read(path)
        .map(|bytes| contains_after(&bytes, offset, pattern))
        .unwrap_or(false)
}

#[allow(clippy::too_many_arguments)]
async fn watch_exit(
    inner: Arc<Inner>,
    name: String,
    pid: u32,
    mut child: Child,
    relays: Vec<JoinHandle<()>>,
    sink: Option<Arc<LogSink>>,
    exit_log: Option<PathBuf>,
    exit_tx: oneshot::Sender<Option<i32>>,
) {
    let status = child.wait().await;
    drain_relays(&name, relays).await;

    let (tag, message, code) = exit_event(&status);
    let logged = match (&sink, &exit_log) {
        (Some(sink), _) => sink.write_line(Some(tag), &message).await,
        (None, Some(path)) => logs::append_event(path, tag, &message),
        (None, None) => Ok(()),
    };
    if let Err(e) = logged {
        warn!("{}", e);
    }
    info!("Server '{}' (PID {}): {}", name, pid, message);

    inner.forget_process(&name, pid);
    let _ = exit_tx.send(code);
}

/// Treat the connection as the server: it is running until EOF or error.
async fn monitor_socket(inner: Arc<Inner>, name: String, mut stream: TcpStream, alive: Arc<AtomicBool>) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                info!("Server '{}' closed the connection", name);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("Connection to server '{}' failed: {}", name, e);
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    inner.forget_socket(&name, &alive);
}

/// SIGKILL the group of `pid` if it is still alive after `grace`.
async fn escalate(name: String, pid: u32, grace: Duration) {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !group_alive(pid) {
            debug!("Server '{}' (PID {}) terminated", name, pid);
            return;
        }
        tokio::time::sleep(TERMINATION_POLL).await;
    }

    if group_alive(pid) {
        warn!(
            "Server '{}' (PID {}) ignored SIGTERM for {:?}, sending SIGKILL",
            name, pid, grace
        );
        if let Err(e) = signal_group(pid, libc::SIGKILL) {
            warn!("Failed to kill server '{}' (PID {}): {}", name, pid, e);
        }
    }
}

fn as_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}

/// Zero-signal liveness probe. Any failure, including "no such process",
/// reports `false`.
pub fn is_alive(pid: u32) -> bool {
    match as_pid(pid) {
        Some(pid) => unsafe { libc::kill(pid, 0) == 0 },
        None => false,
    }
}

/// Whether `pid` is alive and is still the process started at `started_at`.
/// A pid the OS has recycled for an unrelated process fails this check.
fn owns_pid(pid: u32, started_at: DateTime<Utc>) -> bool {
    if !is_alive(pid) {
        return false;
    }
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::new(),
    );
    match system.process(target).map(|process| process.start_time()) {
        // Start time unavailable on this platform; liveness is all we have.
        None | Some(0) => true,
        Some(secs) => {
            let secs = i64::try_from(secs).unwrap_or(i64::MAX);
            (secs - started_at.timestamp()).abs() <= START_TIME_SLACK_SECS
        }
    }
}

fn group_alive(pid: u32) -> bool {
    match as_pid(pid) {
        Some(pgid) => (unsafe { libc::killpg(pgid, 0) } == 0) || is_alive(pid),
        None => false,
    }
}

/// Signal the process group led by `pid`, falling back to `pid` alone when
/// it leads no group. A target that is already gone is not an error.
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let Some(pid) = as_pid(pid) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid PID {}", pid),
        ));
    };

    if unsafe { libc::killpg(pid, signal) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        return Err(err);
    }

    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn manager(dir: &TempDir, options: ManagerOptions) -> ProcessManager {
        ProcessManager::load(&ConfigPaths::sandboxed(dir.path()), options).unwrap()
    }

    fn shell(name: &str, script: &str) -> ServerRecord {
        ServerRecord::command(name, "sh", ["-c", script])
    }

    fn with_pattern(pattern: &str) -> ManagerOptions {
        ManagerOptions {
            ready_pattern: Some(pattern.to_string()),
            ..ManagerOptions::default()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn log_contains(path: &Path, needle: &str) -> bool {
        std::fs::read_to_string(path)
            .map(|content| content.contains(needle))
            .unwrap_or(false)
    }

    #[test]
    fn test_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_start_status_stop_scenario() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManagerOptions::default());
        let alpha = shell("alpha", "echo hi; sleep 30");

        let handle = manager.start(&alpha).await.unwrap();
        let pid = handle.pid().unwrap();
        assert!(is_alive(pid));
        assert_eq!(manager.probe("alpha"), Probe::Running(handle.clone()));

        manager.stop("alpha").await.unwrap();
        assert_eq!(manager.probe("alpha"), Probe::Stopped);
        manager.wait_for_terminations().await;
        assert!(eventually(|| !is_alive(pid)).await);

        let log = manager.log_file("alpha");
        assert!(eventually(|| log_contains(&log, "] hi")).await);
    }

    #[tokio::test]
    async fn test_second_start_fails_while_running() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManagerOptions::default());
        let record = shell("alpha", "sleep 30");

        manager.start(&record).await.unwrap();
        let err = manager.start(&record).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
        assert_eq!(manager.running().len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_one_handle() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, with_pattern("up"));
        let record = shell("alpha", "sleep 0.2; echo up; sleep 30");

        let (a, b) = tokio::join!(manager.start(&record), manager.start(&record));
        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "{:?}", outcomes);
        let failure = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert!(matches!(failure, Error::AlreadyRunning(_)));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_without_handle_is_not_running() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManagerOptions::default());
        let err = manager.stop("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotRunning(_)));
        assert_eq!(err.kind(), crate::ErrorKind::Process);
    }

    #[tokio::test]
    async fn test_relay_timestamps_output_and_records_exit() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManagerOptions::default());
        manager
            .start(&shell("chatty", "echo out; echo err >&2; exit 0"))
            .await
            .unwrap();

        let log = manager.log_file("chatty");
        assert!(eventually(|| log_contains(&log, "[EXIT] Process exited with code 0")).await);
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("] out\n"), "{}", content);
        assert!(content.contains("] [ERROR] err\n"), "{}", content);
        assert!(content.lines().all(|line| line.starts_with("[20")), "{}", content);

        assert!(eventually(|| manager.probe("chatty") == Probe::Stopped).await);
    }

    #[tokio::test]
    async fn test_ready_pattern_waits_for_line() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, with_pattern("Available on"));
        let handle = manager
            .start(&shell("ready", "sleep 0.2; echo Available on stdio; sleep 30"))
            .await
            .unwrap();

        assert!(log_contains(handle.log_file.as_ref().unwrap(), "Available on stdio"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_ready_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let options = ManagerOptions {
            ready_timeout: Duration::from_millis(300),
            ..with_pattern("never printed")
        };
        let manager = manager(&dir, options);

        let err = manager.start(&shell("slow", "sleep 30")).await.unwrap_err();
        assert!(matches!(err, Error::StartTimeout { .. }));
        assert_eq!(manager.probe("slow"), Probe::Stopped);

        let log = manager.log_file("slow");
        assert!(eventually(|| log_contains(&log, "[EXIT]")).await);
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_process_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, with_pattern("ready"));
        let err = manager.start(&shell("crash", "exit 3")).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Process);
        assert!(err.to_string().contains("exit code 3"), "{}", err);
        assert_eq!(manager.probe("crash"), Probe::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_command_creates_no_handle() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManagerOptions::default());
        let record = ServerRecord::command("missing", "definitely-not-a-real-binary-xyz", ["a"]);

        let err = manager.start(&record).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Process);
        assert_eq!(manager.probe("missing"), Probe::Stopped);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let dir = TempDir::new().unwrap();
        let options = ManagerOptions {
            kill_timeout: Duration::from_millis(300),
            ..with_pattern("armed")
        };
        let manager = manager(&dir, options);

        let handle = manager
            .start(&shell("stubborn", "trap '' TERM; echo armed; sleep 30"))
            .await
            .unwrap();
        let pid = handle.pid().unwrap();

        manager.stop("stubborn").await.unwrap();
        manager.wait_for_terminations().await;
        assert!(eventually(|| !is_alive(pid)).await);
    }

    #[tokio::test]
    async fn test_handles_survive_manager_restart() {
        let dir = TempDir::new().unwrap();
        let options = ManagerOptions::default().with_capture(LogCapture::Direct);
        let first = manager(&dir, options.clone());
        let handle = first.start(&shell("detached", "sleep 30")).await.unwrap();

        let second = manager(&dir, options);
        assert_eq!(second.probe("detached"), Probe::Running(handle.clone()));
        second.stop("detached").await.unwrap();
        second.wait_for_terminations().await;

        let third = manager(&dir, ManagerOptions::default());
        assert_eq!(third.probe("detached"), Probe::Stopped);
    }

    #[tokio::test]
    async fn test_load_purges_dead_handles() {
        let dir = TempDir::new().unwrap();
        let paths = ConfigPaths::sandboxed(dir.path());

        let mut finished = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = finished.id();
        finished.wait().unwrap();

        let stale = ProcessHandle {
            name: "gone".into(),
            target: HandleTarget::Process { pid: dead_pid },
            started_at: Utc::now(),
            log_file: None,
        };
        let mut state = State::default();
        state.servers.insert("gone".into(), stale);
        write_json_atomic(&paths.state_file(), &state).unwrap();

        let manager = ProcessManager::load(&paths, ManagerOptions::default()).unwrap();
        assert_eq!(manager.probe("gone"), Probe::Stopped);
        assert!(read_state(&paths.state_file()).servers.is_empty());
    }

    #[tokio::test]
    async fn test_load_purges_handle_whose_pid_was_reused() {
        let dir = TempDir::new().unwrap();
        let paths = ConfigPaths::sandboxed(dir.path());

        // A live pid, but recorded for a process started an hour from now
        let recycled = ProcessHandle {
            name: "recycled".into(),
            target: HandleTarget::Process {
                pid: std::process::id(),
            },
            started_at: Utc::now() + chrono::Duration::hours(1),
            log_file: None,
        };
        let mut state = State::default();
        state.servers.insert("recycled".into(), recycled);
        write_json_atomic(&paths.state_file(), &state).unwrap();

        let manager = ProcessManager::load(&paths, ManagerOptions::default()).unwrap();
        assert_eq!(manager.probe("recycled"), Probe::Stopped);
        assert!(matches!(manager.stop("recycled").await, Err(Error::NotRunning(_))));
        assert!(read_state(&paths.state_file()).servers.is_empty());
        assert!(is_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_ready_line_then_immediate_exit_counts_as_ready() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, with_pattern("ready"));

        for i in 0..10 {
            let name = format!("blip{}", i);
            let handle = manager.start(&shell(&name, "echo ready")).await.unwrap();
            assert_eq!(handle.name, name);
            assert!(eventually(|| manager.probe(&name) == Probe::Stopped).await);
        }
    }

    #[tokio::test]
    async fn test_direct_ready_line_then_exit_counts_as_ready() {
        let dir = TempDir::new().unwrap();
        let options = with_pattern("ready").with_capture(LogCapture::Direct);
        let manager = manager(&dir, options);

        manager.start(&shell("blip", "echo ready")).await.unwrap();
        assert!(eventually(|| manager.probe("blip") == Probe::Stopped).await);
    }

    #[tokio::test]
    async fn test_relay_to_log_timestamps_child_output() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("logs").join("relayed.log");
        let args: Vec<String> = ["-c", "echo out; echo err >&2; exit 4"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();

        let code = relay_to_log(&log, Path::new("sh"), &args).await.unwrap();
        assert_eq!(code, Some(4));

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("] out\n"), "{}", content);
        assert!(content.contains("] [ERROR] err\n"), "{}", content);
        assert!(content.contains("[EXIT] Process exited with code 4"), "{}", content);
        assert!(content.lines().all(|line| line.starts_with("[20")), "{}", content);
    }

    #[tokio::test]
    async fn test_relay_to_log_missing_program_is_fatal() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("missing.log");

        let err = relay_to_log(&log, Path::new("definitely-not-a-real-binary-xyz"), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Process);
        assert!(log_contains(&log, "[FATAL]"));
    }

    #[tokio::test]
    async fn test_socket_handle_tracks_connection() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManagerOptions::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let record = ServerRecord::socket("remote", "127.0.0.1", port);
        let handle = manager.start(&record).await.unwrap();
        assert_eq!(handle.endpoint(), Some(format!("ws://127.0.0.1:{}", port).as_str()));
        assert!(manager.is_running("remote"));

        let (accepted, _) = listener.accept().await.unwrap();
        drop(accepted);
        assert!(eventually(|| manager.probe("remote") == Probe::Stopped).await);
    }

    #[tokio::test]
    async fn test_socket_connection_refused() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManagerOptions::default());
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = manager
            .start(&ServerRecord::socket("remote", "127.0.0.1", port))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Process);
        assert_eq!(manager.probe("remote"), Probe::Stopped);
    }

    #[tokio::test]
    async fn test_stop_all_reports_each_server() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ManagerOptions::default());
        manager.start(&shell("a", "sleep 30")).await.unwrap();
        manager.start(&shell("b", "sleep 30")).await.unwrap();

        let results = manager.shutdown().await;
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(results.values().all(|r| r.is_ok()));
        assert!(manager.running().is_empty());
    }
}
