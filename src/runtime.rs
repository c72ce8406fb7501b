//! Worker process supervision.
//!
//! `Runtime::spawn` launches one short-lived worker child, pumps its stdout
//! and stderr through [`LogCodec`](crate::protocol::LogCodec) into a
//! broadcast stream of records, and exposes the `ready` / `exit` one-shot
//! conditions plus `kill`. A FATAL record causes the supervisor to kill the
//! worker and emit a synthetic `runtime-status = killed` record after it.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use futures::StreamExt;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::config::EmulatorConfig;
use crate::error::EmulatorError;
use crate::protocol::{LogCodec, LogLevel, LogRecord, RUNTIME_STATUS};

/// Broadcast capacity per worker; a worker that outruns this by more than
/// the buffer loses oldest records for slow subscribers (they observe a
/// `Lagged` gap, never reordered records).
const EVENT_CAPACITY: usize = 256;

/// Per-invocation input handed to a worker at spawn. Serialized once; never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeBundle {
    pub project_id: String,
    pub cwd: PathBuf,
    /// Empty string means a diagnostic run: enumerate triggers and exit.
    pub trigger_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto: Option<Value>,
    pub ports: HashMap<String, u16>,
    pub disabled_features: Vec<String>,
}

impl RuntimeBundle {
    pub fn new(
        config: &EmulatorConfig,
        ports: HashMap<String, u16>,
        trigger_id: impl Into<String>,
        proto: Option<Value>,
    ) -> Self {
        Self {
            project_id: config.project_id.clone(),
            cwd: config.functions_dir.clone(),
            trigger_id: trigger_id.into(),
            proto,
            ports,
            disabled_features: config.disabled_features.clone(),
        }
    }

    pub fn diagnostic(config: &EmulatorConfig, ports: HashMap<String, u16>) -> Self {
        Self::new(config, ports, "", None)
    }

    pub fn is_diagnostic(&self) -> bool {
        self.trigger_id.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct WorkerOpts {
    /// Pre-serialized trigger list; enables the worker's cached-trigger
    /// fast path when present.
    pub serialized_triggers: Option<String>,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillSignal {
    #[default]
    Term,
    Kill,
}

impl From<KillSignal> for Signal {
    fn from(signal: KillSignal) -> Signal {
        match signal {
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }
}

#[derive(Debug, Clone)]
enum ReadyState {
    Pending,
    Ready(String),
    Failed,
}

struct Shared {
    events_tx: broadcast::Sender<LogRecord>,
    /// Every record emitted so far, in emission order. Lets a waiter created
    /// after spawn observe records that raced ahead of its subscription.
    history: StdMutex<Vec<LogRecord>>,
    killed: AtomicBool,
    pid: Option<i32>,
}

impl Shared {
    fn emit(&self, record: LogRecord) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(record.clone());
        let _ = self.events_tx.send(record);
    }

    /// Idempotent. Emits the synthetic `killed` record before delivering the
    /// signal so it always follows whatever record triggered the kill.
    fn kill(&self, kill_signal: KillSignal) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.emit(LogRecord::killed());
        }
        if let Some(pid) = self.pid {
            match signal::kill(Pid::from_raw(pid), Signal::from(kill_signal)) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "failed to signal worker"),
            }
        }
    }
}

/// Live handle on one worker process. Owned by the invocation (or loader)
/// that spawned it; dropping it after exit releases the event stream.
pub struct Runtime {
    pid: Option<u32>,
    shared: Arc<Shared>,
    metadata: Arc<DashMap<String, String>>,
    ready_rx: watch::Receiver<ReadyState>,
    exit_rx: watch::Receiver<Option<i32>>,
    pipes_done_rx: watch::Receiver<bool>,
    display_rx: StdMutex<Option<broadcast::Receiver<LogRecord>>>,
}

impl Runtime {
    /// Spawn a worker for `bundle`. The worker inherits the ambient
    /// environment plus `opts.env` and the `node` key, runs with cwd =
    /// `bundle.cwd`, and is invoked as
    /// `<node_binary> <runtime_entry> <bundle-json> <triggers-json>`.
    pub fn spawn(
        config: &EmulatorConfig,
        bundle: &RuntimeBundle,
        opts: WorkerOpts,
    ) -> Result<Runtime, EmulatorError> {
        let bundle_json = serde_json::to_string(bundle)
            .map_err(|e| EmulatorError::SpawnFailed(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let triggers_json = opts.serialized_triggers.unwrap_or_default();

        let mut command = Command::new(&config.node_binary);
        command
            .arg(&config.runtime_entry)
            .arg(&bundle_json)
            .arg(&triggers_json)
            .current_dir(&bundle.cwd)
            .env("node", &config.node_binary)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &opts.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(EmulatorError::SpawnFailed)?;
        let pid = child.id();
        debug!(pid, trigger = %bundle.trigger_id, "spawned worker");

        let stdout = child.stdout.take().ok_or_else(|| {
            EmulatorError::SpawnFailed(io::Error::new(io::ErrorKind::Other, "worker stdout not piped"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            EmulatorError::SpawnFailed(io::Error::new(io::ErrorKind::Other, "worker stderr not piped"))
        })?;

        let (events_tx, supervisor_rx) = broadcast::channel(EVENT_CAPACITY);
        let display_rx = events_tx.subscribe();
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (pipes_done_tx, pipes_done_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            events_tx,
            history: StdMutex::new(Vec::new()),
            killed: AtomicBool::new(false),
            pid: pid.map(|p| p as i32),
        });
        let metadata = Arc::new(DashMap::new());

        let pump_out = tokio::spawn(pump_pipe(stdout, shared.clone()));
        let pump_err = tokio::spawn(pump_pipe(stderr, shared.clone()));

        tokio::spawn(supervise(
            supervisor_rx,
            pipes_done_rx.clone(),
            ready_tx,
            shared.clone(),
            metadata.clone(),
        ));

        // Reaps the child once both pipes hit EOF, so exit is only observed
        // after the log stream is fully drained.
        tokio::spawn(async move {
            let _ = pump_out.await;
            let _ = pump_err.await;
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!(error = %e, "failed to reap worker");
                    -1
                }
            };
            debug!(pid, code, "worker exited");
            let _ = exit_tx.send(Some(code));
            let _ = pipes_done_tx.send(true);
        });

        Ok(Runtime {
            pid,
            shared,
            metadata,
            ready_rx,
            exit_rx,
            pipes_done_rx,
            display_rx: StdMutex::new(Some(display_rx)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Metadata captured from control records; `socketPath` once ready.
    pub fn metadata(&self) -> &DashMap<String, String> {
        &self.metadata
    }

    /// New subscription starting at the current stream tail.
    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.shared.events_tx.subscribe()
    }

    /// The receiver created at spawn time, which sees the stream from the
    /// first record. Intended for the display forwarder; yields `None` on
    /// the second call.
    pub fn take_events(&self) -> Option<broadcast::Receiver<LogRecord>> {
        self.display_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Completes with the announced IPC socket path, or
    /// `WorkerExitedBeforeReady` if the worker dies first. No timeout at
    /// this layer.
    pub async fn ready(&self) -> Result<String, EmulatorError> {
        let mut rx = self.ready_rx.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ReadyState::Ready(socket_path) => return Ok(socket_path),
                ReadyState::Failed => return Err(EmulatorError::WorkerExitedBeforeReady),
                ReadyState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(EmulatorError::WorkerExitedBeforeReady);
            }
        }
    }

    /// Exit code, after both pipes are drained. Signal deaths map to
    /// `128 + signo`.
    pub async fn exited(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return code;
            }
            if rx.changed().await.is_err() {
                return -1;
            }
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Idempotent; safe after exit.
    pub fn kill(&self, signal: KillSignal) {
        self.shared.kill(signal);
    }

    /// Installs a waiter for the first record matching `level` (and `kind`,
    /// when given). Install the waiter before the act that may emit the
    /// record, then `recv()` it.
    pub fn waiter(&self, level: LogLevel, kind: Option<&str>) -> LogWaiter {
        self.waiter_with(level, kind, |_| true)
    }

    pub fn waiter_with(
        &self,
        level: LogLevel,
        kind: Option<&str>,
        predicate: impl Fn(&LogRecord) -> bool + Send + 'static,
    ) -> LogWaiter {
        // Subscribe before snapshotting the history so no record can fall
        // between the two. A record landing in both is matched only once.
        let rx = self.shared.events_tx.subscribe();
        let backlog = self
            .shared
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        LogWaiter {
            rx,
            pipes_done: self.pipes_done_rx.clone(),
            backlog,
            level,
            kind: kind.map(str::to_string),
            predicate: Box::new(predicate),
        }
    }
}

/// Pending subscription for the first matching record; resolves
/// `NoMatchingLog` once the worker's pipes close without a match.
pub struct LogWaiter {
    rx: broadcast::Receiver<LogRecord>,
    pipes_done: watch::Receiver<bool>,
    backlog: Vec<LogRecord>,
    level: LogLevel,
    kind: Option<String>,
    predicate: Box<dyn Fn(&LogRecord) -> bool + Send>,
}

impl LogWaiter {
    fn matches(&self, record: &LogRecord) -> bool {
        record.level == self.level
            && self.kind.as_deref().map_or(true, |kind| record.kind == kind)
            && (self.predicate)(record)
    }

    pub async fn recv(mut self) -> Result<LogRecord, EmulatorError> {
        for record in std::mem::take(&mut self.backlog) {
            if self.matches(&record) {
                return Ok(record);
            }
        }
        loop {
            if *self.pipes_done.borrow_and_update() {
                // Stream is complete; whatever is still buffered decides it.
                loop {
                    match self.rx.try_recv() {
                        Ok(record) if self.matches(&record) => return Ok(record),
                        Ok(_) => {}
                        Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                        Err(_) => return Err(EmulatorError::NoMatchingLog),
                    }
                }
            }
            tokio::select! {
                result = self.rx.recv() => match result {
                    Ok(record) if self.matches(&record) => return Ok(record),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(EmulatorError::NoMatchingLog)
                    }
                },
                result = self.pipes_done.changed() => {
                    if result.is_err() {
                        return Err(EmulatorError::NoMatchingLog);
                    }
                }
            }
        }
    }
}

async fn pump_pipe<R>(pipe: R, shared: Arc<Shared>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(pipe, LogCodec::new());
    while let Some(next) = frames.next().await {
        match next {
            Ok(record) => shared.emit(record),
            Err(e) => {
                debug!(error = %e, "worker pipe read failed");
                break;
            }
        }
    }
}

/// Watches the stream for the ready announcement and FATAL records. Owns
/// the ready state: it marks failure only after the drained stream is known
/// to hold no ready record.
async fn supervise(
    mut rx: broadcast::Receiver<LogRecord>,
    mut pipes_done: watch::Receiver<bool>,
    ready_tx: watch::Sender<ReadyState>,
    shared: Arc<Shared>,
    metadata: Arc<DashMap<String, String>>,
) {
    let handle = |record: LogRecord| {
        if record.is_system(RUNTIME_STATUS) && record.text == "ready" {
            let socket_path = record.data_str("socketPath").unwrap_or_default().to_string();
            metadata.insert("socketPath".to_string(), socket_path.clone());
            ready_tx.send_if_modified(|state| {
                if matches!(state, ReadyState::Pending) {
                    *state = ReadyState::Ready(socket_path.clone());
                    true
                } else {
                    false
                }
            });
        } else if record.level == LogLevel::Fatal {
            shared.kill(KillSignal::default());
        }
    };

    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(record) => handle(record),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            result = pipes_done.changed() => {
                if result.is_err() || *pipes_done.borrow() {
                    loop {
                        match rx.try_recv() {
                            Ok(record) => handle(record),
                            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
    }

    ready_tx.send_if_modified(|state| {
        if matches!(state, ReadyState::Pending) {
            *state = ReadyState::Failed;
            true
        } else {
            false
        }
    });
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(-1)
}
