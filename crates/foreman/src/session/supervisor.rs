use std::{
    collections::BTreeMap,
    env, fs,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use sha2::{Digest, Sha256};
use serde_json::{json, Value};
use stream_events::{EngineConfig, PumpOutcome, StreamCounters, StreamEngine, StreamRecord, TerminalReason};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin, Command},
    sync::{mpsc, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    checkpoint::CheckpointManager,
    config::ServerConfig,
    error::ServerError,
    events::{EventBus, ServerEvent},
    locator::BinaryLocator,
    paths::StateLayout,
    registry::{liveness, ProcessRegistry},
    session::{unix_ms, CreateSessionRequest, SessionId, SessionSnapshot, SessionState},
};

/// Optional per-session callbacks: one before the child is spawned, one
/// after the session reaches a terminal state.
#[derive(Clone, Default)]
pub struct SessionHooks {
    pub pre_spawn: Option<Arc<dyn Fn(&SessionSnapshot) + Send + Sync>>,
    pub post_terminate: Option<Arc<dyn Fn(&SessionSnapshot) + Send + Sync>>,
}

struct OutboundMessage {
    line: String,
    reply: oneshot::Sender<Result<(), ServerError>>,
}

/// Everything about one session that outlives `create_session`.
///
/// State is mutated only by the session's own supervisor task (and the
/// state machine is absorbing at terminal states); everyone else reads
/// through [`SessionSnapshot`]s.
struct SessionShared {
    id: SessionId,
    model: Option<String>,
    created_at_unix_ms: u64,
    deadline_unix_ms: u64,
    parent_checkpoint: Option<String>,
    prompt_sha256: String,
    counters: Arc<StreamCounters>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    pid: Mutex<Option<u32>>,
    exit_code: Mutex<Option<i32>>,
    stdin_tx: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
}

impl SessionShared {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            state: *lock(&self.state),
            model: self.model.clone(),
            created_at_unix_ms: self.created_at_unix_ms,
            deadline_unix_ms: self.deadline_unix_ms,
            parent_checkpoint: self.parent_checkpoint.clone(),
            prompt_sha256: self.prompt_sha256.clone(),
            pid: *lock(&self.pid),
            exit_code: *lock(&self.exit_code),
            input_bytes: self.counters.input_bytes.load(Ordering::Relaxed),
            output_bytes: self.counters.output_bytes.load(Ordering::Relaxed),
            records_emitted: self.counters.records_emitted.load(Ordering::Relaxed),
            records_dropped: self.counters.records_dropped.load(Ordering::Relaxed),
            last_record_unix_ms: self.counters.last_record_unix_ms.load(Ordering::Relaxed),
        }
    }

    /// Applies a transition unless the session is already terminal.
    /// Returns the state actually in effect afterwards.
    fn transition(&self, to: SessionState, events: &EventBus) -> SessionState {
        let mut state = lock(&self.state);
        if state.is_terminal() {
            return *state;
        }
        *state = to;
        drop(state);
        events.publish(ServerEvent::SessionTransition {
            session: self.id.to_string(),
            state: to.as_str(),
        });
        to
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single authority over session lifecycles: spawns children, wires the
/// stream engine to their stdio, enforces limits and timeouts, and drives
/// every state transition.
pub struct SessionSupervisor {
    config: Arc<ServerConfig>,
    layout: StateLayout,
    locator: Arc<BinaryLocator>,
    registry: Arc<ProcessRegistry>,
    checkpoints: Arc<CheckpointManager>,
    events: EventBus,
    hooks: SessionHooks,
    server_cancel: CancellationToken,
    sessions: Mutex<BTreeMap<SessionId, Arc<SessionShared>>>,
    next_id: AtomicU64,
}

impl SessionSupervisor {
    pub fn new(
        config: Arc<ServerConfig>,
        layout: StateLayout,
        locator: Arc<BinaryLocator>,
        registry: Arc<ProcessRegistry>,
        checkpoints: Arc<CheckpointManager>,
        events: EventBus,
        hooks: SessionHooks,
        server_cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            layout,
            locator,
            registry,
            checkpoints,
            events,
            hooks,
            server_cancel,
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates and starts a session. On success the caller receives the
    /// snapshot plus the receiving half of the session's bounded record
    /// queue; ownership of that queue is the caller's (the frontend
    /// drains it to the peer).
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<(SessionSnapshot, mpsc::Receiver<StreamRecord>), ServerError> {
        if request.prompt.trim().is_empty() {
            return Err(ServerError::InvalidRequest {
                message: "prompt must not be empty".to_string(),
            });
        }

        let active = self.active_count();
        if active >= self.config.max_sessions {
            return Err(ServerError::SessionLimit {
                max: self.config.max_sessions,
            });
        }

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let now = unix_ms();
        let shared = Arc::new(SessionShared {
            id: id.clone(),
            model: request.model.clone(),
            created_at_unix_ms: now,
            deadline_unix_ms: now + self.config.session_deadline.as_millis() as u64,
            parent_checkpoint: request.parent_checkpoint.clone(),
            prompt_sha256: hex::encode(Sha256::digest(request.prompt.as_bytes())),
            counters: Arc::new(StreamCounters::default()),
            cancel: self.server_cancel.child_token(),
            state: Mutex::new(SessionState::Created),
            pid: Mutex::new(None),
            exit_code: Mutex::new(None),
            stdin_tx: Mutex::new(None),
        });
        lock(&self.sessions).insert(id.clone(), shared.clone());
        self.events.publish(ServerEvent::SessionTransition {
            session: id.to_string(),
            state: SessionState::Created.as_str(),
        });

        match self.start_session(&shared, request).await {
            Ok(rx) => Ok((shared.snapshot(), rx)),
            Err(err) => {
                shared.transition(SessionState::Failed, &self.events);
                // A failed create leaves nothing behind.
                let _ = self.registry.unregister(id.as_str());
                let _ = fs::remove_dir_all(self.layout.session_dir(id.as_str()));
                Err(err)
            }
        }
    }

    async fn start_session(
        &self,
        shared: &Arc<SessionShared>,
        request: CreateSessionRequest,
    ) -> Result<mpsc::Receiver<StreamRecord>, ServerError> {
        let binary = self.locator.resolve(false).await?;

        let workdir = self.layout.session_dir(shared.id.as_str());
        fs::create_dir_all(&workdir)
            .map_err(|source| ServerError::io("create", &workdir, source))?;
        if let Some(parent) = &request.parent_checkpoint {
            // Restoring a tree walks and decompresses blobs; keep it off
            // the async workers so other sessions' streams keep moving.
            let checkpoints = self.checkpoints.clone();
            let parent = parent.clone();
            let target = workdir.clone();
            tokio::task::spawn_blocking(move || checkpoints.restore(&parent, &target, false))
                .await
                .map_err(|err| ServerError::Internal {
                    message: format!("restore task failed: {err}"),
                })??;
        }

        shared.transition(SessionState::Starting, &self.events);
        if let Some(hook) = &self.hooks.pre_spawn {
            hook(&shared.snapshot());
        }

        let mut command = Command::new(&binary.path);
        if let Some(model) = &request.model {
            command.arg("--model").arg(model);
        }
        command
            .current_dir(&workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .env_clear();
        for key in &self.config.env_allowlist {
            if let Ok(value) = env::var(key) {
                command.env(key, value);
            }
        }

        let mut child = spawn_with_retry(&mut command, &binary.path).await?;
        let pid = child.id().ok_or_else(|| ServerError::Internal {
            message: "spawned child has no pid".to_string(),
        })?;

        let argv_sha256 = argv_fingerprint(&binary.path, request.model.as_deref());
        if let Err(err) = self
            .registry
            .register(shared.id.as_str(), pid, &binary.path, argv_sha256)
        {
            let _ = child.start_kill();
            return Err(err);
        }

        let stdin = child.stdin.take().ok_or_else(|| ServerError::Internal {
            message: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ServerError::Internal {
            message: "child stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ServerError::Internal {
            message: "child stderr unavailable".to_string(),
        })?;

        *lock(&shared.pid) = Some(pid);
        shared.transition(SessionState::Running, &self.events);
        info!(session = %shared.id, pid, binary = %binary.path.display(), "session running");

        let (record_tx, record_rx) = mpsc::channel(self.config.queue_capacity);
        let (stdin_tx, stdin_rx) = mpsc::channel::<OutboundMessage>(16);
        *lock(&shared.stdin_tx) = Some(stdin_tx.clone());
        tokio::spawn(writer_task(stdin, stdin_rx, shared.counters.clone()));

        // The prompt is the first framed message on the child's stdin.
        let prompt_line = serde_json::to_string(&json!({
            "type": "prompt",
            "prompt": request.prompt,
            "context": request.context,
        }))
        .map_err(|source| ServerError::Encode {
            context: "prompt message",
            source,
        })?;
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = stdin_tx
            .send(OutboundMessage {
                line: prompt_line,
                reply: ack_tx,
            })
            .await;
        tokio::spawn(async move {
            // A child that never reads stdin is fine; surface nothing.
            let _ = ack_rx.await;
        });

        let engine_config = EngineConfig {
            max_line_bytes: self.config.max_line_bytes,
            stderr_ring_bytes: self.config.stderr_ring_bytes,
            error_prefix_bytes: 256,
        };
        tokio::spawn(run_session(
            shared.clone(),
            child,
            stdout,
            stderr,
            record_tx,
            engine_config,
            SessionTimeouts {
                kill_grace: self.config.kill_grace,
                zombie_timeout: self.config.zombie_timeout,
                idle_timeout: self.config.idle_timeout,
                deadline: self.config.session_deadline,
            },
            self.registry.clone(),
            self.events.clone(),
            self.hooks.clone(),
        ));

        Ok(record_rx)
    }

    /// Writes one framed message to the session's stdin. Serialized per
    /// session: the writer task performs one write at a time.
    pub async fn send_message(
        &self,
        id: &SessionId,
        content: Value,
        deadline: Option<Duration>,
    ) -> Result<(), ServerError> {
        let shared = self.get(id)?;
        let state = *lock(&shared.state);
        if state != SessionState::Running {
            return Err(ServerError::SessionNotRunning {
                id: id.to_string(),
                state: state.as_str().to_string(),
            });
        }
        let Some(tx) = lock(&shared.stdin_tx).clone() else {
            return Err(ServerError::SessionNotRunning {
                id: id.to_string(),
                state: state.as_str().to_string(),
            });
        };

        let line = serde_json::to_string(&content).map_err(|source| ServerError::Encode {
            context: "outbound message",
            source,
        })?;
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(OutboundMessage {
                line,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Err(ServerError::SessionNotRunning {
                id: id.to_string(),
                state: "terminating".to_string(),
            });
        }

        let timeout = deadline.unwrap_or(self.config.write_timeout);
        match time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ServerError::SessionNotRunning {
                id: id.to_string(),
                state: "terminating".to_string(),
            }),
            Err(_) => Err(ServerError::WriteTimeout {
                id: id.to_string(),
                timeout,
            }),
        }
    }

    /// Requests cancellation. Re-cancelling a terminal session is a no-op
    /// success; the returned state is the one observed at call time.
    pub fn cancel_session(&self, id: &SessionId) -> Result<SessionState, ServerError> {
        let shared = self.get(id)?;
        let state = *lock(&shared.state);
        if state.is_terminal() {
            return Ok(state);
        }
        debug!(session = %id, "cancellation requested");
        shared.cancel.cancel();
        Ok(state)
    }

    pub fn get_session(&self, id: &SessionId) -> Result<SessionSnapshot, ServerError> {
        Ok(self.get(id)?.snapshot())
    }

    pub fn list_sessions(
        &self,
        state: Option<SessionState>,
        limit: Option<usize>,
    ) -> Vec<SessionSnapshot> {
        let sessions = lock(&self.sessions);
        let mut out: Vec<SessionSnapshot> = sessions
            .values()
            .map(|shared| shared.snapshot())
            .filter(|snapshot| state.map_or(true, |wanted| snapshot.state == wanted))
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    pub fn active_count(&self) -> usize {
        let sessions = lock(&self.sessions);
        sessions
            .values()
            .filter(|shared| !lock(&shared.state).is_terminal())
            .count()
    }

    /// Cancels every live session and waits (up to `drain_deadline`) for
    /// all of them to reach a terminal state.
    pub async fn shutdown(&self, drain_deadline: Duration) {
        {
            let sessions = lock(&self.sessions);
            for shared in sessions.values() {
                if !lock(&shared.state).is_terminal() {
                    shared.cancel.cancel();
                }
            }
        }
        let deadline = Instant::now() + drain_deadline;
        while self.active_count() > 0 && Instant::now() < deadline {
            time::sleep(Duration::from_millis(50)).await;
        }
        if self.active_count() > 0 {
            warn!(remaining = self.active_count(), "sessions still live at shutdown deadline");
        }
    }

    fn get(&self, id: &SessionId) -> Result<Arc<SessionShared>, ServerError> {
        lock(&self.sessions)
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::SessionNotFound { id: id.to_string() })
    }
}

struct SessionTimeouts {
    kill_grace: Duration,
    zombie_timeout: Duration,
    idle_timeout: Duration,
    deadline: Duration,
}

/// The per-session supervisor task: drives the pump, applies deadline and
/// idle timeouts, runs the termination sequence, and lands the terminal
/// state.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    shared: Arc<SessionShared>,
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    record_tx: mpsc::Sender<StreamRecord>,
    engine_config: EngineConfig,
    timeouts: SessionTimeouts,
    registry: Arc<ProcessRegistry>,
    events: EventBus,
    hooks: SessionHooks,
) {
    let mut engine = StreamEngine::new(engine_config, record_tx, shared.counters.clone());
    let pump_cancel = shared.cancel.child_token();
    let pid = lock(&shared.pid).unwrap_or(0);

    let started = Instant::now();
    let deadline_at = started + timeouts.deadline;
    let mut reason_override: Option<TerminalReason> = None;

    let outcome = {
        let engine_cancel = pump_cancel.clone();
        let pump = engine.pump(stdout, stderr, &engine_cancel);
        tokio::pin!(pump);
        let mut idle_tick = time::interval(Duration::from_millis(250));

        loop {
            tokio::select! {
                outcome = &mut pump => break outcome,
                _ = shared.cancel.cancelled(), if reason_override.is_none() => {
                    shared.transition(SessionState::Cancelling, &events);
                    reason_override = Some(TerminalReason::Cancelled);
                    tokio::spawn(terminate_child(pid, timeouts.kill_grace));
                    pump_cancel.cancel();
                }
                _ = time::sleep_until(deadline_at.into()), if reason_override.is_none() => {
                    info!(session = %shared.id, "session deadline exceeded");
                    shared.transition(SessionState::TimingOut, &events);
                    reason_override = Some(TerminalReason::TimedOut);
                    tokio::spawn(terminate_child(pid, timeouts.kill_grace));
                    pump_cancel.cancel();
                }
                _ = idle_tick.tick(), if reason_override.is_none() => {
                    if is_idle(&shared, started, timeouts.idle_timeout) {
                        info!(session = %shared.id, "session idle timeout");
                        shared.transition(SessionState::TimingOut, &events);
                        reason_override = Some(TerminalReason::TimedOut);
                        tokio::spawn(terminate_child(pid, timeouts.kill_grace));
                        pump_cancel.cancel();
                    }
                }
            }
        }
    };

    let wait_budget = timeouts.kill_grace + timeouts.zombie_timeout;
    let exit_code = match time::timeout(wait_budget, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(err)) => {
            warn!(session = %shared.id, %err, "failed to reap child");
            None
        }
        Err(_) => {
            warn!(session = %shared.id, pid, "zombie-suspected: child did not exit in time");
            events.publish(ServerEvent::ZombieSuspected {
                session: shared.id.to_string(),
                pid,
            });
            let _ = child.start_kill();
            None
        }
    };
    *lock(&shared.exit_code) = exit_code;

    let reason = match (reason_override, outcome) {
        (Some(reason), _) => reason,
        (None, PumpOutcome::Eof) => match exit_code {
            Some(code) => TerminalReason::ChildExited(code),
            None => TerminalReason::Eof,
        },
        (None, PumpOutcome::ReadFailed(_)) => TerminalReason::StreamFailed,
        // The consumer vanished or the server is shutting down.
        (None, PumpOutcome::Cancelled) => TerminalReason::Cancelled,
    };

    if matches!(reason, TerminalReason::ChildExited(0)) {
        shared.transition(SessionState::Completing, &events);
    }
    engine.finish(reason).await;

    let final_state = match reason {
        TerminalReason::ChildExited(0) => SessionState::Completed,
        TerminalReason::ChildExited(_)
        | TerminalReason::Eof
        | TerminalReason::StreamFailed => SessionState::Failed,
        TerminalReason::Cancelled => SessionState::Cancelled,
        TerminalReason::TimedOut => SessionState::TimedOut,
    };
    shared.transition(final_state, &events);
    *lock(&shared.stdin_tx) = None;
    if let Err(err) = registry.unregister(shared.id.as_str()) {
        warn!(session = %shared.id, %err, "failed to unregister child");
    }
    if let Some(hook) = &hooks.post_terminate {
        hook(&shared.snapshot());
    }
    info!(session = %shared.id, state = final_state.as_str(), ?exit_code, "session terminal");
}

fn is_idle(shared: &SessionShared, started: Instant, idle_timeout: Duration) -> bool {
    if idle_timeout.is_zero() {
        return false;
    }
    let last_ms = shared.counters.last_record_unix_ms.load(Ordering::Relaxed);
    if last_ms == 0 {
        return started.elapsed() > idle_timeout;
    }
    unix_ms().saturating_sub(last_ms) > idle_timeout.as_millis() as u64
}

/// Polite termination first, forced kill after the grace period.
async fn terminate_child(pid: u32, grace: Duration) {
    if pid == 0 {
        return;
    }
    #[cfg(unix)]
    {
        #[allow(unsafe_code)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    time::sleep(grace).await;
    if liveness::process_alive(pid) {
        warn!(pid, "child ignored polite termination; killing");
        #[cfg(unix)]
        {
            #[allow(unsafe_code)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

/// One write at a time; each message is a single line plus `\n`, flushed
/// before the next is taken.
async fn writer_task(
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<OutboundMessage>,
    counters: Arc<StreamCounters>,
) {
    while let Some(OutboundMessage { line, reply }) = rx.recv().await {
        let result = write_framed(&mut stdin, &line).await;
        if result.is_ok() {
            counters.note_input_bytes(line.len() as u64 + 1);
        }
        let fatal = result.is_err();
        let _ = reply.send(result);
        if fatal {
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn write_framed(stdin: &mut ChildStdin, line: &str) -> Result<(), ServerError> {
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|source| ServerError::StdinWrite { source })?;
    stdin
        .write_all(b"\n")
        .await
        .map_err(|source| ServerError::StdinWrite { source })?;
    stdin
        .flush()
        .await
        .map_err(|source| ServerError::StdinWrite { source })?;
    Ok(())
}

/// Spawn with capped backoff on `ExecutableFileBusy` (a freshly written
/// binary can still be open for writing).
async fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, ServerError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(ServerError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }
    Err(ServerError::Internal {
        message: "spawn retry loop exhausted".to_string(),
    })
}

fn argv_fingerprint(binary: &Path, model: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(binary.display().to_string().as_bytes());
    if let Some(model) = model {
        hasher.update(b"--model");
        hasher.update(model.as_bytes());
    }
    hex::encode(hasher.finalize())
}
