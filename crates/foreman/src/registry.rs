use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::ServerError,
    events::{EventBus, ServerEvent},
};

/// How many terminal records are retained for inspection before the oldest
/// are pruned.
const TERMINAL_RETENTION: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    Running,
    Exited,
    Orphaned,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited | ProcessState::Orphaned)
    }
}

/// Durable record of one spawned child.
///
/// `boot_id` and `start_time_ticks` form the liveness signature that
/// defeats PID reuse: a record only counts as alive when a process with the
/// same pid *and* the same start time exists on the same boot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessRecord {
    pub session_id: String,
    pub pid: u32,
    pub executable: PathBuf,
    pub argv_sha256: String,
    pub started_at_unix_ms: u64,
    pub boot_id: Option<String>,
    pub start_time_ticks: Option<u64>,
    pub state: ProcessState,
    pub liveness_checked_at_unix_ms: u64,
}

/// Cross-invocation registry of spawned children, reconciled against the OS
/// on startup. Single writer behind a mutex; every mutation is an atomic
/// rewrite of `processes.db`.
pub struct ProcessRegistry {
    path: PathBuf,
    max_processes: usize,
    inner: Mutex<Vec<ProcessRecord>>,
    events: EventBus,
}

impl ProcessRegistry {
    pub fn open(
        path: impl Into<PathBuf>,
        max_processes: usize,
        events: EventBus,
    ) -> Result<Self, ServerError> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(%err, path = %path.display(), "discarding unreadable process registry");
                Vec::new()
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(ServerError::io("read", path, source)),
        };
        Ok(Self {
            path,
            max_processes,
            inner: Mutex::new(records),
            events,
        })
    }

    /// Durably records a new child. Rejects inserts over the global cap and
    /// duplicate live `(pid, start-time)` pairs.
    pub fn register(&self, session_id: &str, pid: u32, executable: &Path, argv_sha256: String)
        -> Result<(), ServerError>
    {
        let boot_id = liveness::current_boot_id();
        let start_time_ticks = liveness::process_start_ticks(pid);
        let mut records = self.lock();

        let running = records.iter().filter(|r| !r.state.is_terminal()).count();
        if running >= self.max_processes {
            return Err(ServerError::SessionLimit {
                max: self.max_processes,
            });
        }
        let duplicate = records.iter().any(|r| {
            !r.state.is_terminal() && r.pid == pid && r.start_time_ticks == start_time_ticks
        });
        if duplicate {
            return Err(ServerError::RegistryConflict { pid });
        }

        records.push(ProcessRecord {
            session_id: session_id.to_string(),
            pid,
            executable: executable.to_path_buf(),
            argv_sha256,
            started_at_unix_ms: unix_ms(),
            boot_id,
            start_time_ticks,
            state: ProcessState::Running,
            liveness_checked_at_unix_ms: unix_ms(),
        });
        self.persist(&records)?;
        debug!(session = session_id, pid, "child registered");
        Ok(())
    }

    /// Marks a session's record terminal. Unknown sessions are a no-op.
    pub fn unregister(&self, session_id: &str) -> Result<(), ServerError> {
        let mut records = self.lock();
        let mut changed = false;
        for record in records.iter_mut() {
            if record.session_id == session_id && !record.state.is_terminal() {
                record.state = ProcessState::Exited;
                record.liveness_checked_at_unix_ms = unix_ms();
                changed = true;
            }
        }
        if changed {
            prune_terminal(&mut records);
            self.persist(&records)?;
        }
        Ok(())
    }

    pub fn list(&self, filter: Option<ProcessState>) -> Vec<ProcessRecord> {
        let records = self.lock();
        records
            .iter()
            .filter(|record| filter.map_or(true, |state| record.state == state))
            .cloned()
            .collect()
    }

    pub fn running_count(&self) -> usize {
        let records = self.lock();
        records.iter().filter(|r| !r.state.is_terminal()).count()
    }

    /// Walks all non-terminal records and marks the ones whose liveness
    /// signature no longer matches a live process as `Orphaned`. Called on
    /// server startup; an orphaned record is never resurrected.
    pub fn reconcile(&self) -> Result<Vec<ProcessRecord>, ServerError> {
        let current_boot = liveness::current_boot_id();
        let mut orphaned = Vec::new();
        let mut records = self.lock();
        for record in records.iter_mut() {
            if record.state.is_terminal() {
                continue;
            }
            record.liveness_checked_at_unix_ms = unix_ms();
            if record_is_live(record, current_boot.as_deref()) {
                continue;
            }
            record.state = ProcessState::Orphaned;
            orphaned.push(record.clone());
        }
        if !orphaned.is_empty() {
            self.persist(&records)?;
        }
        drop(records);

        for record in &orphaned {
            info!(session = %record.session_id, pid = record.pid, "orphaned child reconciled");
            self.events.publish(ServerEvent::SessionOrphaned {
                session: record.session_id.clone(),
                pid: record.pid,
            });
        }
        Ok(orphaned)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProcessRecord>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, records: &[ProcessRecord]) -> Result<(), ServerError> {
        let bytes = serde_json::to_vec_pretty(records).map_err(|source| ServerError::Encode {
            context: "process registry",
            source,
        })?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|source| ServerError::io("create temp file in", dir, source))?;
        io::Write::write_all(&mut tmp, &bytes)
            .map_err(|source| ServerError::io("write", tmp.path().to_path_buf(), source))?;
        tmp.persist(&self.path)
            .map_err(|err| ServerError::io("rename into", &self.path, err.error))?;
        Ok(())
    }
}

fn record_is_live(record: &ProcessRecord, current_boot: Option<&str>) -> bool {
    if let (Some(recorded), Some(current)) = (record.boot_id.as_deref(), current_boot) {
        if recorded != current {
            return false;
        }
    }
    match (record.start_time_ticks, liveness::process_start_ticks(record.pid)) {
        // Signature available on both sides: it must match exactly.
        (Some(recorded), Some(observed)) => recorded == observed,
        // Recorded signature but the process is gone (or unreadable).
        (Some(_), None) => false,
        // No recorded signature; fall back to bare existence.
        (None, _) => liveness::process_alive(record.pid),
    }
}

fn prune_terminal(records: &mut Vec<ProcessRecord>) {
    let terminal = records.iter().filter(|r| r.state.is_terminal()).count();
    if terminal <= TERMINAL_RETENTION {
        return;
    }
    let mut to_drop = terminal - TERMINAL_RETENTION;
    records.retain(|record| {
        if to_drop > 0 && record.state.is_terminal() {
            to_drop -= 1;
            false
        } else {
            true
        }
    });
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// OS liveness probes. The start-time signature is only readable on Linux;
/// elsewhere `process_alive` falls back to signal 0.
pub(crate) mod liveness {
    #[cfg(target_os = "linux")]
    pub(crate) fn current_boot_id() -> Option<String> {
        std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
            .ok()
            .map(|raw| raw.trim().to_string())
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn current_boot_id() -> Option<String> {
        None
    }

    /// Field 22 of `/proc/<pid>/stat`: the process start time in clock
    /// ticks since boot. The comm field may contain spaces and parens, so
    /// parsing resumes after the last `)`.
    #[cfg(target_os = "linux")]
    pub(crate) fn process_start_ticks(pid: u32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let rest = &stat[stat.rfind(')')? + 1..];
        // `rest` starts at field 3 (state); start time is field 22.
        rest.split_whitespace().nth(19)?.parse().ok()
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn process_start_ticks(_pid: u32) -> Option<u64> {
        None
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn process_alive(pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    pub(crate) fn process_alive(pid: u32) -> bool {
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    pub(crate) fn process_alive(_pid: u32) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &tempfile::TempDir, max: usize) -> ProcessRegistry {
        ProcessRegistry::open(dir.path().join("processes.db"), max, EventBus::new()).unwrap()
    }

    #[test]
    fn register_enforces_global_cap() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir, 1);

        registry
            .register("sess-1", std::process::id(), Path::new("/bin/true"), "a".into())
            .unwrap();
        let err = registry
            .register("sess-2", 999_999, Path::new("/bin/true"), "b".into())
            .unwrap_err();
        assert!(matches!(err, ServerError::SessionLimit { max: 1 }));
    }

    #[test]
    fn unregister_is_terminal_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir, 4);

        registry
            .register("sess-1", std::process::id(), Path::new("/bin/true"), "a".into())
            .unwrap();
        registry.unregister("sess-1").unwrap();
        registry.unregister("sess-1").unwrap();

        let records = registry.list(None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, ProcessState::Exited);
        assert_eq!(registry.running_count(), 0);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processes.db");
        {
            let registry =
                ProcessRegistry::open(&path, 4, EventBus::new()).unwrap();
            registry
                .register("sess-1", std::process::id(), Path::new("/bin/true"), "a".into())
                .unwrap();
        }
        let registry = ProcessRegistry::open(&path, 4, EventBus::new()).unwrap();
        assert_eq!(registry.list(None).len(), 1);
    }

    #[test]
    fn reconcile_orphans_dead_pids() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir, 4);

        // Our own pid is alive; an absurd pid is not.
        registry
            .register("alive", std::process::id(), Path::new("/bin/true"), "a".into())
            .unwrap();
        registry
            .register("dead", u32::MAX - 7, Path::new("/bin/true"), "b".into())
            .unwrap();

        let orphaned = registry.reconcile().unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].session_id, "dead");

        // A second reconcile finds nothing new.
        assert!(registry.reconcile().unwrap().is_empty());
        let orphans = registry.list(Some(ProcessState::Orphaned));
        assert_eq!(orphans.len(), 1);
    }

    #[test]
    fn duplicate_live_pid_with_same_signature_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir, 4);
        let pid = std::process::id();

        registry
            .register("sess-1", pid, Path::new("/bin/true"), "a".into())
            .unwrap();
        let err = registry
            .register("sess-2", pid, Path::new("/bin/true"), "b".into())
            .unwrap_err();
        assert!(matches!(err, ServerError::RegistryConflict { .. }));
    }
}
