#![allow(dead_code)]

use std::{fs, path::{Path, PathBuf}, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use content_store::{ContentStore, StoreOptions};
use foreman::{
    checkpoint::CheckpointManager,
    config::ServerConfig,
    events::EventBus,
    locator::BinaryLocator,
    registry::ProcessRegistry,
    session::{SessionHooks, SessionSupervisor},
    StateLayout,
};

/// Writes an executable shell script into `dir` and returns its path.
pub fn write_executable(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }
    path
}

/// A stub agent that answers the version probe and then runs `body`.
pub fn write_fake_agent(dir: &Path, body: &str) -> PathBuf {
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then\n  echo \"stub-agent 1.0.0\"\n  exit 0\nfi\n{body}\n"
    );
    write_executable(dir, "stub-agent", &script)
}

pub struct TestStack {
    pub config: Arc<ServerConfig>,
    pub layout: StateLayout,
    pub store: Arc<ContentStore>,
    pub registry: Arc<ProcessRegistry>,
    pub locator: Arc<BinaryLocator>,
    pub checkpoints: Arc<CheckpointManager>,
    pub events: EventBus,
    pub supervisor: Arc<SessionSupervisor>,
    pub server_cancel: CancellationToken,
}

/// Wires a full supervisor stack against a stub agent binary, with test
/// friendly timeouts.
pub fn build_stack(state_root: &Path, agent_binary: PathBuf) -> TestStack {
    build_stack_with(ServerConfig {
        state_root: state_root.to_path_buf(),
        binary_override: Some(agent_binary),
        agent_binary_name: "stub-agent".to_string(),
        max_sessions: 4,
        kill_grace: Duration::from_millis(500),
        zombie_timeout: Duration::from_secs(3),
        idle_timeout: Duration::from_secs(60),
        session_deadline: Duration::from_secs(60),
        queue_capacity: 64,
        write_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    })
}

/// Same wiring, custom configuration.
pub fn build_stack_with(config: ServerConfig) -> TestStack {
    let config = Arc::new(config);
    let layout = StateLayout::new(&config.state_root);
    layout.materialize().unwrap();

    let events = EventBus::new();
    let store = Arc::new(
        ContentStore::open(layout.content_store_dir(), StoreOptions::default()).unwrap(),
    );
    let registry = Arc::new(
        ProcessRegistry::open(layout.processes_db_path(), config.max_sessions, events.clone())
            .unwrap(),
    );
    let locator = Arc::new(BinaryLocator::new(
        &config,
        layout.binaries_db_path(),
        events.clone(),
    ));
    let checkpoints = Arc::new(
        CheckpointManager::open(store.clone(), &layout, Vec::new(), events.clone()).unwrap(),
    );

    let server_cancel = CancellationToken::new();
    let supervisor = Arc::new(SessionSupervisor::new(
        config.clone(),
        layout.clone(),
        locator.clone(),
        registry.clone(),
        checkpoints.clone(),
        events.clone(),
        SessionHooks::default(),
        server_cancel.clone(),
    ));

    TestStack {
        config,
        layout,
        store,
        registry,
        locator,
        checkpoints,
        events,
        supervisor,
        server_cancel,
    }
}

/// Polls until the session reaches a terminal state (or panics after the
/// deadline).
pub async fn wait_terminal(
    supervisor: &SessionSupervisor,
    id: &foreman::session::SessionId,
    deadline: Duration,
) -> foreman::session::SessionSnapshot {
    let started = std::time::Instant::now();
    loop {
        let snapshot = supervisor.get_session(id).unwrap();
        if snapshot.state.is_terminal() {
            return snapshot;
        }
        assert!(
            started.elapsed() < deadline,
            "session {id} still {:?} after {deadline:?}",
            snapshot.state
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
