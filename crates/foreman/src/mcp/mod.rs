use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    checkpoint::{CheckpointSummary, DiffReport, Manifest},
    config::ServerConfig,
    locator::BinaryRecord,
    session::{CreateSessionRequest, SessionSnapshot, SessionState},
};

mod server;

pub use server::{ErrorTallyMiddleware, LoggingMiddleware, McpFrontend, Middleware, Notification};

/// A decoded MCP operation. The transport layer (stdio, SSE, whatever)
/// produces these; the core never sees wire framing.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum McpRequest {
    DiscoverBinary {
        #[serde(default)]
        force: bool,
    },
    CreateSession {
        #[serde(flatten)]
        request: CreateSessionRequest,
    },
    SendMessage {
        session: String,
        content: Value,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    CancelSession {
        session: String,
    },
    ListSessions {
        #[serde(default)]
        state: Option<SessionState>,
        #[serde(default)]
        limit: Option<usize>,
    },
    CheckpointCreate {
        project_root: PathBuf,
        #[serde(default)]
        message: String,
        #[serde(default)]
        author: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        parent: Option<String>,
    },
    CheckpointList,
    CheckpointGet {
        id: String,
    },
    CheckpointDiff {
        a: String,
        b: String,
    },
    CheckpointRestore {
        id: String,
        target_root: PathBuf,
        #[serde(default)]
        create_backup: bool,
    },
    RefCreate {
        name: String,
        id: String,
    },
    RefList,
    RefDelete {
        name: String,
    },
    Gc {
        #[serde(default)]
        dry_run: bool,
    },
    GetConfig,
}

impl McpRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            McpRequest::DiscoverBinary { .. } => "discover_binary",
            McpRequest::CreateSession { .. } => "create_session",
            McpRequest::SendMessage { .. } => "send_message",
            McpRequest::CancelSession { .. } => "cancel_session",
            McpRequest::ListSessions { .. } => "list_sessions",
            McpRequest::CheckpointCreate { .. } => "checkpoint_create",
            McpRequest::CheckpointList => "checkpoint_list",
            McpRequest::CheckpointGet { .. } => "checkpoint_get",
            McpRequest::CheckpointDiff { .. } => "checkpoint_diff",
            McpRequest::CheckpointRestore { .. } => "checkpoint_restore",
            McpRequest::RefCreate { .. } => "ref_create",
            McpRequest::RefList => "ref_list",
            McpRequest::RefDelete { .. } => "ref_delete",
            McpRequest::Gc { .. } => "gc",
            McpRequest::GetConfig => "get_config",
        }
    }
}

/// Structured result of a successful operation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum McpResponse {
    Binary(BinaryRecord),
    SessionCreated(SessionSnapshot),
    MessageSent {
        session: String,
    },
    CancelRequested {
        session: String,
        state: SessionState,
    },
    Sessions(Vec<SessionSnapshot>),
    CheckpointCreated {
        id: String,
    },
    Checkpoints(Vec<CheckpointSummary>),
    Checkpoint {
        id: String,
        manifest: Manifest,
    },
    Diff(DiffReport),
    Restored {
        files_written: usize,
        files_removed: usize,
        backup_id: Option<String>,
    },
    RefCreated {
        name: String,
        id: String,
    },
    Refs(Vec<RefEntry>),
    RefDeleted {
        name: String,
    },
    Gc {
        objects_removed: u64,
        blobs_removed: u64,
        bytes_freed: u64,
        dry_run: bool,
    },
    Config(ConfigView),
}

#[derive(Debug, Serialize)]
pub struct RefEntry {
    pub name: String,
    pub checkpoint: String,
}

/// The read-only configuration resource.
#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub state_root: PathBuf,
    pub disk_quota: Option<u64>,
    pub max_sessions: usize,
    pub session_deadline_secs: u64,
    pub idle_timeout_secs: u64,
    pub queue_capacity: usize,
    pub max_line_bytes: usize,
    pub stderr_ring_bytes: usize,
    pub zstd_level: i32,
    pub agent_binary_name: String,
    pub kill_grace_secs: u64,
    pub zombie_timeout_secs: u64,
    pub gc_interval_secs: Option<u64>,
}

impl From<&ServerConfig> for ConfigView {
    fn from(config: &ServerConfig) -> Self {
        Self {
            state_root: config.state_root.clone(),
            disk_quota: config.disk_quota,
            max_sessions: config.max_sessions,
            session_deadline_secs: config.session_deadline.as_secs(),
            idle_timeout_secs: config.idle_timeout.as_secs(),
            queue_capacity: config.queue_capacity,
            max_line_bytes: config.max_line_bytes,
            stderr_ring_bytes: config.stderr_ring_bytes,
            zstd_level: config.zstd_level,
            agent_binary_name: config.agent_binary_name.clone(),
            kill_grace_secs: config.kill_grace.as_secs(),
            zombie_timeout_secs: config.zombie_timeout.as_secs(),
            gc_interval_secs: config.gc_interval.map(|interval| interval.as_secs()),
        }
    }
}
