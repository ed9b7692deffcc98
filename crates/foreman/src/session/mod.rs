use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod supervisor;

pub use supervisor::{SessionHooks, SessionSupervisor};

/// Opaque, unique, monotonic session identifier.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub(crate) fn new(counter: u64) -> Self {
        Self(format!("sess-{counter:06}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// The session lifecycle. Terminal states are absorbing: once reached, a
/// session never transitions again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Created,
    Starting,
    Running,
    Completing,
    Cancelling,
    TimingOut,
    Completed,
    Cancelled,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Cancelled
                | SessionState::Failed
                | SessionState::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Completing => "completing",
            SessionState::Cancelling => "cancelling",
            SessionState::TimingOut => "timing-out",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
            SessionState::TimedOut => "timed-out",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to `create_session`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub prompt: String,
    /// Opaque model tag forwarded to the agent CLI.
    #[serde(default)]
    pub model: Option<String>,
    /// Checkpoint restored into the session's working tree before spawn.
    #[serde(default)]
    pub parent_checkpoint: Option<String>,
    /// Opaque context object forwarded as part of the initial prompt
    /// message.
    #[serde(default)]
    pub context: Option<Value>,
}

/// Read-only view of a session, safe to hand to other components.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    pub model: Option<String>,
    pub created_at_unix_ms: u64,
    pub deadline_unix_ms: u64,
    pub parent_checkpoint: Option<String>,
    /// SHA-256 of the prompt, not the prompt itself.
    pub prompt_sha256: String,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub records_emitted: u64,
    pub records_dropped: u64,
    pub last_record_unix_ms: u64,
}

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
