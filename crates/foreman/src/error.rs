use std::{io, path::PathBuf, time::Duration};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use content_store::StoreError;

/// Machine-readable error taxonomy surfaced to MCP peers.
///
/// Every [`ServerError`] maps to exactly one code; the mapping is the
/// contract, the variant set is an implementation detail.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum ErrorCode {
    NotFound,
    Invalid,
    Conflict,
    Busy,
    Timeout,
    Cancelled,
    Io,
    Corrupt,
    SessionNotRunning,
    QuotaExceeded,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not-found",
            ErrorCode::Invalid => "invalid",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Busy => "busy",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Io => "io",
            ErrorCode::Corrupt => "corrupt",
            ErrorCode::SessionNotRunning => "session-not-running",
            ErrorCode::QuotaExceeded => "quota-exceeded",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Errors produced by the server core.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no usable agent binary found (tried {attempts} candidates)")]
    BinaryNotFound { attempts: usize },
    #[error("session `{id}` not found")]
    SessionNotFound { id: String },
    #[error("session `{id}` is {state}, not running")]
    SessionNotRunning { id: String, state: String },
    #[error("session limit of {max} reached")]
    SessionLimit { max: usize },
    #[error("a live process with pid {pid} is already registered")]
    RegistryConflict { pid: u32 },
    #[error("write to session `{id}` timed out after {timeout:?}")]
    WriteTimeout { id: String, timeout: Duration },
    #[error("operation cancelled")]
    Cancelled,
    #[error("agent binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write to child stdin: {source}")]
    StdinWrite {
        #[source]
        source: io::Error,
    },
    #[error("checkpoint `{id}` not found")]
    CheckpointNotFound { id: String },
    #[error("ref `{name}` not found")]
    RefNotFound { name: String },
    #[error("invalid ref name `{name}`")]
    InvalidRefName { name: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
    #[error("failed to {action} `{path}`: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {context}: {source}")]
    Encode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ServerError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ServerError::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::BinaryNotFound { .. }
            | ServerError::SessionNotFound { .. }
            | ServerError::CheckpointNotFound { .. }
            | ServerError::RefNotFound { .. } => ErrorCode::NotFound,
            ServerError::SessionNotRunning { .. } => ErrorCode::SessionNotRunning,
            ServerError::SessionLimit { .. } => ErrorCode::Busy,
            ServerError::RegistryConflict { .. } => ErrorCode::Conflict,
            ServerError::WriteTimeout { .. } => ErrorCode::Timeout,
            ServerError::Cancelled => ErrorCode::Cancelled,
            ServerError::Spawn { .. } | ServerError::Io { .. } | ServerError::StdinWrite { .. } => {
                ErrorCode::Io
            }
            ServerError::InvalidRefName { .. }
            | ServerError::InvalidRequest { .. }
            | ServerError::InvalidConfig { .. } => ErrorCode::Invalid,
            ServerError::Encode { .. } | ServerError::Internal { .. } => ErrorCode::Internal,
            ServerError::Store(err) => match err {
                StoreError::NotFound { .. } => ErrorCode::NotFound,
                StoreError::Corrupt { .. } => ErrorCode::Corrupt,
                StoreError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
                StoreError::InvalidHash { .. } => ErrorCode::Invalid,
                StoreError::Io { .. } => ErrorCode::Io,
                StoreError::RefcountIndex { .. } => ErrorCode::Internal,
            },
        }
    }

    /// Structured context forwarded alongside the code and message.
    fn context(&self) -> Option<Value> {
        match self {
            ServerError::SessionNotRunning { id, state } => Some(serde_json::json!({
                "session": id,
                "state": state,
            })),
            ServerError::SessionLimit { max } => Some(serde_json::json!({ "max": max })),
            ServerError::WriteTimeout { id, timeout } => Some(serde_json::json!({
                "session": id,
                "timeout_ms": timeout.as_millis() as u64,
            })),
            ServerError::RegistryConflict { pid } => Some(serde_json::json!({ "pid": pid })),
            _ => None,
        }
    }
}

/// Typed error payload for the MCP peer.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct McpErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl From<&ServerError> for McpErrorPayload {
    fn from(err: &ServerError) -> Self {
        McpErrorPayload {
            code: err.code().as_str(),
            message: err.to_string(),
            context: err.context(),
        }
    }
}

impl From<ServerError> for McpErrorPayload {
    fn from(err: ServerError) -> Self {
        McpErrorPayload::from(&err)
    }
}
