use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    checkpoint::{CheckpointManager, CreateCheckpointOptions},
    config::ServerConfig,
    error::{ErrorCode, McpErrorPayload, ServerError},
    locator::BinaryLocator,
    mcp::{ConfigView, McpRequest, McpResponse, RefEntry},
    session::{SessionId, SessionSupervisor},
};

/// An asynchronous notification bound for the MCP peer: one per stream
/// record, keyed by session id.
#[derive(Clone, Debug)]
pub struct Notification {
    pub session: String,
    pub body: Value,
}

/// Observes dispatched operations. Middleware runs in table order after
/// every operation; it cannot rewrite requests or responses.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;
    fn observe(&self, op: &'static str, error: Option<ErrorCode>, elapsed: Duration);
}

/// Logs one line per operation with latency and outcome.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn observe(&self, op: &'static str, error: Option<ErrorCode>, elapsed: Duration) {
        match error {
            None => debug!(op, elapsed_ms = elapsed.as_millis() as u64, "op ok"),
            Some(code) => warn!(
                op,
                code = code.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                "op failed"
            ),
        }
    }
}

/// Counts failures per error code; readable for diagnostics and tests.
#[derive(Default)]
pub struct ErrorTallyMiddleware {
    counts: Mutex<BTreeMap<&'static str, u64>>,
}

impl ErrorTallyMiddleware {
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Middleware for ErrorTallyMiddleware {
    fn name(&self) -> &'static str {
        "error-tally"
    }

    fn observe(&self, _op: &'static str, error: Option<ErrorCode>, _elapsed: Duration) {
        if let Some(code) = error {
            *self
                .counts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(code.as_str())
                .or_insert(0) += 1;
        }
    }
}

/// The decoded-request dispatcher.
///
/// Owns the outbound notification channel: every session's record queue is
/// drained by a forwarding task into one bounded channel the transport
/// writes from. A slow peer fills that channel, the forwarders suspend,
/// the per-session queues fill, and the engines stop reading. The
/// backpressure chain ends at the child's stdout pipe.
pub struct McpFrontend {
    config: Arc<ServerConfig>,
    supervisor: Arc<SessionSupervisor>,
    checkpoints: Arc<CheckpointManager>,
    locator: Arc<BinaryLocator>,
    notifications: mpsc::Sender<Notification>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl McpFrontend {
    pub fn new(
        config: Arc<ServerConfig>,
        supervisor: Arc<SessionSupervisor>,
        checkpoints: Arc<CheckpointManager>,
        locator: Arc<BinaryLocator>,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> (Self, mpsc::Receiver<Notification>) {
        let (notifications, rx) = mpsc::channel(config.queue_capacity);
        (
            Self {
                config,
                supervisor,
                checkpoints,
                locator,
                notifications,
                middleware,
            },
            rx,
        )
    }

    /// Dispatches one decoded request. Never panics the server; every
    /// failure is a typed payload.
    pub async fn handle(
        &self,
        request: McpRequest,
        cancel: &CancellationToken,
    ) -> Result<McpResponse, McpErrorPayload> {
        let op = request.op_name();
        let started = Instant::now();
        let result = self
            .dispatch(request, cancel)
            .instrument(info_span!("mcp_op", op))
            .await;
        let code = result.as_ref().err().map(ServerError::code);
        for middleware in &self.middleware {
            middleware.observe(op, code, started.elapsed());
        }
        result.map_err(|err| McpErrorPayload::from(&err))
    }

    async fn dispatch(
        &self,
        request: McpRequest,
        cancel: &CancellationToken,
    ) -> Result<McpResponse, ServerError> {
        match request {
            McpRequest::DiscoverBinary { force } => {
                let record = self.locator.resolve(force).await?;
                Ok(McpResponse::Binary(record))
            }
            McpRequest::CreateSession { request } => {
                let (snapshot, records) = self.supervisor.create_session(request).await?;
                self.forward_records(snapshot.id.to_string(), records);
                Ok(McpResponse::SessionCreated(snapshot))
            }
            McpRequest::SendMessage {
                session,
                content,
                timeout_ms,
            } => {
                let id = SessionId::from(session.as_str());
                let deadline = timeout_ms.map(Duration::from_millis);
                self.supervisor.send_message(&id, content, deadline).await?;
                Ok(McpResponse::MessageSent { session })
            }
            McpRequest::CancelSession { session } => {
                let id = SessionId::from(session.as_str());
                let state = self.supervisor.cancel_session(&id)?;
                Ok(McpResponse::CancelRequested { session, state })
            }
            McpRequest::ListSessions { state, limit } => {
                Ok(McpResponse::Sessions(self.supervisor.list_sessions(state, limit)))
            }
            McpRequest::CheckpointCreate {
                project_root,
                message,
                author,
                tags,
                parent,
            } => {
                let checkpoints = self.checkpoints.clone();
                let cancel = cancel.clone();
                let id = run_blocking(move || {
                    checkpoints.create(
                        &project_root,
                        CreateCheckpointOptions {
                            message,
                            author: author.unwrap_or_else(|| "foreman".to_string()),
                            tags,
                            parent,
                        },
                        &cancel,
                    )
                })
                .await?;
                Ok(McpResponse::CheckpointCreated { id })
            }
            McpRequest::CheckpointList => {
                let checkpoints = self.checkpoints.clone();
                let list = run_blocking(move || checkpoints.list()).await?;
                Ok(McpResponse::Checkpoints(list))
            }
            McpRequest::CheckpointGet { id } => {
                let checkpoints = self.checkpoints.clone();
                let lookup = id.clone();
                let manifest = run_blocking(move || checkpoints.get(&lookup)).await?;
                Ok(McpResponse::Checkpoint { id, manifest })
            }
            McpRequest::CheckpointDiff { a, b } => {
                let checkpoints = self.checkpoints.clone();
                let diff = run_blocking(move || checkpoints.diff(&a, &b)).await?;
                Ok(McpResponse::Diff(diff))
            }
            McpRequest::CheckpointRestore {
                id,
                target_root,
                create_backup,
            } => {
                let checkpoints = self.checkpoints.clone();
                let restore_id = id.clone();
                let report = run_blocking(move || {
                    checkpoints.restore(&restore_id, &target_root, create_backup)
                })
                .await?;
                Ok(McpResponse::Restored {
                    files_written: report.files_written,
                    files_removed: report.files_removed,
                    backup_id: report.backup_id,
                })
            }
            McpRequest::RefCreate { name, id } => {
                self.checkpoints.create_ref(&name, &id)?;
                Ok(McpResponse::RefCreated { name, id })
            }
            McpRequest::RefList => {
                let refs = self
                    .checkpoints
                    .list_refs()?
                    .into_iter()
                    .map(|(name, checkpoint)| RefEntry { name, checkpoint })
                    .collect();
                Ok(McpResponse::Refs(refs))
            }
            McpRequest::RefDelete { name } => {
                self.checkpoints.delete_ref(&name)?;
                Ok(McpResponse::RefDeleted { name })
            }
            McpRequest::Gc { dry_run } => {
                let checkpoints = self.checkpoints.clone();
                let summary = run_blocking(move || checkpoints.gc(dry_run)).await?;
                Ok(McpResponse::Gc {
                    objects_removed: summary.objects_removed,
                    blobs_removed: summary.blobs_removed,
                    bytes_freed: summary.bytes_freed,
                    dry_run: summary.dry_run,
                })
            }
            McpRequest::GetConfig => Ok(McpResponse::Config(ConfigView::from(&*self.config))),
        }
    }

    /// Drains one session's record queue into the shared notification
    /// channel, preserving order. Ends when the engine closes the queue
    /// (after its terminal record).
    fn forward_records(
        &self,
        session: String,
        mut records: mpsc::Receiver<stream_events::StreamRecord>,
    ) {
        let notifications = self.notifications.clone();
        tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                let notification = Notification {
                    session: session.clone(),
                    body: record.to_wire(),
                };
                if notifications.send(notification).await.is_err() {
                    break;
                }
            }
            debug!(%session, "notification queue drained");
        });
    }
}

/// Checkpoint operations walk, hash, and (de)compress whole project trees;
/// they run on the blocking pool so one session's checkpoint I/O cannot
/// stall another session's stream tasks.
async fn run_blocking<T, F>(task: F) -> Result<T, ServerError>
where
    F: FnOnce() -> Result<T, ServerError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result,
        Err(err) => Err(ServerError::Internal {
            message: format!("blocking task failed: {err}"),
        }),
    }
}

