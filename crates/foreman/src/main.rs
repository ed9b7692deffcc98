use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use content_store::{ContentStore, StoreOptions};
use foreman::{
    checkpoint::CheckpointManager,
    config::{ServerConfig, LOG_ENV},
    events::EventBus,
    locator::BinaryLocator,
    mcp::{ErrorTallyMiddleware, LoggingMiddleware, McpFrontend, McpRequest, Middleware, Notification},
    registry::ProcessRegistry,
    session::{SessionHooks, SessionSupervisor},
    ServerError, StateLayout,
};

const EXIT_CONFIG: u8 = 2;
const EXIT_NO_BINARY: u8 = 3;
const EXIT_INTERNAL: u8 = 70;

const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "foreman", about = "MCP server supervising agent CLI sessions")]
struct Cli {
    /// Fail startup (exit 3) unless a valid agent binary resolves.
    #[arg(long)]
    require_binary: bool,
}

/// One decoded request line from the peer.
#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    id: Value,
    #[serde(flatten)]
    request: McpRequest,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match ServerConfig::load() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(%err, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "unexpected internal error");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

async fn run(cli: Cli, config: Arc<ServerConfig>) -> Result<ExitCode, ServerError> {
    let layout = StateLayout::new(&config.state_root);
    if let Err(err) = layout.materialize() {
        error!(%err, root = %config.state_root.display(), "cannot prepare state root");
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    let events = EventBus::new();
    let store = Arc::new(ContentStore::open(
        layout.content_store_dir(),
        StoreOptions {
            zstd_level: config.zstd_level,
            disk_quota: config.disk_quota,
            ..StoreOptions::default()
        },
    )?);
    let registry = Arc::new(ProcessRegistry::open(
        layout.processes_db_path(),
        config.max_sessions,
        events.clone(),
    )?);
    let locator = Arc::new(BinaryLocator::new(
        &config,
        layout.binaries_db_path(),
        events.clone(),
    ));
    let checkpoints = Arc::new(CheckpointManager::open(
        store.clone(),
        &layout,
        config.checkpoint_ignore.clone(),
        events.clone(),
    )?);

    let orphaned = registry.reconcile()?;
    if !orphaned.is_empty() {
        warn!(count = orphaned.len(), "orphaned children reconciled at startup");
    }

    if cli.require_binary {
        if let Err(err) = locator.resolve(false).await {
            error!(%err, "no usable agent binary at boot");
            return Ok(ExitCode::from(EXIT_NO_BINARY));
        }
    }

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

    let middleware: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(LoggingMiddleware),
        Arc::new(ErrorTallyMiddleware::default()),
    ];
    let (frontend, notifications) = McpFrontend::new(
        config.clone(),
        supervisor.clone(),
        checkpoints.clone(),
        locator.clone(),
        middleware,
    );
    let frontend = Arc::new(frontend);

    if let Some(interval) = config.gc_interval {
        let checkpoints = checkpoints.clone();
        let gc_cancel = server_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = gc_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let checkpoints = checkpoints.clone();
                        match tokio::task::spawn_blocking(move || checkpoints.gc(false)).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(err)) => warn!(%err, "periodic gc failed"),
                            Err(err) => warn!(%err, "periodic gc task failed"),
                        }
                    }
                }
            }
        });
    }

    info!(root = %config.state_root.display(), "foreman serving on stdio");
    serve_stdio(frontend, notifications, supervisor, server_cancel).await;
    Ok(ExitCode::SUCCESS)
}

/// The thin transport collaborator: one JSON object per line in each
/// direction. Requests come in as `{"id":..,"op":..,...}`; responses go
/// out as `{"id":..,"ok":..}` or `{"id":..,"error":..}`, and stream
/// records as `{"notification":{"session":..,"body":..}}`.
async fn serve_stdio(
    frontend: Arc<McpFrontend>,
    mut notifications: mpsc::Receiver<Notification>,
    supervisor: Arc<SessionSupervisor>,
    server_cancel: CancellationToken,
) {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let notification_out = out_tx.clone();
    let notifier = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            let line = serde_json::json!({
                "notification": {
                    "session": notification.session,
                    "body": notification.body,
                }
            });
            if notification_out.send(line.to_string()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; shutting down");
                break;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("peer closed stdin; shutting down");
                break;
            }
            Err(err) => {
                warn!(%err, "stdin read failed; shutting down");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope: RequestEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                let reply = serde_json::json!({
                    "id": Value::Null,
                    "error": {
                        "code": "invalid",
                        "message": format!("undecodable request: {err}"),
                    }
                });
                let _ = out_tx.send(reply.to_string()).await;
                continue;
            }
        };

        let frontend = frontend.clone();
        let out_tx = out_tx.clone();
        let request_cancel = server_cancel.child_token();
        tokio::spawn(async move {
            let RequestEnvelope { id, request } = envelope;
            let reply = match frontend.handle(request, &request_cancel).await {
                Ok(response) => serde_json::json!({ "id": id, "ok": response }),
                Err(payload) => serde_json::json!({ "id": id, "error": payload }),
            };
            let _ = out_tx.send(reply.to_string()).await;
        });
    }

    server_cancel.cancel();
    supervisor.shutdown(DRAIN_DEADLINE).await;
    // Dropping the frontend closes the notification channel once the last
    // per-session forwarder finishes, which lets the notifier and writer
    // tasks run dry.
    drop(frontend);
    drop(out_tx);
    let _ = notifier.await;
    let _ = writer.await;
}
