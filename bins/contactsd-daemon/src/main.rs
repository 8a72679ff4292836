mod config;

use bytes::Bytes;
use config::{ConfigError, DaemonConfig};
use contactsd_api::{ApiResponse, HealthStatus};
use contactsd_core::connection::InMemoryConnection;
use contactsd_core::error::CoreError;
use contactsd_core::event::{AccountEvent, AccountEventReceiver};
use contactsd_core::sink::{run_sink, BatchingSink, ContactBatch, ContactSink};
use contactsd_core::ContactsCore;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn, LevelFilter};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const SINK_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config")]
    Config(#[from] ConfigError),
    #[error("core")]
    Core(#[from] CoreError),
}

#[derive(Clone)]
struct DaemonState {
    core: Arc<ContactsCore>,
}

/// Stands in for the storage backend: reports each batch to the log.
struct LogSink;

#[async_trait::async_trait]
impl ContactSink for LogSink {
    async fn write(&self, batch: ContactBatch) -> Result<(), CoreError> {
        info!(
            "storage batch: {} removed, {} ready, {} changed",
            batch.removed.len(),
            batch.ready.len(),
            batch.changed.len()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("contactsd.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path)?;
    init_logging(&cfg);
    let state = build_state(&cfg).await?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let bind = cfg.api.socket_addr()?;
    let (addr, server) = start_control_server(state.clone(), bind, shutdown_rx).await;
    if let Some(addr) = addr {
        info!("control endpoint listening on {}", addr);
    }
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let _ = ctrl_c.as_mut().await;
    info!("shutting down");
    let _ = shutdown_tx.send(());
    let _ = server.await;
    state.core.shutdown().await;
    Ok(())
}

fn init_logging(cfg: &DaemonConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

async fn build_state(cfg: &DaemonConfig) -> Result<DaemonState, DaemonError> {
    let core = Arc::new(ContactsCore::init(cfg.core_config()).await?);
    tokio::spawn(run_sink(
        core.events(),
        BatchingSink::new(Arc::new(LogSink)),
        SINK_FLUSH_INTERVAL,
    ));
    tokio::spawn(log_sync_progress(core.account_events()));
    for account in cfg.accounts.iter() {
        // No IM service is linked in; every account gets an idle connection.
        let connection = Arc::new(InMemoryConnection::default());
        let avoid = account.contacts_to_avoid.iter().cloned().collect();
        core.add_account_avoiding(account.summary(), connection, avoid)
            .await?;
    }
    Ok(DaemonState { core })
}

async fn log_sync_progress(mut events: AccountEventReceiver) {
    loop {
        match events.recv().await {
            Ok(AccountEvent::SyncStarted { account_path }) => {
                info!("importing contacts of {}", account_path);
            }
            Ok(AccountEvent::SyncEnded {
                account_path,
                added,
                removed,
            }) => {
                info!(
                    "import of {} done: {} added, {} removed",
                    account_path, added, removed
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("{} sync progress events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn start_control_server(
    state: DaemonState,
    addr: SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> (Option<SocketAddr>, JoinHandle<()>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!("control endpoint unavailable on {}: {}", addr, err);
            let handle = tokio::spawn(async move {
                let _ = shutdown.await;
            });
            return (None, handle);
        }
    };
    let local = listener.local_addr().ok();
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let state = state.clone();
                                    async move { handle_request(state, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, service).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    });
    (local, handle)
}

async fn handle_request(
    state: DaemonState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let presence = state.core.device_presence();
    let response = match (req.method().as_str(), req.uri().path()) {
        ("GET", "/health") => {
            let accounts = state.core.account_paths().await.len();
            json_response(
                StatusCode::OK,
                &ApiResponse::ok(HealthStatus {
                    status: "ok".to_string(),
                    accounts,
                }),
            )
        }
        ("GET", "/presence") => match presence.snapshot().await {
            Ok(snapshot) => json_response(StatusCode::OK, &ApiResponse::ok(snapshot)),
            Err(err) => unavailable(err),
        },
        ("POST", "/presence/request-update") => match presence.request_update().await {
            Ok(signals) => json_response(StatusCode::OK, &ApiResponse::ok(signals)),
            Err(err) => unavailable(err),
        },
        _ => json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::<()>::error("not_found", "not found"),
        ),
    };
    Ok(response)
}

fn unavailable(err: CoreError) -> Response<Full<Bytes>> {
    warn!("control request failed: {}", err);
    json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        &ApiResponse::<()>::error("unavailable", &err.to_string()),
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::from(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests;
