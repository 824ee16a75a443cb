//! Server lifecycle: preflight, startup sequence, timers, graceful
//! shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use mikroscope_alerts::AlertManager;
use mikroscope_index::{IndexMode, Indexer, IndexStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Protocol, ServerConfig, MIN_MAINTENANCE_INTERVAL_MS};
use crate::ingest::IngestPipeline;
use crate::maintenance::{MaintenanceLoop, RetentionConfig};
use crate::preflight::preflight_dir;
use crate::query::QueryService;
use crate::routes::build_router;
use crate::state::{run_index_pass, AppState, IndexStatus};

enum ServeHandle {
    Http {
        task: JoinHandle<std::io::Result<()>>,
        shutdown_tx: watch::Sender<bool>,
    },
    Https {
        task: JoinHandle<std::io::Result<()>>,
        handle: axum_server::Handle<SocketAddr>,
    },
}

/// A started sidecar: bound address, shared state, and the handles
/// needed for an orderly shutdown.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub state: AppState,
    serve: ServeHandle,
    tickers: Vec<JoinHandle<()>>,
}

/// Build everything, run the synchronous startup passes, and bind.
pub async fn start(config: ServerConfig) -> Result<RunningServer> {
    let config = Arc::new(config);

    // Preflight both data directories before touching anything else.
    let db_dir = config
        .db_path
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    preflight_dir(&db_dir, config.min_free_bytes).context("database directory preflight failed")?;
    preflight_dir(&config.logs_path, config.min_free_bytes)
        .context("logs directory preflight failed")?;

    let store = IndexStore::open(&config.db_path)
        .await
        .context("failed to open index store")?;
    let indexer = Arc::new(Indexer::new(store.clone(), &config.logs_path));
    let query = QueryService::new(store.clone());
    let index_status = IndexStatus::default();

    // First pass runs before we listen so /health reflects reality.
    match run_index_pass(&indexer, &index_status, IndexMode::Incremental).await {
        Ok(Some(report)) => info!(
            files = report.files_scanned,
            inserted = report.records_inserted,
            "startup index pass complete"
        ),
        Ok(None) => {}
        Err(err) => warn!(error = %err, "startup index pass failed"),
    }

    let alerts = AlertManager::new(
        store.clone(),
        config.resolved_alert_config_path(),
        config.alert_seed.clone(),
    );

    let maintenance = MaintenanceLoop::new(
        store.clone(),
        RetentionConfig {
            logs_root: config.logs_path.clone(),
            log_retention_days: config.log_retention_days,
            log_audit_retention_days: config.log_audit_retention_days,
            db_retention_days: config.db_retention_days,
            db_audit_retention_days: config.db_audit_retention_days,
            audit_backup_directory: config.audit_backup_directory.clone(),
        },
    );

    let ingest = IngestPipeline::new(
        config.logs_path.clone(),
        Arc::clone(&indexer),
        index_status.clone(),
        config.ingest_async_queue,
        config.ingest_queue_flush_ms,
    );

    let state = AppState {
        config: Arc::clone(&config),
        store: store.clone(),
        indexer: Arc::clone(&indexer),
        query,
        alerts: alerts.clone(),
        ingest,
        maintenance: maintenance.clone(),
        index_status: index_status.clone(),
        started_at: Instant::now(),
        service_url: Arc::new(StdMutex::new(String::new())),
    };

    let app = build_router(state.clone());

    // One synchronous maintenance pass, then the timers.
    maintenance.run_once().await;

    let mut tickers = Vec::new();
    {
        let maintenance = maintenance.clone();
        let interval_ms = config
            .maintenance_interval_ms
            .max(MIN_MAINTENANCE_INTERVAL_MS);
        tickers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the startup pass already ran
            loop {
                ticker.tick().await;
                maintenance.run_once().await;
            }
        }));
    }

    if !config.disable_auto_ingest {
        let indexer = Arc::clone(&indexer);
        let index_status = index_status.clone();
        let interval_ms = config.ingest_interval_ms.max(100);
        tickers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the startup pass already ran
            loop {
                ticker.tick().await;
                if let Err(err) =
                    run_index_pass(&indexer, &index_status, IndexMode::Incremental).await
                {
                    warn!(error = %err, "auto-ingest pass failed");
                }
            }
        }));
    }

    // Bind and serve.
    let serve = match config.protocol {
        Protocol::Http => {
            let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
                .await
                .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
            let addr = listener.local_addr()?;
            let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.changed().await;
                    })
                    .await
            });
            (addr, ServeHandle::Http { task, shutdown_tx })
        }
        Protocol::Https => {
            let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) else {
                bail!("https requires both tlsCertPath and tlsKeyPath");
            };
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("failed to load TLS certificate or key")?;
            let bind_addr = resolve_addr(&config.host, config.port)?;
            let handle = axum_server::Handle::new();
            let task = {
                let handle = handle.clone();
                tokio::spawn(async move {
                    axum_server::bind_rustls(bind_addr, tls)
                        .handle(handle)
                        .serve(app.into_make_service())
                        .await
                })
            };
            let addr = handle
                .listening()
                .await
                .context("HTTPS listener failed to start")?;
            (addr, ServeHandle::Https { task, handle })
        }
    };
    let (addr, serve) = serve;

    let service_url = format!("{}://{}:{}", config.protocol.scheme(), config.host, addr.port());
    state.set_service_url(service_url.clone());
    info!(url = %service_url, "mikroscope listening");

    // Alerting last: the first cycle fires with the service URL set.
    alerts.start();

    Ok(RunningServer {
        addr,
        state,
        serve,
        tickers,
    })
}

impl RunningServer {
    /// Orderly shutdown: timers, alerting, listener, queue drain,
    /// store. Idempotent by construction (handles are consumed).
    pub async fn shutdown(self) {
        info!("shutting down");
        for ticker in &self.tickers {
            ticker.abort();
        }
        self.state.alerts.stop();

        match self.serve {
            ServeHandle::Http { task, shutdown_tx } => {
                let _ = shutdown_tx.send(true);
                if let Err(err) = task.await {
                    if !err.is_cancelled() {
                        warn!(error = %err, "HTTP task ended abnormally");
                    }
                }
            }
            ServeHandle::Https { task, handle } => {
                handle.graceful_shutdown(Some(Duration::from_secs(10)));
                if let Err(err) = task.await {
                    if !err.is_cancelled() {
                        warn!(error = %err, "HTTPS task ended abnormally");
                    }
                }
            }
        }

        // Drain the ingest queue once; errors are logged inside.
        self.state.ingest.shutdown().await;
        self.state.store.close().await;
        info!("shutdown complete");
    }
}

/// Run until SIGINT or SIGTERM.
pub async fn run(config: ServerConfig) -> Result<()> {
    let server = start(config).await?;
    shutdown_signal().await;
    server.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))
}
