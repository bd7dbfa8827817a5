use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{Router, middleware, routing::get};
use rulestream_db_memory::{Fixtures, InMemoryFactStore, InMemorySearchBackend};
use rulestream_storage::{DynFactStore, DynSearchBackend};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::exports::{ExportQueue, ExportService, ExportWorker, SearchBackends, retention, routes};
use crate::{handlers, middleware as app_middleware};

/// Router state shared by every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub service: Arc<ExportService>,
    /// Include internal error details in 500 responses
    pub verbose_errors: bool,
}

pub fn build_app(cfg: &AppConfig, state: AppState) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .merge(routes::export_routes())
        .with_state(state)
        // Middleware stack (order: request id -> trace -> caller identity -> body limit)
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(app_middleware::caller_identity))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
}

pub struct RulestreamServer {
    addr: SocketAddr,
    app: Router,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    backends: Option<(DynFactStore, DynSearchBackend)>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            backends: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Uses the given fact store and search backend instead of the
    /// in-memory ones seeded from `storage.fixtures`.
    pub fn with_backends(mut self, facts: DynFactStore, search: DynSearchBackend) -> Self {
        self.backends = Some((facts, search));
        self
    }

    /// Wires the export core and spawns its worker and retention tasks.
    /// Must be called inside a Tokio runtime.
    pub async fn build(self) -> anyhow::Result<RulestreamServer> {
        let cfg = self.config;
        let exports = cfg.exports.clone();

        let (facts, search) = match self.backends {
            Some(backends) => backends,
            None => memory_backends(&cfg).await?,
        };

        let mut backends = SearchBackends::new(search.clone());
        for (name, backend) in &cfg.search_backends {
            tracing::info!(backend = %name, export_activated = backend.export_activated, "Search backend registered");
            backends = backends.with_backend(name.clone(), search.clone(), backend.export_activated);
        }
        let backends = Arc::new(backends);

        tokio::fs::create_dir_all(&exports.export_path)
            .await
            .with_context(|| format!("creating export directory {}", exports.export_path.display()))?;

        let (queue, jobs) = ExportQueue::new(exports.queue_capacity, exports.export_path.clone());
        let queue = Arc::new(queue);
        let shutdown = CancellationToken::new();

        let worker = ExportWorker::new(queue.clone(), backends.clone(), exports.batch_size);
        let tasks = vec![
            worker.spawn(jobs, exports.max_concurrent_jobs, shutdown.clone()),
            retention::start_cleanup_task(
                queue.clone(),
                exports.cleanup_interval(),
                exports.retention(),
                shutdown.clone(),
            ),
        ];

        tracing::info!(
            export_path = %exports.export_path.display(),
            queue_capacity = exports.queue_capacity,
            max_concurrent_jobs = exports.max_concurrent_jobs,
            direct_download = exports.direct_download,
            "Export service initialized"
        );

        let state = AppState {
            service: Arc::new(ExportService::new(queue, facts, backends, exports)),
            verbose_errors: cfg.server.verbose_errors,
        };
        let app = build_app(&cfg, state);

        Ok(RulestreamServer {
            addr: self.addr,
            app,
            shutdown,
            tasks,
        })
    }
}

async fn memory_backends(cfg: &AppConfig) -> anyhow::Result<(DynFactStore, DynSearchBackend)> {
    let (store, search) = match &cfg.storage.fixtures {
        Some(path) => Fixtures::load(path)
            .await
            .with_context(|| format!("loading fixtures {}", path.display()))?
            .into_backends(),
        None => {
            tracing::warn!("No fixtures configured, in-memory backends start empty");
            (InMemoryFactStore::new(), InMemorySearchBackend::new())
        }
    };
    Ok((Arc::new(store), Arc::new(search)))
}

impl RulestreamServer {
    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on an already bound listener until `signal` resolves, then
    /// stops the background export tasks.
    pub async fn serve(
        self,
        listener: TcpListener,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(signal)
            .await;

        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => {
            tracing::debug!(error = %e, "Ctrl+C handler unavailable, serving until killed");
            std::future::pending::<()>().await;
        }
    }
}
