use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::audit::Audit;
use crate::catalog::SqliteCatalog;
use crate::config::VigilConfig;
use crate::db::{DbHandle, VigilDb};
use crate::engine::{ProcessEngine, ScanEngine};
use crate::events::EventHub;
use crate::queue::JobQueue;
use crate::runs::RunManager;
use crate::worker::Worker;
use crate::workflow::WorkflowOrchestrator;
use crate::ws;

/// Everything assembled around one database handle: the shared HTTP
/// state plus the worker that drains the job queue.
pub struct AppParts {
    pub state: SharedState,
    pub worker: Arc<Worker>,
}

/// Wire the services together. The caller decides whether to actually
/// spawn the worker (tests often drive jobs by hand).
pub fn build_app(db: DbHandle, engine: Arc<dyn ScanEngine>) -> AppParts {
    let hub = EventHub::new();
    let queue = JobQueue::new(db.clone());
    let catalog = Arc::new(SqliteCatalog::new(db.clone()));
    let audit = Audit::new(db.clone());

    let runs = RunManager::new(
        db.clone(),
        queue.clone(),
        hub.clone(),
        engine.clone(),
        catalog.clone(),
        audit.clone(),
    );
    let workflows = WorkflowOrchestrator::new(db.clone(), hub.clone(), engine.clone(), audit);
    let worker = Arc::new(Worker::new(
        db.clone(),
        queue,
        hub.clone(),
        engine,
    ));

    let state = Arc::new(AppState {
        db,
        hub,
        runs,
        workflows,
        catalog,
    });

    AppParts { state, worker }
}

/// Build the full application router with API, SSE, and WebSocket routes.
pub fn build_router(state: SharedState) -> Router {
    let hub = state.hub.clone();
    api::api_router()
        .route(
            "/ws",
            get(move |upgrade| ws::ws_handler(upgrade, hub.subscribe_mirror())),
        )
        .with_state(state)
}

/// Start the vigil server.
pub async fn start_server(config: VigilConfig) -> Result<()> {
    // Ensure parent directory exists for the database.
    if let Some(parent) = config.server.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = DbHandle::new(
        VigilDb::new(&config.server.db_path).context("Failed to initialize vigil database")?,
    );
    seed_catalog(&db, &config)?;

    let engine: Arc<dyn ScanEngine> = Arc::new(ProcessEngine::new(
        config.engine.command.clone(),
        config.engine.args.clone(),
    ));
    let parts = build_app(db, engine);
    parts.worker.clone().spawn();

    let mut app = build_router(parts.state);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("vigil running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

/// Seed catalog records from the config file. The catalog is owned by an
/// external system in production; this keeps a standalone deployment and
/// tests usable.
pub fn seed_catalog(db: &DbHandle, config: &VigilConfig) -> Result<()> {
    let guard = db.lock_sync()?;
    for tool in &config.catalog.tools {
        guard.seed_tool(tool)?;
    }
    for scope in &config.catalog.scopes {
        guard.seed_scope(scope)?;
    }
    for user in &config.catalog.users {
        guard.seed_user(user)?;
    }
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}
