mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use gradebox_common::config::EngineConfig;
use gradebox_engine::sandbox::build_provisioner;
use gradebox_engine::{ExecutionEngine, LanguageRegistry, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

pub struct AppState {
    pub pool: Arc<WorkerPool>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let json = std::env::var("GRADEBOX_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    warn!("Received shutdown signal, draining...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Gradebox worker booting...");

    let config = EngineConfig::from_env().context("invalid GRADEBOX_* configuration")?;

    let registry = LanguageRegistry::load_or_builtin(config.languages_path.as_deref())
        .context("failed to load language profiles")?;
    info!(languages = registry.len(), "Language profiles loaded");

    let provisioner = build_provisioner(&config).context("failed to set up sandbox backend")?;
    let engine = Arc::new(ExecutionEngine::new(&config, Arc::new(registry), provisioner));

    let status = engine.init().await.context("sandbox backend init failed")?;
    if !status.ready {
        anyhow::bail!("sandbox backend '{}' is not ready to provision", status.backend);
    }

    // Leftovers from a previous crash of this instance
    if let Err(e) = engine.sweep_orphans().await {
        warn!(error = %e, "Orphan sweep failed at startup");
    }

    let pool = Arc::new(WorkerPool::start(
        engine.clone(),
        config.workers,
        config.queue_capacity,
    ));
    let state = Arc::new(AppState { pool: pool.clone() });

    // Build router
    let app = Router::new()
        .merge(routes::routes())
        .with_state(state);

    let addr = std::env::var("GRADEBOX_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!(backend = engine.backend(), "HTTP server listening on {}", addr);
    info!("Ready to accept executions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    pool.shutdown(Duration::from_secs(config.drain_timeout_secs)).await;
    if !engine.drain().await {
        warn!(live = engine.live_sandboxes(), "Exiting with sandboxes still live");
    }

    info!("Gradebox worker stopped");
    Ok(())
}
