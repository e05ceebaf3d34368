use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa_swagger_ui::SwaggerUi;

use meshflow_api::config::{shutdown_grace_period, ApiConfig};
use meshflow_api::coordinator::Coordinator;
use meshflow_api::routes::{self, AppState};
use meshflow_api::telemetry::init_tracing;
use meshflow_client::ServiceClient;
use meshflow_store::{InMemoryStore, PostgresStore, Store};
use meshflow_worker::{WorkerConfig, WorkerLoop};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = ApiConfig::from_env();
    init_tracing(&config.log_filter);

    info!(store_url = %config.store_url, worker_count = config.worker_count, "starting meshflow");

    let store: Arc<dyn Store> = if config.uses_postgres() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect(&config.store_url)
            .await
            .context("failed to connect to STORE_URL")?;
        Arc::new(PostgresStore::new(pool))
    } else {
        Arc::new(InMemoryStore::new())
    };

    let client = ServiceClient::new(Duration::from_secs(30));
    let mut worker_loops = Vec::new();
    let mut worker_handles = Vec::new();
    for i in 0..config.worker_count {
        let worker_config = WorkerConfig::from_env().with_worker_id(format!("worker-{i}"));
        let worker = Arc::new(WorkerLoop::new(worker_config, store.clone(), client.clone()));
        let run_handle = {
            let worker = worker.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.run().await {
                    tracing::error!(error = %e, "worker loop exited with error");
                }
            })
        };
        worker_loops.push(worker);
        worker_handles.push(run_handle);
    }

    let coordinator = Arc::new(Coordinator::new(store.clone()));
    let app = routes::routes(AppState { coordinator })
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", openapi()))
        .layer(TraceLayer::new_for_http());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "submission API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("draining workers");
    for worker in &worker_loops {
        worker.shutdown();
    }
    let grace = shutdown_grace_period();
    let _ = tokio::time::timeout(grace, futures::future::join_all(worker_handles)).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[derive(utoipa::OpenApi)]
#[openapi(paths(), components())]
struct ApiDoc;

fn openapi() -> utoipa::openapi::OpenApi {
    <ApiDoc as utoipa::OpenApi>::openapi()
}
