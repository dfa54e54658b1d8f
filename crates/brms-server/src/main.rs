mod api;
mod middleware;

use std::{env, net::SocketAddr, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::get,
};
use brms_core::{
    Database, MatchMode, RuleExecutor, RuleSetRepository, config::AppConfig, init_telemetry,
    migrations,
};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, timeout::TimeoutLayer};
use tracing::{info, warn};

use crate::api::ApiError;

#[derive(Clone)]
struct AppState {
    db: Database,
    rule_sets: RuleSetRepository,
    executor: RuleExecutor,
}

impl AppState {
    fn new(db: Database, match_mode: MatchMode) -> Self {
        let rule_sets = RuleSetRepository::new(db.clone());
        Self {
            executor: RuleExecutor::new(rule_sets.clone(), match_mode),
            rule_sets,
            db,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = brms_core::Config::load(&config_path)?;

    let telemetry = init_telemetry(
        &config.app,
        &config.telemetry,
        config.paths.log_file.as_deref(),
    )?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let state = AppState::new(db, config.engine.match_mode);
    let match_mode = state.executor.mode();
    let app = router(state, &config.app);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        %match_mode,
        exports_traces = telemetry.exports_traces(),
        "BRMS listening on {}",
        listener.local_addr()?
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("server stopped");
    drop(telemetry);
    Ok(())
}

fn router(state: AppState, app: &AppConfig) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .merge(api::router())
        .fallback(not_found)
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(app.request_timeout_secs)))
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .layer(CompressionLayer::new())
        .layer(middleware::cors_layer(&app.cors_origins))
        .layer(axum::middleware::from_fn(middleware::log_requests))
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "application running smoothly" }))
}

async fn not_found() -> ApiError {
    ApiError::not_found("resource not found")
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    database: String,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = match state.db.health_check().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "database health check failed");
            false
        }
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: if healthy { "ok" } else { "unhealthy" }.to_string(),
        }),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }
}
