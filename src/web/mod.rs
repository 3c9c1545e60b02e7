pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod state;

pub use state::AppState;

use crate::{config::DEFAULT_MODEL, models::ModelRegistry, utils::error::DetectError, Config, Result};
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::QueryRejection,
        DefaultBodyLimit, Multipart, Query, State,
    },
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, MethodRouter},
    Router,
};
use extractors::DetectQuery;
use middleware::{limit_concurrency, request_logging, ConcurrencyGate};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer};

pub async fn serve(config: Config) -> Result<()> {
    let registry = ModelRegistry::load(&config)?;
    let state = AppState::new(config.clone(), registry);
    let app = create_app(state);

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| DetectError::Config(format!("Invalid bind address {}: {}", config.bind_addr, e)))?;

    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("Default model: {}", config.default_model().model_path.display());
    tracing::info!("API endpoints:");
    tracing::info!("  POST /detect          - Multipart image upload (sync)");
    for spec in config.models.iter().filter(|s| s.name != DEFAULT_MODEL) {
        tracing::info!("  POST /detect_{:<10} - Multipart image upload (sync)", spec.name);
    }
    tracing::info!("  POST /detect_async    - Multipart image upload (task)");
    tracing::info!("  GET  /task/:task_id   - Task status");
    tracing::info!("  GET  /classes         - Label index to name mapping");
    tracing::info!("  GET  /health          - Health check");
    tracing::info!("  GET  /api/info        - Service information");

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DetectError::Internal(format!("Failed to bind to address {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| DetectError::Internal(format!("Server failed: {}", e)))?;

    tracing::info!("Server stopped");
    Ok(())
}

pub fn create_app(state: AppState) -> Router {
    let server = state.config.server_config.clone();
    let meta_limit = server.meta_max_concurrent;

    let mut app = Router::new()
        .route("/detect", gated(post(handlers::detect_handler), "/detect", server.detect_max_concurrent))
        .route("/detect_async", post(handlers::detect_async_handler))
        .route("/task/:task_id", gated(get(handlers::task_status_handler), "/task", meta_limit))
        .route("/classes", gated(get(handlers::classes_handler), "/classes", meta_limit))
        .route(
            "/classes/:model",
            gated(get(handlers::model_classes_handler), "/classes/:model", meta_limit),
        )
        .route("/linc_test", gated(get(handlers::linc_test_handler), "/linc_test", meta_limit))
        .route("/health", get(handlers::health_handler))
        .route("/api/info", get(handlers::info_handler));

    // one sync endpoint per extra model, e.g. /detect_lion
    for name in state.registry.names().filter(|n| *n != DEFAULT_MODEL) {
        let path = format!("/detect_{}", name);
        let model = name.to_string();
        let handler = post(
            move |state: State<AppState>,
                  query: std::result::Result<Query<DetectQuery>, QueryRejection>,
                  multipart: std::result::Result<Multipart, MultipartRejection>| {
                let model = model.clone();
                async move { handlers::detect_with_model(state, model, query, multipart).await }
            },
        );
        app = app.route(&path, gated(handler, &path, server.detect_max_concurrent));
    }

    app.layer(from_fn(request_logging))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(server.max_request_size))
        .layer(TimeoutLayer::new(Duration::from_secs(server.request_timeout)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn gated(route: MethodRouter<AppState>, name: &str, max_concurrent: usize) -> MethodRouter<AppState> {
    route.layer(from_fn_with_state(
        ConcurrencyGate::new(name, max_concurrent),
        limit_concurrency,
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("Failed to listen for SIGTERM: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining requests");
}
