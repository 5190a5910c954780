// ============================================================
// Layer 8 — Model Serving (HTTP)
// ============================================================
// An axum server around one trained checkpoint:
//
//   serve.model_path        checkpoint stem to load
//   serve.host / port       bind address
//   serve.max_upload_bytes  request body limit
//   serve.cors              permissive CORS on/off
//
// Startup tries to load the model; a failure is only a warning
// and handlers keep retrying the load (503 until it works).
// Ctrl-C shuts the server down gracefully.
//
// Reference: axum documentation (Router, Multipart, State)

pub mod error;
pub mod handlers;
pub mod state;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::{path::PathBuf, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{AppConfig, ServeConfig};
use crate::ml::inferencer::Predictor;
use state::{AppState, ModelLoader, SharedPredictor};

/// Build the router with all endpoints and layers.
pub fn router(state: AppState, cfg: &ServeConfig) -> Router {
    let app = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/classes", get(handlers::classes))
        .route("/model-info", get(handlers::model_info))
        .route("/predict", post(handlers::predict))
        .route("/predict_batch", post(handlers::predict_batch))
        .layer(DefaultBodyLimit::max(cfg.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cfg.cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Loader reading the configured checkpoint into a CPU predictor.
pub fn checkpoint_loader(model_path: impl Into<PathBuf>) -> ModelLoader {
    let path = model_path.into();
    Arc::new(move || {
        let predictor = Predictor::from_checkpoint(&path)?;
        Ok(Arc::new(predictor) as SharedPredictor)
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Serve until Ctrl-C.
pub async fn run(cfg: AppConfig) -> Result<()> {
    let serve = cfg.serve.clone();
    let state = AppState::new(
        checkpoint_loader(&serve.model_path),
        cfg.data.name.as_str(),
        "cpu",
    );

    let startup = state.clone();
    match tokio::task::spawn_blocking(move || startup.load_now()).await {
        Ok(Ok(_))  => tracing::info!("Model loaded from '{}'", serve.model_path),
        Ok(Err(e)) => tracing::warn!("Could not load model at startup, will retry on request: {e:#}"),
        Err(e)     => tracing::warn!("Model load task failed: {e}"),
    }

    let app  = router(state, &serve);
    let addr = format!("{}:{}", serve.host, serve.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot bind {addr}"))?;
    tracing::info!("Serving on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        ServiceExt::<Request<Body>>::oneshot(app, req).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_missing_checkpoint_gives_503_and_health_ok() {
        let tmp   = tempfile::tempdir().unwrap();
        let state = AppState::new(checkpoint_loader(tmp.path().join("simple_cnn_best")), "cifar10", "cpu");
        let cfg   = ServeConfig::default();

        assert_eq!(get_status(router(state.clone(), &cfg), "/health").await, StatusCode::OK);
        assert_eq!(get_status(router(state.clone(), &cfg), "/model-info").await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(get_status(router(state, &cfg), "/nope").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_header_when_enabled() {
        let tmp   = tempfile::tempdir().unwrap();
        let state = AppState::new(checkpoint_loader(tmp.path().join("x")), "cifar10", "cpu");
        let app   = router(state, &ServeConfig::default());

        let req = Request::builder()
            .uri("/health")
            .header("origin", "http://example.com")
            .body(Body::empty())
            .unwrap();
        let resp = ServiceExt::<Request<Body>>::oneshot(app, req).await.unwrap();
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }
}
