use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use super::{SharedState, router};
use crate::config::PhasegateConfig;
use crate::context::AppContext;
use crate::store::{TaskStore, now_utc};

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            dev_mode: false,
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &PhasegateConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            dev_mode: config.server.dev,
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// Build the full application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Periodically expire stale tasks and approvals. The first tick fires
/// immediately.
pub fn spawn_sweeper(store: TaskStore, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = store.sweep(now_utc()).await {
                error!(error = %e, "Expiry sweep failed");
            }
        }
    })
}

/// Recover interrupted work, start the sweeper and serve until Ctrl+C.
pub async fn start_server(ctx: Arc<AppContext>, config: ServerConfig) -> Result<()> {
    ctx.orchestrator
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted tasks")?;

    let sweeper = spawn_sweeper(ctx.store.clone(), config.sweep_interval);
    let app = build_router(Arc::clone(&ctx), config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, dev_mode = config.dev_mode, "Server listening");
    println!("Phasegate running at http://{}", local_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");
    sweeper.abort();
    served?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::test_state;
    use crate::store::{TaskInput, TaskStatus};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use phasegate_common::DepthTier;
    use tower::ServiceExt;

    #[test]
    fn test_server_config_from_config() {
        let mut config = PhasegateConfig::default();
        config.server.port = 9100;
        config.server.dev = true;
        config.workflow.sweep_interval_secs = 60;
        let server = ServerConfig::from_config(&config);
        assert_eq!(server.port, 9100);
        assert!(server.dev_mode);
        assert_eq!(server.sweep_interval, Duration::from_secs(60));
        assert_eq!(ServerConfig::default().port, 8000);
    }

    #[tokio::test]
    async fn test_dev_mode_adds_cors_headers() {
        let app = build_router(test_state(), true);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        );
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = build_router(test_state(), false);
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sweeper_expires_on_first_tick() {
        let state = test_state();
        let input = TaskInput::new("atlas", "A booking platform for clinics", DepthTier::Quick);
        state
            .store
            .enqueue("stale", input, chrono::Duration::seconds(-5))
            .await
            .unwrap();

        let handle = spawn_sweeper(state.store.clone(), Duration::from_secs(3600));
        for _ in 0..100 {
            let task = state.store.get_task("stale").await.unwrap().unwrap();
            if task.status == TaskStatus::Expired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        let task = state.store.get_task("stale").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Expired);
    }
}
