mod extract;
mod handlers;
mod hub;
pub mod middleware;
mod streaming;

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Router,
    routing::{delete, get, post},
};
use tokio::{net::TcpListener, sync::Notify};
use tracing::{info, warn};

use crate::{config::AppConfig, engine::Engine, hub::HubRegistry};

pub use handlers::{ChatMessage, InferenceResponse, format_chat_messages};
pub use middleware::{MiddlewareChain, Policy};
pub use streaming::event_stream;

pub const API_PREFIX: &str = "/api/v1";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<HubRegistry>,
    pub engine: Arc<dyn Engine>,
    pub started_at: Instant,
}

pub fn build_router(
    config: Arc<AppConfig>,
    registry: Arc<HubRegistry>,
    engine: Arc<dyn Engine>,
) -> Router {
    build_router_with_chain(config, registry, engine, &MiddlewareChain::default())
}

pub fn build_router_with_chain(
    config: Arc<AppConfig>,
    registry: Arc<HubRegistry>,
    engine: Arc<dyn Engine>,
    chain: &MiddlewareChain,
) -> Router {
    let state = AppState {
        config,
        registry,
        engine,
        started_at: Instant::now(),
    };

    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/info", get(handlers::info))
        .route("/models", get(handlers::list_models))
        .route("/models/load", post(handlers::load_model))
        .route("/models/:id/unload", delete(handlers::unload_model))
        .route("/generate", post(handlers::generate))
        .route("/completions", post(handlers::generate))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/generate/stream", post(handlers::generate_stream))
        .route(
            "/hub/models",
            get(hub::list_models).post(hub::register_model),
        )
        .route("/hub/models/:id", get(hub::get_model))
        .route("/hub/models/:id/download", get(hub::download_file))
        .fallback(handlers::route_not_found);

    let api = chain.apply(api, &state).with_state(state);

    Router::new()
        .nest(API_PREFIX, api)
        .fallback(handlers::route_not_found)
}

/// Serves `router` until a shutdown signal arrives.
pub async fn run(listener: TcpListener, router: Router, grace: Duration) -> std::io::Result<()> {
    run_until(listener, router, grace, shutdown_signal()).await
}

/// Serves until `signal` resolves, then stops accepting and gives in-flight
/// requests up to `grace` to finish before abandoning them.
pub async fn run_until<F>(
    listener: TcpListener,
    router: Router,
    grace: Duration,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let draining = Arc::new(Notify::new());
    let trigger = draining.clone();

    let server = async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                signal.await;
                info!("shutdown requested, draining in-flight requests");
                trigger.notify_one();
            })
            .await
    };

    tokio::select! {
        result = server => result,
        _ = async {
            draining.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(?grace, "grace period elapsed, abandoning in-flight requests");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::oneshot,
    };

    use super::*;
    use crate::engine::StubEngine;

    #[tokio::test]
    async fn serves_until_signalled() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry =
            HubRegistry::load(dir.path().join("registry.json"), Duration::from_secs(5)).unwrap();
        let router = build_router(
            Arc::new(AppConfig::default()),
            Arc::new(registry),
            Arc::new(StubEngine::default()),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(run_until(
            listener,
            router,
            Duration::from_secs(1),
            async move {
                let _ = stop_rx.await;
            },
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            b"GET /api/v1/health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        stream.write_all(request).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.contains("\"status\":\"healthy\""));

        stop_tx.send(()).unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("server did not stop");
        finished.unwrap().unwrap();
    }
}
