use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hub_gateway::{AppConfig, HubRegistry, VERSION, build_router, engine, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        ?config.listen_addr,
        registry = %config.hub_registry.display(),
        auth = config.enable_auth,
        "loading hub registry"
    );

    let registry = Arc::new(HubRegistry::load(
        &config.hub_registry,
        config.persist_timeout,
    )?);
    let engine = engine::from_config(&config)?;
    let router = build_router(config.clone(), registry, engine);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, version = VERSION, "gateway ready");

    server::run(listener, router, config.shutdown_grace).await?;
    tracing::info!("gateway stopped");

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
