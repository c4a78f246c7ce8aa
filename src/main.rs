//! CTI line monitor
//!
//! Bridges a call-control provider to a WebSocket status channel and runs
//! the configured call-merge workflow when an inbound call is offered on the
//! route point. Startup blocks until the provider reports in service, then
//! the WebSocket endpoint and keep-alive push come up; the process runs
//! until killed.

mod config;
mod cti;
mod notify;
mod readiness;
mod router;
mod sequencer;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::MonitorConfig;
use cti::CallControlProvider;
use notify::{ClientRegistry, NotifyState};
use readiness::ReadinessTracker;
use router::EventRouter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cti_line_monitor=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = MonitorConfig::from_env()
        .context("CUCM_ADDRESS, CTI_USERNAME and CTI_PASSWORD must be set")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let cancel = CancellationToken::new();

    info!(address = %config.cti_address, "connecting provider");
    let (provider, events) = cti::gateway::connect(&config.provider_string(), cancel.clone())
        .await
        .context("failed to open the CTI gateway session")?;
    let provider: Arc<dyn CallControlProvider> = provider;

    let readiness = Arc::new(ReadinessTracker::new());
    let router = EventRouter::new(
        provider,
        readiness.clone(),
        config.rule.clone(),
        cancel.clone(),
    );
    tokio::spawn(router.run(events));

    info!("awaiting provider in service");
    readiness.provider.wait().await;
    info!("provider in service");

    let registry = Arc::new(ClientRegistry::new());
    notify::spawn_keepalive(registry.clone(), config.keepalive_interval, cancel.clone());

    let state = NotifyState {
        registry,
        roster: notify::roster_message(&config.monitored_lines),
    };
    let app = notify::create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.ws_port))
        .await
        .with_context(|| format!("failed to bind websocket port {}", config.ws_port))?;
    info!(port = config.ws_port, "websocket endpoint listening");
    axum::serve(listener, app).await?;

    Ok(())
}
