//! Room Controller service binary.
//!
//! Wires configuration, logging, the media engine, the room registry,
//! and the HTTP surface, then serves until interrupted. Runs against
//! the in-process engine until a real SFU binding is wired in.

use anyhow::Context;
use media_engine::inprocess::InProcessEngine;
use room_controller::config::Config;
use room_controller::registry::RegistryActor;
use room_controller::server::{app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Simulated workers for the in-process engine.
const DEFAULT_WORKER_COUNT: u32 = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env().context("loading configuration")?);
    info!(target: "server", ?config, "starting room controller");

    let engine = Arc::new(InProcessEngine::new(DEFAULT_WORKER_COUNT));
    let cancel_token = CancellationToken::new();
    let (registry, registry_task) =
        RegistryActor::spawn(Arc::clone(&config), engine, cancel_token.clone());

    let state = AppState {
        registry: registry.clone(),
        config: Arc::clone(&config),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("binding {}", config.listen_address))?;
    info!(target: "server", address = %config.listen_address, "listening");

    let server = axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel_token.clone()));

    server.await.context("serving")?;

    info!(target: "server", "shutting down");
    registry.shutdown().await;
    cancel_token.cancel();
    let _ = registry_task.await;

    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if result.is_err() {
                return;
            }
            info!(target: "server", "interrupt received");
        }
        () = cancel_token.cancelled() => {}
    }
}
