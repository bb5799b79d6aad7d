//! Sender binary entry point: the HTTP front door that authenticates
//! callers and dispatches via AMQP RPC. Forwarding the request to the
//! chosen backend and relaying its streamed response is an external
//! relay's job, not this binary's.

mod admission;
mod config;
mod handler;
mod rpc_client;

use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use gateway_core::{InMemoryUserStore, Result, UserStore};
use lapin::{Connection, ConnectionProperties};

use config::SenderConfig;
use handler::AppState;
use rpc_client::SenderRPCClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SenderConfig::load()?;
    tracing::info!(addr = %config.bind_addr, "starting sender");

    let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::from_json(&config.users)?);

    let connection = Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    let rpc = Arc::new(SenderRPCClient::connect(channel).await?);

    let state = AppState {
        users,
        rpc,
        message_timeout: config.message_timeout,
    };

    let app = Router::new()
        .route("/dispatch", post(handler::dispatch))
        .route("/complete", post(handler::complete))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| gateway_core::GatewayError::config(format!("failed to bind {}: {e}", config.bind_addr)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await
        .map_err(|e| gateway_core::GatewayError::protocol(e.to_string()))?;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
}
