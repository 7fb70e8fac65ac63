//! # Tunnel Agent
//!
//! Maintains the control channel to a tunnel edge and relays each inbound
//! request to a local service.
//!
//! ## Modules
//!
//! - [`config`]     — environment/CLI configuration
//! - [`connection`] — control channel loop, heartbeat, dispatch
//! - [`worker`]      — per-request local HTTP call and response-mode selection
//! - [`reassembly`]  — inbound chunked-body reassembly buffers
//! - [`error`]       — agent error taxonomy

mod config;
mod connection;
mod error;
mod reassembly;
mod worker;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    let config = config::Config::parse();
    connection::run(config).await;
    Ok(())
}
