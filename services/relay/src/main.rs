//! fourtosix
//!
//! Relay for IPv4-only clients to reach IPv6-only HTTPS and HTTP services.
//!
//! This service:
//! - Accepts TCP connections on a TLS and/or an HTTP listener
//! - Reads the destination from the ClientHello SNI or the Host header
//! - Checks it against a per-listener suffix allow-list
//! - Dials the backend, optionally from an IPv6 address embedding the
//!   client's IPv4 address
//! - Replays the sniffed bytes and splices the connection

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fourtosix_relay::proxy::{build_dialer_factory, Listener};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{Config, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!("Starting fourtosix");

    let listener_configs = config.listeners()?;
    let dialer_factory = build_dialer_factory(config.v4_subnet.as_deref(), config.dial_timeout())
        .context("invalid --v4-subnet")?;

    info!(
        v4_subnet = config.v4_subnet.as_deref().unwrap_or("<none>"),
        listener_count = listener_configs.len(),
        sniff_timeout_ms = config.sniff_timeout_ms,
        dial_timeout_ms = config.dial_timeout_ms,
        "Configuration loaded"
    );

    if config.v4_subnet.is_none() {
        warn!("No --v4-subnet configured; backends will see this host's address, not the client's");
    }

    let mut listener_handles = Vec::new();

    for listener_config in listener_configs {
        let bind_addr = listener_config.bind_addr;
        let protocol = listener_config.protocol;

        if listener_config.allow_list.is_open() {
            warn!(
                protocol = %protocol,
                "No permitted suffixes configured; relaying to any hostname"
            );
        }

        let listener = match Listener::bind(listener_config, Arc::clone(&dialer_factory)).await {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                error!(
                    bind_addr = %bind_addr,
                    protocol = %protocol,
                    error = %e,
                    "Failed to bind listener"
                );
                return Err(e).with_context(|| format!("binding {protocol} listener on {bind_addr}"));
            }
        };

        listener_handles.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(protocol = %protocol, error = %e, "Listener error");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    for handle in listener_handles {
        handle.abort();
    }

    Ok(())
}
