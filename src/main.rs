//! Portshare relay - session broker for live development tunnels
//!
//! Runs the control plane: session registry, discovery, lifecycle
//! supervisor, and the HTTP API the gateway layer talks to.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portshare_api::{ApiServer, ApiServerConfig};
use portshare_auth::{CredentialIssuer, IssuerConfig};
use portshare_broker::{BrokerConfig, SupervisorConfig, TunnelBroker};
use portshare_proto::TransportEndpoint;
use portshare_router::{AllocatorConfig, UrlAllocator};

/// Portshare - expose local development servers through live tunnels
#[derive(Parser, Debug)]
#[command(name = "portshare")]
#[command(about = "Portshare - session broker for live development tunnels")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Address to bind the control-plane API
    #[arg(long, env = "PORTSHARE_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Public domain tunnel URLs are built under
    #[arg(long, env = "PORTSHARE_DOMAIN", default_value = "portshare.dev")]
    domain: String,

    /// Relay host owners' transports connect to
    #[arg(long, env = "PORTSHARE_RELAY_HOST", default_value = "relay.portshare.dev")]
    relay_host: String,

    /// Relay port owners' transports connect to
    #[arg(long, env = "PORTSHARE_RELAY_PORT", default_value = "443")]
    relay_port: u16,

    /// Secret used to sign transport credentials
    #[arg(long, env = "PORTSHARE_CREDENTIAL_SECRET")]
    credential_secret: String,

    /// Maximum session duration in hours; never extended
    #[arg(long, env = "PORTSHARE_MAX_DURATION_HOURS", default_value = "8")]
    max_duration_hours: i64,

    /// Concurrent viewer cap stamped on new sessions
    #[arg(long, env = "PORTSHARE_VIEWER_CAP", default_value = "10")]
    viewer_cap: u32,

    /// Lifecycle sweep interval in seconds
    #[arg(long, env = "PORTSHARE_SWEEP_INTERVAL_SECS", default_value = "30")]
    sweep_interval_secs: u64,

    /// Global concurrent session cap
    #[arg(long, env = "PORTSHARE_MAX_SESSIONS", default_value = "512")]
    max_sessions: usize,

    /// Per-owner concurrent session cap
    #[arg(long, env = "PORTSHARE_MAX_SESSIONS_PER_OWNER", default_value = "5")]
    max_sessions_per_owner: usize,

    /// Disable CORS on the API server
    #[arg(long, env = "PORTSHARE_DISABLE_CORS")]
    disable_cors: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!(
        version = env!("GIT_TAG"),
        commit = env!("GIT_HASH"),
        built = env!("BUILD_TIME"),
        "Starting portshare relay"
    );

    let issuer = Arc::new(CredentialIssuer::new(
        cli.credential_secret.as_bytes(),
        IssuerConfig {
            // Credentials must outlive the longest possible session
            validity: chrono::Duration::hours(cli.max_duration_hours + 1),
            max_sessions: cli.max_sessions,
            max_sessions_per_owner: cli.max_sessions_per_owner,
            ..Default::default()
        },
    ));
    let allocator = Arc::new(UrlAllocator::new(AllocatorConfig {
        public_domain: cli.domain.clone(),
        ..Default::default()
    }));
    let broker = Arc::new(TunnelBroker::new(
        issuer,
        allocator,
        BrokerConfig {
            max_duration: Duration::from_secs(
                u64::try_from(cli.max_duration_hours)
                    .context("max duration must be positive")?
                    * 60
                    * 60,
            ),
            viewer_tier_cap: cli.viewer_cap,
            transport_endpoint: TransportEndpoint::new(
                cli.relay_host.clone(),
                cli.relay_port,
                "websocket",
            ),
            supervisor: SupervisorConfig {
                sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
                ..Default::default()
            },
        },
    ));

    let background_tasks = broker.start();

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: cli.bind,
            enable_cors: !cli.disable_cors,
        },
        broker,
    );

    tokio::select! {
        result = server.start() => {
            result.context("API server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping");
        }
    }

    for task in background_tasks {
        task.abort();
    }

    Ok(())
}
