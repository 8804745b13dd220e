//! PostOffice - central message broker for a multi-agent service platform
//!
//! This is the main entry point for the broker server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use postoffice::broker::{self, AmqpBroker, BrokerTransport};
use postoffice::discovery::ServiceRegistration;
use postoffice::readiness::Readiness;
use postoffice::rest_api::{self, AppState};
use postoffice::PostOfficeConfig;
use tracing::{info, warn};

/// Command-line flags; each overrides its environment counterpart.
#[derive(Debug, Parser)]
#[command(name = "postoffice", about = "Central message broker and client gateway")]
struct Cli {
    /// Listen port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// AMQP connection URI (overrides RABBITMQ_URL)
    #[arg(long)]
    broker_url: Option<String>,

    /// Report ready even while the broker is down (bootstrap only)
    #[arg(long)]
    allow_degraded_ready: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("postoffice=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = PostOfficeConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(broker_url) = cli.broker_url {
        config.broker_url = broker_url;
    }
    if cli.allow_degraded_ready {
        config.allow_degraded_ready = true;
    }

    info!(
        port = config.port,
        exchange = %config.exchange,
        degraded_ready = config.allow_degraded_ready,
        "starting PostOffice message broker"
    );

    let readiness = Arc::new(Readiness::new(config.allow_degraded_ready));
    let amqp = Arc::new(AmqpBroker::new(&config, Arc::clone(&readiness)));
    let state = AppState::build(
        config,
        Arc::clone(&amqp) as Arc<dyn BrokerTransport>,
        readiness,
    )?;

    tokio::spawn(broker::run_connection_manager(
        Arc::clone(&amqp),
        Arc::clone(&state.router),
    ));
    tokio::spawn(broker::run_health_probe(
        Arc::clone(&amqp),
        Duration::from_secs(10),
    ));
    tokio::spawn(state.sweeper().run());

    register_with_discovery(&state).await;

    let listener = rest_api::bind(&state.config).await?;
    info!(addr = %listener.local_addr()?, "HTTP and socket ingress listening");
    axum::serve(listener, rest_api::create_app(Arc::clone(&state))).await?;

    info!("PostOffice shutting down");
    Ok(())
}

/// Announces this broker to the external discovery registry, when one is
/// deployed. Failure leaves the process perfectly serviceable.
async fn register_with_discovery(state: &Arc<AppState>) {
    if !state.discovery.is_configured() {
        return;
    }
    let url = state
        .config
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://localhost:{}", state.config.port));
    let registration = ServiceRegistration {
        id: state.config.component_id.clone(),
        service_name: state.config.component_id.clone(),
        url,
        tags: vec!["postoffice".to_string()],
        port: state.config.port,
    };
    match state.discovery.register(&registration).await {
        Ok(()) => state.readiness.set_discovery_registered(true),
        Err(reason) => warn!(%reason, "discovery self-registration failed"),
    }
}
