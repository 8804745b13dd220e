//! Broker configuration.
//!
//! All settings are readable from the environment; command-line flags win
//! over environment values. Defaults match the platform's conventional
//! deployment (broker at `rabbitmq:5672`, this service on port 5020).

use std::time::Duration;

use crate::domain_types::AuthToken;

/// Runtime configuration for the broker process.
#[derive(Debug, Clone)]
pub struct PostOfficeConfig {
    /// This broker's own component id, used as a recipient tag.
    pub component_id: String,
    /// HTTP/socket listen port.
    pub port: u16,
    /// Externally visible URL of this broker, if known.
    pub public_url: Option<String>,
    /// AMQP connection URI.
    pub broker_url: String,
    /// Topic exchange all service-to-service traffic is published to.
    pub exchange: String,
    /// Bootstrap override: report ready even while the broker is down.
    pub allow_degraded_ready: bool,
    /// Base URL of the external discovery registry, if deployed.
    pub discovery_url: Option<String>,
    /// Token attached to downstream service POSTs, if configured.
    pub service_token: Option<AuthToken>,
    /// Per-client offline queue cap; overflow evicts the oldest entry.
    pub offline_queue_cap: usize,
    /// Fallback sweeper tick interval.
    pub sweeper_interval: Duration,
    /// Synchronous broker RPC timeout.
    pub rpc_timeout: Duration,
    /// Downstream HTTP POST timeout.
    pub http_timeout: Duration,
    /// Discovery lookup retry attempts.
    pub discovery_attempts: u32,
    /// Delay between discovery lookup attempts.
    pub discovery_retry_delay: Duration,
}

impl Default for PostOfficeConfig {
    fn default() -> Self {
        Self {
            component_id: "PostOffice".to_string(),
            port: 5020,
            public_url: None,
            broker_url: "amqp://rabbitmq:5672/%2f".to_string(),
            exchange: "stage7".to_string(),
            allow_degraded_ready: false,
            discovery_url: None,
            service_token: None,
            offline_queue_cap: 1_000,
            sweeper_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(15),
            discovery_attempts: 5,
            discovery_retry_delay: Duration::from_secs(3),
        }
    }
}

impl PostOfficeConfig {
    /// Builds a configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(url) = std::env::var("POSTOFFICE_URL") {
            if !url.is_empty() {
                config.public_url = Some(url);
            }
        }
        if let Ok(url) = std::env::var("RABBITMQ_URL") {
            if !url.is_empty() {
                config.broker_url = url;
            }
        }
        if let Ok(url) = std::env::var("CONSUL_URL") {
            if !url.is_empty() {
                config.discovery_url = Some(url);
            }
        }
        if let Ok(secret) = std::env::var("CLIENT_SECRET") {
            if !secret.is_empty() {
                config.service_token = Some(AuthToken::new(secret));
            }
        }
        config.allow_degraded_ready = env_flag("ALLOW_READY_WITHOUT_RABBITMQ");

        config
    }
}

/// Reads a boolean environment flag (`true`/`1`/`yes`, case-insensitive).
fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.to_ascii_lowercase();
            v == "true" || v == "1" || v == "yes"
        })
        .unwrap_or(false)
}
