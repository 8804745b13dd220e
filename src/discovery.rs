//! Client for the external service-discovery registry.
//!
//! Discovery is strictly best-effort: when no registry is deployed (no base
//! URL configured) every call is a cheap no-op miss, and network failures
//! are logged and swallowed so they can never take down local registration.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Registration payload mirrored into the external registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    pub id: String,
    pub service_name: String,
    pub url: String,
    pub tags: Vec<String>,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    url: Option<String>,
}

/// HTTP client for the discovery registry.
pub struct DiscoveryClient {
    base_url: Option<String>,
    http: reqwest::Client,
}

impl DiscoveryClient {
    #[must_use]
    pub fn new(base_url: Option<String>, http: reqwest::Client) -> Self {
        Self { base_url, http }
    }

    /// Whether a registry is configured at all.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    /// Looks up a service type. A missing registry, a transport error, or an
    /// empty answer are all misses.
    pub async fn lookup(&self, service_type: &str) -> Option<String> {
        let base = self.base_url.as_deref()?;
        let request = self
            .http
            .get(format!("{base}/discoverService"))
            .query(&[("name", service_type)]);
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<LookupResponse>().await {
                    Ok(body) => body.url.filter(|url| !url.is_empty()),
                    Err(err) => {
                        warn!(service_type, %err, "discovery response malformed");
                        None
                    }
                }
            }
            Ok(response) => {
                debug!(service_type, status = %response.status(), "discovery miss");
                None
            }
            Err(err) => {
                debug!(service_type, %err, "discovery unreachable");
                None
            }
        }
    }

    /// Registers a service. Failures are reported to the caller but are
    /// expected to be treated as non-fatal.
    pub async fn register(&self, registration: &ServiceRegistration) -> Result<(), String> {
        let Some(base) = self.base_url.as_deref() else {
            return Err("no discovery registry configured".to_string());
        };
        let response = self
            .http
            .post(format!("{base}/registerService"))
            .json(registration)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if response.status().is_success() {
            debug!(service = registration.service_name, "registered with discovery");
            Ok(())
        } else {
            Err(format!("discovery returned {}", response.status()))
        }
    }
}

/// Parses the port out of a component URL, tolerating a missing scheme.
#[must_use]
pub fn port_of_url(url: &str) -> Option<u16> {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme);
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_parsing_handles_schemes_and_paths() {
        assert_eq!(port_of_url("http://librarian:5040"), Some(5040));
        assert_eq!(port_of_url("librarian:5040"), Some(5040));
        assert_eq!(port_of_url("http://librarian:5040/message"), Some(5040));
        assert_eq!(port_of_url("http://librarian"), None);
    }

    #[tokio::test]
    async fn unconfigured_registry_is_a_miss() {
        let discovery = DiscoveryClient::new(None, reqwest::Client::new());
        assert!(!discovery.is_configured());
        assert_eq!(discovery.lookup("Librarian").await, None);
        assert!(discovery
            .register(&ServiceRegistration {
                id: "x".to_string(),
                service_name: "x".to_string(),
                url: "http://x:1".to_string(),
                tags: vec![],
                port: 1,
            })
            .await
            .is_err());
    }
}
