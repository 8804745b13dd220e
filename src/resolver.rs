//! Recipient resolution.
//!
//! Translates a logical service type or component id into a URL. Lookup
//! order, first hit wins: external discovery (bounded retry), environment
//! variable `<TYPE>_URL`, the local service registry, then the static table
//! of well-known defaults. Resolution never fails loudly; a miss is `None`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::PostOfficeConfig;
use crate::discovery::{DiscoveryClient, ServiceRegistration, port_of_url};
use crate::domain_types::ComponentId;
use crate::registry::ServiceRegistry;

/// Core platform services and their default ports, used as a last resort
/// when neither discovery, environment, nor the registry knows a service.
pub const CORE_SERVICES: &[(&str, u16)] = &[
    ("CapabilitiesManager", 5060),
    ("Brain", 5070),
    ("Librarian", 5040),
    ("MissionControl", 5030),
    ("Engineer", 5050),
];

/// Per-domain assistant surfaces on their conventional ports.
pub const ASSISTANT_SERVICES: &[(&str, u16)] = &[
    ("DashboardAssistant", 3000),
    ("FormsAssistant", 3001),
    ("AnalyticsAssistant", 3002),
    ("ReportsAssistant", 3003),
    ("CalendarAssistant", 3004),
    ("EmailAssistant", 3005),
    ("ChatAssistant", 3006),
    ("SearchAssistant", 3007),
    ("DocumentsAssistant", 3008),
    ("TasksAssistant", 3009),
    ("NotesAssistant", 3010),
    ("ContactsAssistant", 3011),
    ("WorkflowAssistant", 3012),
    ("MediaAssistant", 3013),
    ("CodeAssistant", 3014),
    ("DataAssistant", 3015),
    ("MapsAssistant", 3016),
    ("FeedbackAssistant", 3017),
];

/// Prepends `http://` when the URL carries no scheme.
#[must_use]
pub fn normalize_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

/// Resolves logical recipients to concrete service URLs.
pub struct RecipientResolver {
    registry: Arc<ServiceRegistry>,
    discovery: Arc<DiscoveryClient>,
    discovery_attempts: u32,
    discovery_retry_delay: std::time::Duration,
}

impl RecipientResolver {
    #[must_use]
    pub fn new(
        config: &PostOfficeConfig,
        registry: Arc<ServiceRegistry>,
        discovery: Arc<DiscoveryClient>,
    ) -> Self {
        Self {
            registry,
            discovery,
            discovery_attempts: config.discovery_attempts,
            discovery_retry_delay: config.discovery_retry_delay,
        }
    }

    /// Full resolution ladder with the bounded discovery retry.
    pub async fn resolve(&self, type_or_id: &str) -> Option<String> {
        self.resolve_with_attempts(type_or_id, self.discovery_attempts)
            .await
    }

    /// Single-attempt resolution for hot paths (the fallback sweeper) that
    /// must never wait out the retry ladder.
    pub async fn resolve_quick(&self, type_or_id: &str) -> Option<String> {
        self.resolve_with_attempts(type_or_id, 1).await
    }

    async fn resolve_with_attempts(&self, type_or_id: &str, attempts: u32) -> Option<String> {
        if type_or_id.is_empty() {
            return None;
        }

        if self.discovery.is_configured() {
            for attempt in 1..=attempts {
                if let Some(url) = self.discovery.lookup(type_or_id).await {
                    return Some(normalize_url(&url));
                }
                if attempt < attempts {
                    tokio::time::sleep(self.discovery_retry_delay).await;
                }
            }
        }

        if let Some(url) = env_url(type_or_id) {
            return Some(normalize_url(&url));
        }

        if let Some(url) = self.registry.get_url(type_or_id) {
            return Some(normalize_url(&url));
        }

        well_known_url(type_or_id).inspect(|url| {
            debug!(service = type_or_id, %url, "resolved from well-known defaults");
        })
    }

    /// Registers a component locally and mirrors the registration into the
    /// external discovery registry. External failure never fails the local
    /// registration.
    pub async fn register(&self, id: ComponentId, component_type: String, url: String) {
        let normalized = normalize_url(&url);
        self.registry
            .register(id.clone(), component_type.clone(), normalized.clone());

        if !self.discovery.is_configured() {
            return;
        }
        let registration = ServiceRegistration {
            id: id.to_string(),
            service_name: id.to_string(),
            url: normalized.clone(),
            tags: vec![component_type.to_lowercase()],
            port: port_of_url(&normalized).unwrap_or(80),
        };
        if let Err(reason) = self.discovery.register(&registration).await {
            warn!(component = %id, %reason, "discovery registration failed, keeping local entry");
        }
    }

    /// The well-known service map for `/getServices`: every core service
    /// resolved through the quick ladder.
    pub async fn known_services(&self) -> std::collections::HashMap<String, String> {
        let mut services = std::collections::HashMap::new();
        for (service_type, _) in CORE_SERVICES {
            if let Some(url) = self.resolve_quick(service_type).await {
                services.insert((*service_type).to_string(), url);
            }
        }
        services
    }
}

fn env_url(service_type: &str) -> Option<String> {
    let var = format!("{}_URL", service_type.to_uppercase());
    std::env::var(var).ok().filter(|url| !url.is_empty())
}

fn well_known_url(service_type: &str) -> Option<String> {
    CORE_SERVICES
        .iter()
        .chain(ASSISTANT_SERVICES.iter())
        .find(|(name, _)| *name == service_type)
        .map(|(name, port)| format!("http://{}:{port}", name.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PostOfficeConfig;

    fn resolver_with_registry() -> (RecipientResolver, Arc<ServiceRegistry>) {
        let registry = Arc::new(ServiceRegistry::new());
        let discovery = Arc::new(DiscoveryClient::new(None, reqwest::Client::new()));
        let resolver = RecipientResolver::new(
            &PostOfficeConfig::default(),
            Arc::clone(&registry),
            discovery,
        );
        (resolver, registry)
    }

    #[test]
    fn normalize_adds_scheme_only_when_missing() {
        assert_eq!(normalize_url("librarian:5040"), "http://librarian:5040");
        assert_eq!(normalize_url("http://librarian:5040"), "http://librarian:5040");
        assert_eq!(normalize_url("https://brain:5070"), "https://brain:5070");
    }

    #[tokio::test]
    async fn registry_entries_resolve_before_well_known() {
        let (resolver, registry) = resolver_with_registry();
        registry.register(
            ComponentId::try_new("lib-1".to_string()).unwrap(),
            "Librarian".to_string(),
            "librarian-east:5040".to_string(),
        );
        assert_eq!(
            resolver.resolve_quick("Librarian").await.unwrap(),
            "http://librarian-east:5040"
        );
    }

    #[tokio::test]
    async fn unknown_services_fall_back_to_well_known_table() {
        let (resolver, _) = resolver_with_registry();
        assert_eq!(
            resolver.resolve_quick("Brain").await.unwrap(),
            "http://brain:5070"
        );
        assert_eq!(
            resolver.resolve_quick("DashboardAssistant").await.unwrap(),
            "http://dashboardassistant:3000"
        );
        assert_eq!(resolver.resolve_quick("NoSuchService").await, None);
    }

    #[tokio::test]
    async fn env_override_wins_over_registry() {
        let (resolver, registry) = resolver_with_registry();
        registry.register(
            ComponentId::try_new("eng-1".to_string()).unwrap(),
            "TestOnlyEngineer".to_string(),
            "engineer-local:5050".to_string(),
        );
        // SAFETY: test-only env mutation, var name unique to this test.
        unsafe { std::env::set_var("TESTONLYENGINEER_URL", "engineer-env:5050") };
        let resolved = resolver.resolve_quick("TestOnlyEngineer").await.unwrap();
        unsafe { std::env::remove_var("TESTONLYENGINEER_URL") };
        assert_eq!(resolved, "http://engineer-env:5050");
    }
}
