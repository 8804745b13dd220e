//! In-process service registry.
//!
//! Authoritative store of component registrations with two indexes, `by_id`
//! and `by_type`. Both indexes live behind a single lock so readers always
//! see them consistent: a component is discoverable by both or by neither.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain_types::ComponentId;

/// A registered backend component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    #[serde(rename = "type")]
    pub component_type: String,
    pub url: String,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<ComponentId, Component>,
    /// Insertion-ordered ids per type; first registered wins lookups.
    by_type: HashMap<String, Vec<ComponentId>>,
}

/// Thread-safe component registry.
#[derive(Default)]
pub struct ServiceRegistry {
    indexes: RwLock<Indexes>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a component. Idempotent on `id`: re-registering moves the
    /// component to its new type index if the type changed.
    pub fn register(&self, id: ComponentId, component_type: String, url: String) {
        let mut indexes = self.indexes.write().expect("registry lock poisoned");
        let stale_type = indexes
            .by_id
            .get(&id)
            .filter(|existing| existing.component_type != component_type)
            .map(|existing| existing.component_type.clone());
        if let Some(old_type) = stale_type {
            remove_from_type_index(&mut indexes, &old_type, &id);
        }
        let entry = Component {
            id: id.clone(),
            component_type: component_type.clone(),
            url,
            registered_at: Utc::now(),
        };
        indexes.by_id.insert(id.clone(), entry);
        let ids = indexes.by_type.entry(component_type.clone()).or_default();
        if !ids.contains(&id) {
            ids.push(id.clone());
        }
        debug!(component = %id, %component_type, "component registered");
    }

    /// Removes a component from both indexes. Returns the removed entry.
    pub fn deregister(&self, id: &ComponentId) -> Option<Component> {
        let mut indexes = self.indexes.write().expect("registry lock poisoned");
        let removed = indexes.by_id.remove(id)?;
        let component_type = removed.component_type.clone();
        remove_from_type_index(&mut indexes, &component_type, id);
        debug!(component = %id, "component deregistered");
        Some(removed)
    }

    /// Looks up a component by exact id.
    #[must_use]
    pub fn get_by_id(&self, id: &ComponentId) -> Option<Component> {
        let indexes = self.indexes.read().expect("registry lock poisoned");
        indexes.by_id.get(id).cloned()
    }

    /// Returns all components of a type, in registration order.
    #[must_use]
    pub fn get_by_type(&self, component_type: &str) -> Vec<Component> {
        let indexes = self.indexes.read().expect("registry lock poisoned");
        indexes
            .by_type
            .get(component_type)
            .into_iter()
            .flatten()
            .filter_map(|id| indexes.by_id.get(id).cloned())
            .collect()
    }

    /// Resolves an identifier that may be either a component id or a service
    /// type to a URL. Per-type selection is stable first-registered order.
    #[must_use]
    pub fn get_url(&self, type_or_id: &str) -> Option<String> {
        let indexes = self.indexes.read().expect("registry lock poisoned");
        if let Ok(id) = ComponentId::try_new(type_or_id.to_string()) {
            if let Some(component) = indexes.by_id.get(&id) {
                return Some(component.url.clone());
            }
        }
        indexes
            .by_type
            .get(type_or_id)
            .and_then(|ids| ids.first())
            .and_then(|id| indexes.by_id.get(id))
            .map(|component| component.url.clone())
    }

    /// Component counts grouped by type, for the readiness detail body.
    #[must_use]
    pub fn counts_by_type(&self) -> HashMap<String, usize> {
        let indexes = self.indexes.read().expect("registry lock poisoned");
        indexes
            .by_type
            .iter()
            .map(|(component_type, ids)| (component_type.clone(), ids.len()))
            .collect()
    }
}

fn remove_from_type_index(indexes: &mut Indexes, component_type: &str, id: &ComponentId) {
    if let Some(ids) = indexes.by_type.get_mut(component_type) {
        ids.retain(|existing| existing != id);
        if ids.is_empty() {
            indexes.by_type.remove(component_type);
        }
    }
}
