//! Client ↔ mission association index.
//!
//! Two paired maps behind one lock: `client → mission` (a client belongs to
//! at most one mission) and `mission → clients`. Every entry in one map has
//! its mirror in the other; the mission key is dropped when its set empties.
//!
//! Associations survive client disconnects so a reconnecting client resumes
//! into the same mission.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::domain_types::{ClientId, MissionId};

#[derive(Default)]
struct Paired {
    client_missions: HashMap<ClientId, MissionId>,
    mission_clients: HashMap<MissionId, HashSet<ClientId>>,
}

/// Thread-safe two-way mission index.
#[derive(Default)]
pub struct MissionIndex {
    paired: Mutex<Paired>,
}

impl MissionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates a client with a mission, replacing any prior association.
    pub fn associate(&self, client_id: ClientId, mission_id: MissionId) {
        let mut paired = self.paired.lock().expect("mission index lock poisoned");
        if let Some(previous) = paired
            .client_missions
            .insert(client_id.clone(), mission_id.clone())
        {
            if previous != mission_id {
                remove_member(&mut paired.mission_clients, &previous, &client_id);
            }
        }
        paired
            .mission_clients
            .entry(mission_id)
            .or_default()
            .insert(client_id);
    }

    /// Drops a client's association entirely. Returns the mission it had.
    pub fn dissociate(&self, client_id: &ClientId) -> Option<MissionId> {
        let mut paired = self.paired.lock().expect("mission index lock poisoned");
        let mission_id = paired.client_missions.remove(client_id)?;
        remove_member(&mut paired.mission_clients, &mission_id, client_id);
        Some(mission_id)
    }

    /// The mission a client currently belongs to.
    #[must_use]
    pub fn mission_of(&self, client_id: &ClientId) -> Option<MissionId> {
        let paired = self.paired.lock().expect("mission index lock poisoned");
        paired.client_missions.get(client_id).cloned()
    }

    /// All clients of a mission.
    #[must_use]
    pub fn clients_of(&self, mission_id: &MissionId) -> Vec<ClientId> {
        let paired = self.paired.lock().expect("mission index lock poisoned");
        paired
            .mission_clients
            .get(mission_id)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Re-asserts the reverse index for a client's existing association.
    /// Used on (re)connect; a no-op for clients with no mission.
    pub fn refresh(&self, client_id: &ClientId) {
        let mut paired = self.paired.lock().expect("mission index lock poisoned");
        if let Some(mission_id) = paired.client_missions.get(client_id).cloned() {
            paired
                .mission_clients
                .entry(mission_id)
                .or_default()
                .insert(client_id.clone());
        }
    }

    /// Checks the paired-map invariant; every entry mirrored both ways.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let paired = self.paired.lock().expect("mission index lock poisoned");
        let forward_ok = paired.client_missions.iter().all(|(client, mission)| {
            paired
                .mission_clients
                .get(mission)
                .is_some_and(|clients| clients.contains(client))
        });
        let reverse_ok = paired.mission_clients.iter().all(|(mission, clients)| {
            !clients.is_empty()
                && clients.iter().all(|client| {
                    paired.client_missions.get(client) == Some(mission)
                })
        });
        forward_ok && reverse_ok
    }
}

fn remove_member(
    mission_clients: &mut HashMap<MissionId, HashSet<ClientId>>,
    mission_id: &MissionId,
    client_id: &ClientId,
) {
    if let Some(clients) = mission_clients.get_mut(mission_id) {
        clients.remove(client_id);
        if clients.is_empty() {
            mission_clients.remove(mission_id);
        }
    }
}
