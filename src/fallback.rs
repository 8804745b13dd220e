//! HTTP fallback queue and sweeper.
//!
//! When the broker is unreachable, service-bound messages land in a
//! per-recipient FIFO here. A periodic sweeper POSTs one message per
//! recipient per tick to that recipient's `/message` endpoint; a failed
//! POST reinserts the message at the head of its queue. One-per-tick is the
//! rate limit: a backlog drains over as many ticks, in order, with
//! backpressure via head-insertion.
//!
//! The queue lock is held only to pop or reinsert, never across an
//! outbound request.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::clients::ClientRegistry;
use crate::domain_types::AuthToken;
use crate::message::{Message, RECIPIENT_USER};
use crate::mission_index::MissionIndex;
use crate::readiness::Readiness;
use crate::resolver::RecipientResolver;
use crate::service_client::ServiceClient;

/// A deferred message plus the pass-through token it arrived with, if any.
#[derive(Debug, Clone)]
pub struct FallbackEntry {
    pub message: Message,
    pub token: Option<AuthToken>,
}

/// Per-recipient FIFO of messages awaiting HTTP delivery.
#[derive(Default)]
pub struct FallbackQueues {
    queues: DashMap<String, VecDeque<FallbackEntry>>,
}

impl FallbackQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, recipient: &str, entry: FallbackEntry) {
        self.queues
            .entry(recipient.to_string())
            .or_default()
            .push_back(entry);
    }

    fn reinsert_front(&self, recipient: &str, entry: FallbackEntry) {
        self.queues
            .entry(recipient.to_string())
            .or_default()
            .push_front(entry);
    }

    fn pop_front(&self, recipient: &str) -> Option<FallbackEntry> {
        self.queues.get_mut(recipient)?.pop_front()
    }

    fn recipients(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Depth of one recipient's queue.
    #[must_use]
    pub fn depth(&self, recipient: &str) -> usize {
        self.queues
            .get(recipient)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Total messages across all queues.
    #[must_use]
    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }
}

/// Periodic drain task for the fallback queues.
pub struct Sweeper {
    queues: Arc<FallbackQueues>,
    readiness: Arc<Readiness>,
    resolver: Arc<RecipientResolver>,
    http: ServiceClient,
    clients: Arc<ClientRegistry>,
    missions: Arc<MissionIndex>,
    interval: Duration,
}

impl Sweeper {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: Arc<FallbackQueues>,
        readiness: Arc<Readiness>,
        resolver: Arc<RecipientResolver>,
        http: ServiceClient,
        clients: Arc<ClientRegistry>,
        missions: Arc<MissionIndex>,
        interval: Duration,
    ) -> Self {
        Self {
            queues,
            readiness,
            resolver,
            http,
            clients,
            missions,
            interval,
        }
    }

    /// Runs forever; errors are contained per tick.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// One sweep pass. While the broker is up the queues drain lazily (the
    /// broker path is preferred), so this only reports their depth.
    pub async fn sweep_once(&self) {
        if self.readiness.broker_connected() {
            let depth = self.queues.total_depth();
            if depth > 0 {
                info!(depth, "fallback queue idle while broker is up");
            }
            return;
        }

        for recipient in self.queues.recipients() {
            if recipient == RECIPIENT_USER {
                self.drain_user_queue(&recipient);
            } else {
                self.drain_service_queue(&recipient).await;
            }
        }
    }

    /// User-bound entries never need HTTP: fan out to mission clients when a
    /// mission is addressed, otherwise broadcast.
    fn drain_user_queue(&self, recipient: &str) {
        while let Some(entry) = self.queues.pop_front(recipient) {
            match entry.message.addressed_mission() {
                Some(mission_id) => {
                    for client_id in self.missions.clients_of(&mission_id) {
                        self.clients
                            .send_to_client(&client_id, entry.message.clone());
                    }
                }
                None => {
                    self.clients.broadcast(&entry.message);
                }
            }
        }
    }

    /// Attempts exactly one delivery for this recipient this tick.
    async fn drain_service_queue(&self, recipient: &str) {
        let Some(url) = self.resolver.resolve_quick(recipient).await else {
            debug!(recipient, "fallback recipient unresolved, skipping");
            return;
        };

        let Some(entry) = self.queues.pop_front(recipient) else {
            return;
        };
        match self
            .http
            .post_message_checked(&url, &entry.message, entry.token.as_ref())
            .await
        {
            Ok(()) => debug!(recipient, "fallback delivery succeeded"),
            Err(err) => {
                warn!(recipient, %err, "fallback delivery failed, will retry");
                self.queues.reinsert_front(recipient, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn entry(body: &str) -> FallbackEntry {
        let mut message = Message::new(MessageType::Request);
        message.content = serde_json::json!(body);
        FallbackEntry {
            message,
            token: None,
        }
    }

    #[test]
    fn queues_are_fifo_per_recipient() {
        let queues = FallbackQueues::new();
        queues.enqueue("Librarian", entry("first"));
        queues.enqueue("Librarian", entry("second"));
        queues.enqueue("Brain", entry("other"));

        assert_eq!(queues.depth("Librarian"), 2);
        assert_eq!(queues.pop_front("Librarian").unwrap().message.content, "first");
        assert_eq!(queues.pop_front("Librarian").unwrap().message.content, "second");
        assert_eq!(queues.pop_front("Brain").unwrap().message.content, "other");
        assert_eq!(queues.total_depth(), 0);
    }

    #[test]
    fn reinsert_front_preserves_order() {
        let queues = FallbackQueues::new();
        queues.enqueue("Librarian", entry("first"));
        queues.enqueue("Librarian", entry("second"));

        let popped = queues.pop_front("Librarian").unwrap();
        queues.reinsert_front("Librarian", popped);

        assert_eq!(queues.pop_front("Librarian").unwrap().message.content, "first");
        assert_eq!(queues.pop_front("Librarian").unwrap().message.content, "second");
    }
}
