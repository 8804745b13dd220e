//! Client connection registry.
//!
//! Tracks the live socket handle for every connected client, buffers
//! messages for absent clients in per-client FIFO offline queues, and
//! enforces the at-most-one-socket-per-client invariant by superseding a
//! prior connection when the same client connects again.
//!
//! Lock order: offline queue entry first, then live handle. Both maps are
//! sharded; no lock is ever held across an await point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain_types::{AuthToken, ClientId};
use crate::message::Message;

/// Depth of each client's outbound channel. A full channel means the writer
/// task has fallen behind; further sends demote to the offline queue.
const OUTBOUND_CHANNEL_DEPTH: usize = 256;

/// Outcome of a client-addressed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the live socket's writer.
    Sent,
    /// Deferred to the client's offline queue.
    Queued,
}

struct ClientHandle {
    outbound: mpsc::Sender<Message>,
    token: Option<AuthToken>,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    generation: u64,
}

/// One live client connection, handed to the socket reader/writer tasks.
pub struct Connection {
    pub client_id: ClientId,
    pub outbound: mpsc::Receiver<Message>,
    pub cancel: CancellationToken,
    pub generation: u64,
}

/// Thread-safe registry of live clients and their offline backlogs.
pub struct ClientRegistry {
    live: DashMap<ClientId, ClientHandle>,
    offline: DashMap<ClientId, VecDeque<Message>>,
    offline_cap: usize,
    generation: AtomicU64,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(offline_cap: usize) -> Self {
        Self {
            live: DashMap::new(),
            offline: DashMap::new(),
            offline_cap,
            generation: AtomicU64::new(0),
        }
    }

    /// Registers a new live connection for `client_id`, superseding and
    /// cancelling any previous one. The `CONNECTION_CONFIRMED` control frame
    /// is placed on the fresh outbound channel first, then the client's
    /// offline backlog is drained into it in FIFO order, so the wire order
    /// is always: confirmation, backlog, everything sent after connect.
    pub fn connect(&self, client_id: ClientId, token: Option<AuthToken>) -> Connection {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_DEPTH);
        let cancel = CancellationToken::new();

        let confirm_tx = outbound_tx.clone();
        let handle = ClientHandle {
            outbound: outbound_tx,
            token,
            cancel: cancel.clone(),
            connected_at: Utc::now(),
            generation,
        };

        if let Some(previous) = self.live.insert(client_id.clone(), handle) {
            debug!(client = %client_id, "superseding previous connection");
            previous.cancel.cancel();
        }

        // Fresh channel, cannot be full.
        let _ = confirm_tx.try_send(Message::connection_confirmed(&client_id));
        self.drain_backlog(&client_id);

        Connection {
            client_id,
            outbound: outbound_rx,
            cancel,
            generation,
        }
    }

    /// Returns messages a dying writer could not put on the wire to the
    /// head of the offline queue, preserving their relative order, then
    /// re-drains in case the client already reconnected.
    pub fn requeue_unsent(&self, client_id: &ClientId, unsent: Vec<Message>) {
        if unsent.is_empty() {
            return;
        }
        {
            let mut queue = self.offline.entry(client_id.clone()).or_default();
            for message in unsent.into_iter().rev() {
                // Control frames are connection-scoped; re-sending one on a
                // later connection would be wrong.
                if message.kind == crate::message::MessageType::ConnectionConfirmed {
                    continue;
                }
                queue.push_front(message);
            }
        }
        self.drain_backlog(client_id);
    }

    /// Removes the live entry for `client_id`, but only if it still belongs
    /// to the connection identified by `generation`; a superseded connection
    /// closing late must not evict its successor. Returns whether an entry
    /// was removed.
    pub fn disconnect(&self, client_id: &ClientId, generation: u64) -> bool {
        self.live
            .remove_if(client_id, |_, handle| handle.generation == generation)
            .is_some()
    }

    /// Sends a message to a client, deferring to the offline queue when the
    /// client is absent or its writer has fallen behind. FIFO order is kept:
    /// any backlog is drained ahead of the new message.
    pub fn send_to_client(&self, client_id: &ClientId, message: Message) -> Delivery {
        let delivery = {
            let mut queue = self.offline.entry(client_id.clone()).or_default();
            queue.push_back(message);

            if let Some(handle) = self.live.get(client_id) {
                loop {
                    let Some(front) = queue.pop_front() else {
                        break Delivery::Sent;
                    };
                    match handle.outbound.try_send(front) {
                        Ok(()) => {}
                        Err(
                            mpsc::error::TrySendError::Full(back)
                            | mpsc::error::TrySendError::Closed(back),
                        ) => {
                            queue.push_front(back);
                            warn!(client = %client_id, backlog = queue.len(), "socket send deferred");
                            break Delivery::Queued;
                        }
                    }
                }
            } else {
                while queue.len() > self.offline_cap {
                    queue.pop_front();
                    warn!(client = %client_id, cap = self.offline_cap, "offline queue overflow, oldest evicted");
                }
                Delivery::Queued
            }
        };

        // Both map guards are released above; empty-queue cleanup takes the
        // offline shard alone.
        if delivery == Delivery::Sent {
            self.offline.remove_if(client_id, |_, queue| queue.is_empty());
        }
        delivery
    }

    /// Sends to every live client. Per-socket failures are isolated; returns
    /// `(delivered, failed)` counts.
    pub fn broadcast(&self, message: &Message) -> (usize, usize) {
        let mut delivered = 0;
        let mut failed = 0;
        for entry in self.live.iter() {
            match entry.value().outbound.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    failed += 1;
                    warn!(client = %entry.key(), %err, "broadcast send failed");
                }
            }
        }
        (delivered, failed)
    }

    /// Whether a live socket exists for this client right now.
    #[must_use]
    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.live.contains_key(client_id)
    }

    /// Opaque token presented by the client at upgrade time, if any.
    #[must_use]
    pub fn token_of(&self, client_id: &ClientId) -> Option<AuthToken> {
        self.live
            .get(client_id)
            .and_then(|handle| handle.token.clone())
    }

    /// Instant the client's current connection was admitted.
    #[must_use]
    pub fn connected_at(&self, client_id: &ClientId) -> Option<DateTime<Utc>> {
        self.live.get(client_id).map(|handle| handle.connected_at)
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.live.len()
    }

    /// Depth of a client's offline backlog.
    #[must_use]
    pub fn offline_depth(&self, client_id: &ClientId) -> usize {
        self.offline
            .get(client_id)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    fn drain_backlog(&self, client_id: &ClientId) {
        let Some(mut queue) = self.offline.get_mut(client_id) else {
            return;
        };
        let Some(handle) = self.live.get(client_id) else {
            return;
        };
        while let Some(front) = queue.pop_front() {
            match handle.outbound.try_send(front) {
                Ok(()) => {}
                Err(
                    mpsc::error::TrySendError::Full(back)
                    | mpsc::error::TrySendError::Closed(back),
                ) => {
                    queue.push_front(back);
                    warn!(client = %client_id, backlog = queue.len(), "backlog drain stalled");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn client(s: &str) -> ClientId {
        ClientId::try_new(s.to_string()).unwrap()
    }

    fn text_message(body: &str) -> Message {
        let mut msg = Message::new(MessageType::UserMessage);
        msg.content = serde_json::json!(body);
        msg
    }

    /// Receives the `CONNECTION_CONFIRMED` frame every new connection gets.
    async fn expect_confirmation(conn: &mut Connection) {
        let frame = conn.outbound.recv().await.unwrap();
        assert_eq!(frame.kind, MessageType::ConnectionConfirmed);
    }

    #[tokio::test]
    async fn live_client_receives_directly() {
        let registry = ClientRegistry::new(10);
        let mut conn = registry.connect(client("C1"), None);
        expect_confirmation(&mut conn).await;

        let outcome = registry.send_to_client(&client("C1"), text_message("hi"));
        assert_eq!(outcome, Delivery::Sent);
        assert_eq!(conn.outbound.recv().await.unwrap().content, "hi");
        assert_eq!(registry.offline_depth(&client("C1")), 0);
    }

    #[tokio::test]
    async fn confirmation_carries_canonical_client_id() {
        let registry = ClientRegistry::new(10);
        let mut conn = registry.connect(ClientId::canonicalize("browser-C9").unwrap(), None);
        let frame = conn.outbound.recv().await.unwrap();
        assert_eq!(frame.kind, MessageType::ConnectionConfirmed);
        assert_eq!(frame.client_id.as_deref(), Some("C9"));
    }

    #[tokio::test]
    async fn absent_client_messages_queue_and_drain_fifo() {
        let registry = ClientRegistry::new(10);
        for body in ["M-a", "M-b", "M-c"] {
            assert_eq!(
                registry.send_to_client(&client("C3"), text_message(body)),
                Delivery::Queued
            );
        }
        assert_eq!(registry.offline_depth(&client("C3")), 3);

        let mut conn = registry.connect(client("C3"), None);
        registry.send_to_client(&client("C3"), text_message("post-connect"));

        expect_confirmation(&mut conn).await;
        for expected in ["M-a", "M-b", "M-c", "post-connect"] {
            assert_eq!(conn.outbound.recv().await.unwrap().content, expected);
        }
    }

    #[tokio::test]
    async fn requeue_unsent_preserves_order_ahead_of_backlog() {
        let registry = ClientRegistry::new(10);
        registry.send_to_client(&client("C1"), text_message("later"));
        registry.requeue_unsent(
            &client("C1"),
            vec![text_message("first"), text_message("second")],
        );

        let mut conn = registry.connect(client("C1"), None);
        expect_confirmation(&mut conn).await;
        for expected in ["first", "second", "later"] {
            assert_eq!(conn.outbound.recv().await.unwrap().content, expected);
        }
    }

    #[tokio::test]
    async fn new_connection_supersedes_previous() {
        let registry = ClientRegistry::new(10);
        let first = registry.connect(client("C1"), None);
        let second = registry.connect(client("C1"), None);

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());

        // The superseded connection's late close must not evict the new one.
        assert!(!registry.disconnect(&client("C1"), first.generation));
        assert!(registry.is_connected(&client("C1")));
        assert!(registry.disconnect(&client("C1"), second.generation));
        assert!(!registry.is_connected(&client("C1")));
    }

    #[tokio::test]
    async fn browser_prefixed_and_plain_ids_are_one_client() {
        let registry = ClientRegistry::new(10);
        let first = registry.connect(ClientId::canonicalize("browser-foo").unwrap(), None);
        let second = registry.connect(ClientId::canonicalize("foo").unwrap(), None);

        assert!(first.cancel.is_cancelled());
        assert_eq!(registry.connected_count(), 1);
        drop(second);
    }

    #[tokio::test]
    async fn offline_overflow_evicts_oldest() {
        let registry = ClientRegistry::new(2);
        for body in ["one", "two", "three"] {
            registry.send_to_client(&client("C1"), text_message(body));
        }
        assert_eq!(registry.offline_depth(&client("C1")), 2);

        let mut conn = registry.connect(client("C1"), None);
        expect_confirmation(&mut conn).await;
        assert_eq!(conn.outbound.recv().await.unwrap().content, "two");
        assert_eq!(conn.outbound.recv().await.unwrap().content, "three");
    }

    #[tokio::test]
    async fn broadcast_counts_live_sockets() {
        let registry = ClientRegistry::new(10);
        let mut a = registry.connect(client("A"), None);
        let mut b = registry.connect(client("B"), None);
        expect_confirmation(&mut a).await;
        expect_confirmation(&mut b).await;

        let (delivered, failed) = registry.broadcast(&text_message("all"));
        assert_eq!((delivered, failed), (2, 0));
        assert_eq!(a.outbound.recv().await.unwrap().content, "all");
        assert_eq!(b.outbound.recv().await.unwrap().content, "all");
    }

    #[tokio::test]
    async fn token_is_stored_opaque() {
        let registry = ClientRegistry::new(10);
        let _conn = registry.connect(client("C1"), Some(AuthToken::new("tok".to_string())));
        assert_eq!(
            registry.token_of(&client("C1")).unwrap().as_str(),
            "tok"
        );
    }
}
