//! Test doubles for the broker transport.
//!
//! Mirrors the storage-layer approach of keeping mock trait implementations
//! next to the code so both unit tests and the integration suite can wire a
//! router without a running AMQP broker.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::broker::BrokerTransport;
use crate::error::BrokerError;
use crate::message::{Message, MessageType};

/// Scripted reply for [`MockBroker::request`].
type Responder = Box<dyn Fn(&Message) -> Result<Message, BrokerError> + Send + Sync>;

/// In-memory [`BrokerTransport`] that records publishes and answers RPCs
/// with a scripted responder (default: echo a `RESPONSE`).
pub struct MockBroker {
    connected: AtomicBool,
    published: Mutex<Vec<(String, Message)>>,
    responder: Mutex<Option<Responder>>,
}

impl MockBroker {
    /// A broker double in the given connection state.
    #[must_use]
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            published: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        }
    }

    /// Flips the simulated connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Scripts the RPC reply.
    pub fn respond_with(
        &self,
        responder: impl Fn(&Message) -> Result<Message, BrokerError> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Everything published so far as `(routing_key, message)` pairs.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Message)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerTransport for MockBroker {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, routing_key: &str, message: &Message) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.published
            .lock()
            .unwrap()
            .push((routing_key.to_string(), message.clone()));
        Ok(())
    }

    async fn request(&self, routing_key: &str, mut message: Message) -> Result<Message, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        // Mirror the AMQP transport: stamp a fresh correlation id and the
        // direct-reply queue before the message hits the wire.
        message.correlation_id = Some(crate::domain_types::CorrelationId::generate().to_string());
        message.reply_to = Some("amq.rabbitmq.reply-to".to_string());
        self.published
            .lock()
            .unwrap()
            .push((routing_key.to_string(), message.clone()));
        if let Some(responder) = self.responder.lock().unwrap().as_ref() {
            return responder(&message);
        }
        let mut reply = Message::new(MessageType::Response);
        reply.correlation_id = message.correlation_id;
        reply.content = serde_json::json!({ "echo": true });
        Ok(reply)
    }

    fn complete_reply(&self, _correlation_id: &str, _message: Message) -> bool {
        false
    }
}
