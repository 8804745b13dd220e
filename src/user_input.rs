//! User-input request waiters.
//!
//! A service can ask the human side of the platform a question: the broker
//! opens a waiter keyed by a fresh request id, broadcasts a
//! `USER_INPUT_REQUEST` frame to every live client, and completes the
//! waiter when any client answers through `POST /submitUserInput`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::message::{Message, MessageType, RECIPIENT_USER};

/// An open question awaiting a user answer.
#[derive(Debug, Clone)]
pub struct PendingUserInput {
    /// Service that asked, if it wants the answer routed back.
    pub sender: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// Registry of open user-input requests.
#[derive(Default)]
pub struct UserInputRegistry {
    pending: DashMap<String, PendingUserInput>,
}

impl UserInputRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a waiter and returns its request id.
    pub fn open(&self, sender: Option<String>) -> String {
        let request_id = Uuid::new_v4().to_string();
        self.pending.insert(
            request_id.clone(),
            PendingUserInput {
                sender,
                opened_at: Utc::now(),
            },
        );
        request_id
    }

    /// Completes a waiter. Returns `None` for an unknown or already answered
    /// request id.
    pub fn complete(&self, request_id: &str) -> Option<PendingUserInput> {
        self.pending.remove(request_id).map(|(_, waiter)| waiter)
    }

    /// Number of currently open requests.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.pending.len()
    }
}

/// The frame broadcast to clients when a user-input request opens.
#[must_use]
pub fn request_frame(request_id: &str, question: Value, answer_type: Option<&str>) -> Message {
    let mut message = Message::new(MessageType::UserInputRequest);
    message.recipient = Some(RECIPIENT_USER.to_string());
    message.content = serde_json::json!({
        "request_id": request_id,
        "question": question,
        "answerType": answer_type,
    });
    message
}

/// The message routed back to the asking service once an answer arrives.
#[must_use]
pub fn response_message(request_id: &str, sender: &str, response: Value) -> Message {
    let mut message = Message::new(MessageType::UserInputResponse);
    message.recipient = Some(sender.to_string());
    message.content = serde_json::json!({
        "request_id": request_id,
        "response": response,
    });
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_complete_is_single_shot() {
        let registry = UserInputRegistry::new();
        let request_id = registry.open(Some("Brain".to_string()));
        assert_eq!(registry.open_count(), 1);

        let waiter = registry.complete(&request_id).unwrap();
        assert_eq!(waiter.sender.as_deref(), Some("Brain"));
        assert!(registry.complete(&request_id).is_none());
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn unknown_request_id_is_a_miss() {
        let registry = UserInputRegistry::new();
        assert!(registry.complete("nope").is_none());
    }

    #[test]
    fn request_frame_targets_all_users() {
        let frame = request_frame("r-1", serde_json::json!("Proceed?"), Some("yesno"));
        assert_eq!(frame.kind, MessageType::UserInputRequest);
        assert_eq!(frame.recipient.as_deref(), Some("user"));
        assert_eq!(frame.content["request_id"], "r-1");
        assert_eq!(frame.content["question"], "Proceed?");
    }
}
