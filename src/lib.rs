//! # PostOffice - Central Message Broker
//!
//! PostOffice is the single point through which the platform's backend
//! services and its browser clients exchange messages. It accepts inbound
//! messages over HTTP and an AMQP topic exchange, resolves logical
//! recipients to concrete delivery channels, and delivers either to another
//! service (broker first, authenticated HTTP as fallback) or to one or more
//! end users over their live socket connections.
//!
//! ## Core Components
//!
//! - **Router**: classifies every inbound message and dispatches it
//! - **Client Connection Registry**: live sockets, offline queues, and the
//!   client↔mission association driving pause-on-disconnect
//! - **Broker Transport**: topic-exchange publishing plus blocking
//!   request/reply over the direct-reply pseudo-queue
//! - **HTTP Fallback Queue**: per-recipient FIFO drained by a periodic
//!   sweeper while the broker is down
//! - **Recipient Resolver / Service Registry**: discovery, environment,
//!   local registrations, and well-known defaults

// Core modules
pub mod broker;
pub mod clients;
pub mod config;
pub mod discovery;
pub mod domain_types;
pub mod error;
pub mod fallback;
pub mod message;
pub mod mission_index;
pub mod readiness;
pub mod registry;
pub mod resolver;
pub mod rest_api;
pub mod router;
pub mod service_client;
pub mod user_input;
pub mod ws;

// Test doubles shared with the integration suite
pub mod test_support;

// Re-export the types most callers need
pub use crate::broker::{AmqpBroker, BrokerTransport};
pub use crate::clients::ClientRegistry;
pub use crate::config::PostOfficeConfig;
pub use crate::error::{BrokerError, RouterError};
pub use crate::message::{Message, MessageType};
pub use crate::readiness::Readiness;
pub use crate::rest_api::{AppState, create_app};
pub use crate::router::{MessageOrigin, RouteOutcome, Router, classify};
