//! Error types for the broker, one enum per failure domain.
//!
//! The router never crashes the process on a per-message error: handlers
//! pattern-match these variants and follow the catch-log-continue policy.

use thiserror::Error;

/// Errors surfaced by the routing core.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("recipient could not be resolved: {recipient}")]
    ResolutionMiss { recipient: String },

    #[error("message dropped: {reason}")]
    Unroutable { reason: String },

    #[error("broker RPC timed out after {timeout_ms}ms")]
    RpcTimeout { timeout_ms: u64 },

    #[error("broker transport error: {0}")]
    Broker(#[from] BrokerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the broker transport.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(#[source] lapin::Error),

    #[error("reply channel closed before a response arrived")]
    ReplyChannelClosed,

    #[error("no reply within {timeout_ms}ms")]
    ReplyTimeout { timeout_ms: u64 },

    #[error("AMQP protocol error: {0}")]
    Protocol(#[from] lapin::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the downstream HTTP path.
#[derive(Debug, Error)]
pub enum HttpDeliveryError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
}
