//! Readiness state shared between the broker connection manager and the
//! HTTP health endpoints.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Process-wide readiness flags.
#[derive(Debug)]
pub struct Readiness {
    broker_connected: AtomicBool,
    broker_healthy: AtomicBool,
    discovery_registered: AtomicBool,
    allow_degraded_ready: bool,
}

/// Snapshot of the readiness flags for response bodies.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessSnapshot {
    pub ready: bool,
    pub degraded: bool,
    pub broker_connected: bool,
    pub broker_healthy: bool,
    pub discovery_registered: bool,
}

impl Readiness {
    #[must_use]
    pub fn new(allow_degraded_ready: bool) -> Self {
        Self {
            broker_connected: AtomicBool::new(false),
            broker_healthy: AtomicBool::new(false),
            discovery_registered: AtomicBool::new(false),
            allow_degraded_ready,
        }
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::SeqCst);
        if !connected {
            self.broker_healthy.store(false, Ordering::SeqCst);
        }
    }

    pub fn set_broker_healthy(&self, healthy: bool) {
        self.broker_healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_discovery_registered(&self, registered: bool) {
        self.discovery_registered.store(registered, Ordering::SeqCst);
    }

    #[must_use]
    pub fn broker_connected(&self) -> bool {
        self.broker_connected.load(Ordering::SeqCst)
    }

    /// Broker usable: connected and the last active health probe succeeded.
    #[must_use]
    pub fn broker_usable(&self) -> bool {
        self.broker_connected() && self.broker_healthy.load(Ordering::SeqCst)
    }

    /// Ready to serve, honoring the bootstrap degraded override.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.broker_usable() || self.allow_degraded_ready
    }

    /// Whether the ready answer is only true because of the override.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.allow_degraded_ready && !self.broker_usable()
    }

    #[must_use]
    pub fn snapshot(&self) -> ReadinessSnapshot {
        ReadinessSnapshot {
            ready: self.is_ready(),
            degraded: self.is_degraded(),
            broker_connected: self.broker_connected(),
            broker_healthy: self.broker_healthy.load(Ordering::SeqCst),
            discovery_registered: self.discovery_registered.load(Ordering::SeqCst),
        }
    }
}
