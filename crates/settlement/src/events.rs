//! Event emission collaborator.
//!
//! Sinks observe every state transition for external auditability.
//! Emission is best-effort: a sink cannot fail an engine operation.

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{info, warn};
use tranche_types::{EventEnvelope, SettlementEvent};

/// Receives one envelope per observable state transition.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, envelope: EventEnvelope);
}

/// Emits events as structured log records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, envelope: EventEnvelope) {
        match serde_json::to_value(&envelope.event) {
            Ok(payload) => {
                info!(target: "tranche::event", id = %envelope.id, at = %envelope.at, %payload, "event emitted");
            }
            Err(err) => {
                warn!(target: "tranche::event", id = %envelope.id, error = %err, "event serialization failed");
            }
        }
    }
}

/// Captures events in memory, for tests and embedders that audit
/// synchronously.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    envelopes: Mutex<Vec<EventEnvelope>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The events captured so far, in emission order.
    pub fn events(&self) -> Vec<SettlementEvent> {
        self.envelopes
            .lock()
            .map(|guard| guard.iter().map(|e| e.event.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, envelope: EventEnvelope) {
        if let Ok(mut guard) = self.envelopes.lock() {
            guard.push(envelope);
        }
    }
}
