//! # Event Emitter
//!
//! In-process pub/sub for engine signals, built on `tokio::sync::broadcast`:
//! every subscriber gets a copy of every message.
//!
//! ## Channels
//!
//! - **result**: fires once per successfully handled root event, after its
//!   transaction committed.
//! - **error**: fires once per failed root event, after the failure was
//!   durably marked.
//! - **tx**: transaction lifecycle signals passed through from the write
//!   connection - `Begin`, then `End` (commit) or `Rollback`, then
//!   `Finally` either way.
//!
//! ## Delivery Semantics
//!
//! Sends are non-blocking and best-effort: with no subscribers the message
//! is dropped, and a subscriber that falls more than the channel capacity
//! behind observes `RecvError::Lagged`. Subscribers doing long work should
//! hand it off to their own task.

use tokio::sync::broadcast;

use crate::types::Event;

/// Default capacity of each broadcast channel.
///
/// Signals are small and subscribers are expected to keep up; a lagging
/// subscriber sees `Lagged` rather than blocking the engine.
pub const DEFAULT_EMITTER_CAPACITY: usize = 1024;

// =============================================================================
// Transaction Signals
// =============================================================================

/// Lifecycle signals of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSignal {
    /// `BEGIN IMMEDIATE` succeeded.
    Begin,
    /// The transaction committed.
    End,
    /// The transaction rolled back.
    Rollback,
    /// Emitted after `End` or `Rollback`, always.
    Finally,
}

// =============================================================================
// Emitter
// =============================================================================

/// The engine's signal hub. Cloning shares the underlying channels.
#[derive(Debug, Clone)]
pub struct Emitter {
    result_tx: broadcast::Sender<Event>,
    error_tx: broadcast::Sender<Event>,
    tx_tx: broadcast::Sender<TxSignal>,
}

impl Emitter {
    /// Creates an emitter whose channels buffer `capacity` messages each.
    pub fn new(capacity: usize) -> Self {
        let (result_tx, _) = broadcast::channel(capacity);
        let (error_tx, _) = broadcast::channel(capacity);
        let (tx_tx, _) = broadcast::channel(capacity);
        Self {
            result_tx,
            error_tx,
            tx_tx,
        }
    }

    /// Subscribes to handled root events.
    pub fn subscribe_results(&self) -> broadcast::Receiver<Event> {
        self.result_tx.subscribe()
    }

    /// Subscribes to failed root events.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Event> {
        self.error_tx.subscribe()
    }

    /// Subscribes to transaction lifecycle signals.
    pub fn subscribe_tx(&self) -> broadcast::Receiver<TxSignal> {
        self.tx_tx.subscribe()
    }

    pub(crate) fn result(&self, event: &Event) {
        let _ = self.result_tx.send(event.clone());
    }

    pub(crate) fn error(&self, event: &Event) {
        let _ = self.error_tx.send(event.clone());
    }

    pub(crate) fn tx(&self, signal: TxSignal) {
        let _ = self.tx_tx.send(signal);
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new(DEFAULT_EMITTER_CAPACITY)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Version};
    use serde_json::Value as JsonValue;

    #[tokio::test]
    async fn test_result_channel_delivers_to_all_subscribers() {
        let emitter = Emitter::new(8);
        let mut rx1 = emitter.subscribe_results();
        let mut rx2 = emitter.subscribe_results();

        let event = Event::new(Version::FIRST, "hi", JsonValue::Null, 0);
        emitter.result(&event);

        assert_eq!(rx1.recv().await.unwrap().event_type, "hi");
        assert_eq!(rx2.recv().await.unwrap().event_type, "hi");
    }

    #[tokio::test]
    async fn test_tx_signal_order() {
        let emitter = Emitter::new(8);
        let mut rx = emitter.subscribe_tx();

        emitter.tx(TxSignal::Begin);
        emitter.tx(TxSignal::End);
        emitter.tx(TxSignal::Finally);

        assert_eq!(rx.recv().await.unwrap(), TxSignal::Begin);
        assert_eq!(rx.recv().await.unwrap(), TxSignal::End);
        assert_eq!(rx.recv().await.unwrap(), TxSignal::Finally);
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let emitter = Emitter::new(8);
        emitter.tx(TxSignal::Begin);
        emitter.error(&Event::new(Version::FIRST, "hi", JsonValue::Null, 0));
    }
}
