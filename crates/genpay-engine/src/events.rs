//! Dedupe of inbound updates and callbacks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use genpay_store::{Batch, Mutation, Store};

use crate::error::Result;
use crate::jobs::to_chrono;
use crate::locks::KeyedLocks;

/// Remembers which event ids were handled.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn Store>,
    locks: Arc<KeyedLocks<String>>,
    ttl: Duration,
}

impl EventLog {
    /// Create an event log over a store. Entries are forgotten after `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            locks: Arc::new(KeyedLocks::new()),
            ttl,
        }
    }

    /// Claim an event. Returns `true` for exactly one caller per id.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read or write fails.
    pub async fn mark_event_processed(&self, event_id: &str) -> Result<bool> {
        let key = event_id.to_string();
        let _guard = self.locks.lock(&key).await;

        if self.store.has_processed_event(event_id).await? {
            tracing::debug!(event_id = %event_id, "Duplicate event skipped");
            return Ok(false);
        }

        let now = Utc::now();
        self.store
            .apply(
                Batch::new()
                    .with(Mutation::PutProcessedEvent {
                        event_id: key,
                        processed_at: now,
                    })
                    .with(Mutation::PruneProcessedEvents {
                        processed_before: now - to_chrono(self.ttl),
                    }),
            )
            .await?;
        Ok(true)
    }

    /// Drop idle lock entries. Returns how many were removed.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }
}
