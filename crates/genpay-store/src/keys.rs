//! Key encoding utilities for `RocksDB`.
//!
//! Integer identifiers are encoded big-endian so that keys sort numerically.

use chrono::{DateTime, Utc};
use genpay_core::{TaskId, UserId};

/// Create an account key from a user ID.
#[must_use]
pub fn account_key(user_id: UserId) -> Vec<u8> {
    user_id.get().to_be_bytes().to_vec()
}

/// Create a task-scoped key (reservations, charges, jobs).
#[must_use]
pub fn task_key(task_id: &TaskId) -> Vec<u8> {
    task_id.as_str().as_bytes().to_vec()
}

/// Create the prefix shared by all free-usage records of a (user, model) pair.
///
/// Format: `user_id (8 bytes) || model_id || 0x00`
#[must_use]
pub fn free_usage_prefix(user_id: UserId, model_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + model_id.len());
    key.extend_from_slice(&user_id.get().to_be_bytes());
    key.extend_from_slice(model_id.as_bytes());
    key.push(0);
    key
}

/// Create a free-usage record key.
///
/// Format: `prefix || created_at micros (8 bytes) || nonce (16 bytes)`
///
/// The timestamp keeps a pair's records in time order; the nonce keeps two
/// records created in the same microsecond apart.
#[must_use]
pub fn free_usage_key(
    user_id: UserId,
    model_id: &str,
    created_at: DateTime<Utc>,
    nonce: [u8; 16],
) -> Vec<u8> {
    let mut key = free_usage_prefix(user_id, model_id);
    key.extend_from_slice(&created_at.timestamp_micros().to_be_bytes());
    key.extend_from_slice(&nonce);
    key
}

/// Create a processed-event key from an event ID.
#[must_use]
pub fn event_key(event_id: &str) -> Vec<u8> {
    event_id.as_bytes().to_vec()
}
