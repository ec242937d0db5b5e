//! Shared counter stores.
//!
//! A counter store holds one fixed-window counter per resource key. The
//! increment operation creates the counter with an expiry on the first hit of
//! a window and increments it afterwards, as one atomic step, so that
//! limiter instances sharing a store agree on every count.

mod connect;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::ResourceKey;

pub use self::connect::SharedConnect;
pub use self::memory::MemoryCounterStore;
pub use self::redis_store::RedisCounterStore;

/// Errors surfaced by counter store operations.
///
/// `Clone` so that a single connection outcome can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The session could not be established or has been lost.
    #[error("store connection failed: {0}")]
    Connection(String),
    /// The store was closed during shutdown.
    #[error("store is closed")]
    Closed,
    /// A single command failed.
    #[error("store command failed: {0}")]
    Command(String),
}

impl StoreError {
    /// Whether the error concerns the session rather than a single call.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Closed)
    }
}

/// A counter window as seen right after an operation on the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Requests counted in the current window.
    pub count: u64,
    /// Time left until the window expires.
    pub ttl: Duration,
}

impl WindowState {
    /// Epoch milliseconds at which the window expires, relative to `now_ms`.
    pub fn reset_at_epoch_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_add(self.ttl.as_millis() as i64)
    }
}

/// Trait for shared counter store implementations.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Establish the store session.
    ///
    /// Concurrent callers share a single attempt and all observe its outcome.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Atomically increment the counter for `key`, creating it with an expiry
    /// of `window` if it does not exist.
    async fn increment_and_get_window(
        &self,
        key: &ResourceKey,
        window: Duration,
    ) -> Result<WindowState, StoreError>;

    /// Read the current window for `key` without counting a request.
    async fn current(&self, key: &ResourceKey) -> Result<Option<WindowState>, StoreError>;

    /// Delete the window for `key`.
    async fn reset(&self, key: &ResourceKey) -> Result<(), StoreError>;

    /// Drop any previous connection outcome and connect again.
    async fn reconnect(&self) -> Result<(), StoreError>;

    /// Terminate the session. Later operations fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_at_epoch_ms() {
        let state = WindowState {
            count: 1,
            ttl: Duration::from_millis(750),
        };
        assert_eq!(state.reset_at_epoch_ms(1_000), 1_750);
    }

    #[test]
    fn test_connection_kind() {
        assert!(StoreError::Closed.is_connection());
        assert!(StoreError::Connection("down".into()).is_connection());
        assert!(!StoreError::Command("busy".into()).is_connection());
    }
}
