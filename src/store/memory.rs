//! In-process counter store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{CounterStore, StoreError, WindowState};
use crate::ratelimit::ResourceKey;

/// Expired windows are swept from the map once every this many increments.
const SWEEP_INTERVAL: u64 = 1024;

/// A single counter window.
#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    expires_at: Instant,
}

impl Window {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn state(&self, now: Instant) -> WindowState {
        WindowState {
            count: self.count,
            ttl: self.expires_at.saturating_duration_since(now),
        }
    }
}

/// A counter store kept in process memory.
///
/// Counts are only shared between limiters holding the same instance, which
/// suits single-instance deployments and tests. Each key is updated under its
/// shard lock, so increments for one key are serialized and never lost.
/// An expired window is replaced on its key's next increment, and every
/// [`SWEEP_INTERVAL`] increments the whole map is swept so windows for keys
/// that are never seen again do not accumulate.
pub struct MemoryCounterStore {
    windows: DashMap<String, Window>,
    increments: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    failure: Mutex<Option<StoreError>>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            increments: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Make every following operation fail with `failure`, or succeed again
    /// with `None`.
    #[cfg(test)]
    pub(crate) fn set_failure(&self, failure: Option<StoreError>) {
        *self.failure.lock() = failure;
    }

    /// Whether `connect` has succeeded and `close` has not been called.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Number of windows held, expired or not.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether the store holds no windows.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop expired windows, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        before - self.windows.len()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    async fn increment_and_get_window(
        &self,
        key: &ResourceKey,
        window: Duration,
    ) -> Result<WindowState, StoreError> {
        self.ensure_available()?;

        // Sweep before taking the entry: retain locks every shard
        if (self.increments.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            let removed = self.purge_expired();
            trace!(removed, "Swept expired windows");
        }

        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.as_str().to_string())
            .or_insert_with(|| Window {
                count: 0,
                expires_at: now + window,
            });

        if entry.is_expired(now) {
            trace!(key = %key, "Window expired, starting a new one");
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;

        Ok(entry.state(now))
    }

    async fn current(&self, key: &ResourceKey) -> Result<Option<WindowState>, StoreError> {
        self.ensure_available()?;

        let now = Instant::now();
        Ok(self
            .windows
            .get(key.as_str())
            .filter(|window| !window.is_expired(now))
            .map(|window| window.state(now)))
    }

    async fn reset(&self, key: &ResourceKey) -> Result<(), StoreError> {
        self.ensure_available()?;
        self.windows.remove(key.as_str());
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Memory counter store already closed");
            return Ok(());
        }
        self.connected.store(false, Ordering::SeqCst);
        debug!(windows = self.windows.len(), "Memory counter store closed");
        Ok(())
    }
}
