//! Core rate limiter implementation.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::decision::Decision;
use super::key::ResourceKey;
use crate::config::{FailurePolicy, RateLimiterConfig};
use crate::error::{Result, WindowgateError};
use crate::store::{CounterStore, RedisCounterStore, WindowState};

/// Current wall-clock time in epoch milliseconds.
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The fixed-window rate limiter.
///
/// Counting is delegated to a shared [`CounterStore`]; the limiter itself
/// holds only static configuration, so one instance can be shared across
/// tasks behind an `Arc`.
pub struct RateLimiter<S: CounterStore> {
    /// Store holding the counter windows
    store: Arc<S>,
    /// Validated configuration
    config: RateLimiterConfig,
}

impl RateLimiter<RedisCounterStore> {
    /// Create a rate limiter backed by the configured Redis store.
    ///
    /// No connection is made; call [`RateLimiter::connect`] before serving.
    pub fn redis(config: RateLimiterConfig) -> Result<Self> {
        let store = RedisCounterStore::new(&config)?;
        Ok(Self::new(config, Arc::new(store)))
    }
}

impl<S: CounterStore> RateLimiter<S> {
    /// Create a new rate limiter over `store`.
    pub fn new(config: RateLimiterConfig, store: Arc<S>) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Build the key for `id` in this limiter's namespace.
    pub fn key(&self, id: &str) -> Result<ResourceKey> {
        ResourceKey::new(self.config.namespace(), id)
    }

    /// Connect the underlying store.
    pub async fn connect(&self) -> Result<()> {
        self.store.connect().await.map_err(WindowgateError::from)
    }

    /// Discard the current store session and connect again.
    pub async fn reconnect(&self) -> Result<()> {
        self.store.reconnect().await.map_err(WindowgateError::from)
    }

    /// Close the underlying store.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await.map_err(WindowgateError::from)
    }

    /// Count a request for `key` and decide whether it may proceed.
    ///
    /// The request is counted before the limit is evaluated, so rejected
    /// requests also consume the window: the `limit`-th request in a window is
    /// the last one allowed. Store failures are returned unchanged.
    pub async fn check(&self, key: &ResourceKey) -> Result<Decision> {
        trace!(key = %key, "Checking rate limit");

        let window = self
            .store
            .increment_and_get_window(key, self.config.window())
            .await?;
        let decision = Decision::from_window(self.config.limit(), window, now_ms());

        if !decision.allowed {
            debug!(
                key = %key,
                count = window.count,
                limit = self.config.limit(),
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Check the resource `id` in this limiter's namespace.
    pub async fn check_id(&self, id: &str) -> Result<Decision> {
        let key = self.key(id)?;
        self.check(&key).await
    }

    /// Check `key`, answering from the configured failure policy when the
    /// store cannot.
    ///
    /// Lost or closed sessions follow `on_disconnect`; other store errors
    /// follow `on_store_error`.
    pub async fn enforce(&self, key: &ResourceKey) -> Decision {
        match self.check(key).await {
            Ok(decision) => decision,
            Err(err) => {
                let policy = if err.is_connection() {
                    self.config.on_disconnect()
                } else {
                    self.config.on_store_error()
                };
                warn!(
                    key = %key,
                    error = %err,
                    policy = ?policy,
                    "Counter store unavailable, applying failure policy"
                );
                self.degraded_decision(policy, now_ms())
            }
        }
    }

    /// The decision reported when the store could not be consulted.
    pub fn degraded_decision(&self, policy: FailurePolicy, now_ms: i64) -> Decision {
        let limit = self.config.limit();
        let reset_at_epoch_ms = now_ms.saturating_add(self.config.window().as_millis() as i64);
        match policy {
            FailurePolicy::FailClosed => Decision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at_epoch_ms,
            },
            FailurePolicy::FailOpen => Decision {
                allowed: true,
                limit,
                remaining: limit,
                reset_at_epoch_ms,
            },
        }
    }

    /// Read the current window for `key` without counting a request.
    pub async fn peek(&self, key: &ResourceKey) -> Result<Option<WindowState>> {
        Ok(self.store.current(key).await?)
    }

    /// Clear the window for `key`.
    pub async fn reset(&self, key: &ResourceKey) -> Result<()> {
        debug!(key = %key, "Resetting rate limit window");
        Ok(self.store.reset(key).await?)
    }
}
