//! Windowgate - Distributed Fixed-Window Rate Limiting
//!
//! This crate gates requests to per-resource identifiers (webhook or endpoint
//! ids) with fixed-window counters kept in a shared store, so that every
//! stateless service instance enforces the same limits. Counting relies on
//! the store's atomic increment-with-expiry; the limiter itself keeps no
//! request state.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::{FailurePolicy, RateLimiterConfig, WindowgateConfig};
pub use error::{Result, WindowgateError};
pub use ratelimit::{Decision, RateLimiter, ResourceKey};
pub use store::{CounterStore, MemoryCounterStore, RedisCounterStore, StoreError, WindowState};
