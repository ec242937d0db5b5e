//! Per-request rate limit decisions and their response metadata.

use serde::Serialize;

use crate::store::WindowState;

/// Body adapters send with a rejected request.
pub const REJECTION_MESSAGE: &str = "Too many requests, please try again later.";

/// HTTP status for a rejected request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// The outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured requests per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends, in epoch milliseconds
    pub reset_at_epoch_ms: i64,
}

impl Decision {
    /// Decide from the counter window observed after counting this request.
    pub fn from_window(limit: u64, window: WindowState, now_ms: i64) -> Self {
        Self {
            allowed: window.count <= limit,
            limit,
            remaining: limit.saturating_sub(window.count),
            reset_at_epoch_ms: window.reset_at_epoch_ms(now_ms),
        }
    }

    /// HTTP status an adapter should answer with: 200 to proceed, 429 to reject.
    pub fn status_code(&self) -> u16 {
        if self.allowed {
            200
        } else {
            STATUS_TOO_MANY_REQUESTS
        }
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn seconds_until_reset(&self, now_ms: i64) -> u64 {
        ceil_seconds(self.reset_at_epoch_ms.saturating_sub(now_ms)).max(0) as u64
    }

    /// Seconds a rejected client should wait, or `None` when allowed.
    pub fn retry_after_secs(&self, now_ms: i64) -> Option<u64> {
        (!self.allowed).then(|| self.seconds_until_reset(now_ms))
    }

    /// Response headers describing the quota.
    ///
    /// Both the `X-RateLimit-*` family (reset as epoch seconds) and the
    /// draft standard `RateLimit-*` family (reset as seconds from now) are
    /// emitted, plus `Retry-After` on rejection.
    pub fn headers(&self, now_ms: i64) -> Vec<(&'static str, String)> {
        let reset_in = self.seconds_until_reset(now_ms);
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            (
                "X-RateLimit-Reset",
                ceil_seconds(self.reset_at_epoch_ms).to_string(),
            ),
            ("RateLimit-Limit", self.limit.to_string()),
            ("RateLimit-Remaining", self.remaining.to_string()),
            ("RateLimit-Reset", reset_in.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", reset_in.to_string()));
        }
        headers
    }
}

fn ceil_seconds(ms: i64) -> i64 {
    ms.div_euclid(1000) + i64::from(ms.rem_euclid(1000) != 0)
}
