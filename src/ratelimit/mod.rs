//! Rate limiting logic.

mod decision;
mod key;
mod limiter;

pub use decision::{Decision, REJECTION_MESSAGE, STATUS_TOO_MANY_REQUESTS};
pub use key::ResourceKey;
pub(crate) use key::validate_namespace;
pub use limiter::RateLimiter;
