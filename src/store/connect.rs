//! Single-flight connection establishment.

use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use super::StoreError;

type Connector<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, StoreError>> + Send + Sync>;
type Attempt<T> = Shared<BoxFuture<'static, Result<T, StoreError>>>;

/// A connection slot that runs at most one connection attempt at a time.
///
/// The first caller of [`SharedConnect::get`] starts the attempt; every caller
/// arriving while it is in flight, or after it has resolved, awaits the same
/// shared future and observes the same outcome. A failed outcome stays in the
/// slot until [`SharedConnect::reset`] is called.
pub struct SharedConnect<T> {
    connector: Connector<T>,
    attempt: Mutex<Option<Attempt<T>>>,
}

impl<T> SharedConnect<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a slot that connects with `connector` on first use.
    pub fn new<F, Fut>(connector: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        Self {
            connector: Box::new(move || connector().boxed()),
            attempt: Mutex::new(None),
        }
    }

    /// Get the connection, starting or joining the shared attempt.
    pub async fn get(&self) -> Result<T, StoreError> {
        let attempt = {
            let mut slot = self.attempt.lock();
            slot.get_or_insert_with(|| {
                debug!("Starting connection attempt");
                (self.connector)().shared()
            })
            .clone()
        };
        attempt.await
    }

    /// The resolved outcome, if an attempt has finished.
    pub fn outcome(&self) -> Option<Result<T, StoreError>> {
        self.attempt
            .lock()
            .as_ref()
            .and_then(|attempt| attempt.peek().cloned())
    }

    /// Forget the current attempt so the next `get` connects again.
    ///
    /// Returns the connection if the discarded attempt had succeeded.
    pub fn reset(&self) -> Option<T> {
        let previous = self.attempt.lock().take()?;
        previous.peek().cloned().and_then(|outcome| outcome.ok())
    }

    /// Empty the slot, waiting for an attempt still in flight to resolve.
    ///
    /// Returns `None` if no attempt was ever started, otherwise its outcome.
    /// Callers already waiting on the attempt still receive the same outcome.
    pub async fn take(&self) -> Option<Result<T, StoreError>> {
        let attempt = self.attempt.lock().take()?;
        Some(attempt.await)
    }
}
