//! Backoff schedules and the polling loop used by cluster operations.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::select;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_retry2::strategy::ExponentialFactorBackoff;
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::strategy::MaxInterval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ClusterResult;
use crate::Error;
use crate::Promise;

/// A schedule of delays between polling attempts.
///
/// The schedule may be infinite.
pub struct Backoff(Box<dyn Iterator<Item = Duration> + Send>);

impl Backoff {
    /// Constructs a backoff from any schedule of delays.
    pub fn new<I>(schedule: I) -> Self
    where
        I: IntoIterator<Item = Duration>,
        I::IntoIter: Send + 'static,
    {
        Self(Box::new(schedule.into_iter()))
    }

    /// Constructs a backoff that waits the same interval forever.
    pub fn fixed(interval: Duration) -> Self {
        Self::new(FixedInterval::new(interval))
    }

    /// Constructs a backoff that starts at `initial` and multiplies the delay
    /// by `factor` after each attempt.
    pub fn exponential(initial: Duration, factor: f64) -> Self {
        Self::new(ExponentialFactorBackoff::from_millis(
            initial.as_millis().try_into().unwrap_or(u64::MAX),
            factor,
        ))
    }

    /// Caps each delay of the schedule at `max`.
    pub fn max_delay(self, max: Duration) -> Self {
        Self::new(self.0.max_duration(max))
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff").finish_non_exhaustive()
    }
}

/// Reports a polling attempt that will be retried.
fn notify_retry(e: &Error, duration: Duration) {
    debug!(
        "{e} (polling again after {duration} ms)",
        duration = duration.as_millis()
    );
}

/// Calls `op` until it succeeds or fails permanently.
///
/// A transient error waits for the next delay of the backoff before calling
/// `op` again; if the backoff is exhausted, the last transient error is
/// returned.
///
/// Cancelling the token interrupts any attempt or wait and returns
/// [`Error::Canceled`].
pub async fn poll<T, F, Fut>(token: &CancellationToken, backoff: Backoff, op: F) -> ClusterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError<Error>>>,
{
    if token.is_cancelled() {
        return Err(Error::Canceled);
    }

    select! {
        biased;

        _ = token.cancelled() => Err(Error::Canceled),
        res = Retry::spawn_notify(backoff, op, notify_retry) => res,
    }
}

/// Runs [`poll`] in the background and returns a promise of its result.
pub fn retry<T, F, Fut>(token: CancellationToken, backoff: Backoff, op: F) -> Promise<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, RetryError<Error>>> + Send,
{
    Promise::spawn(async move { poll(&token, backoff, op).await })
}
