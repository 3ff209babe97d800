//! A single-value asynchronous result.

use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use tokio::sync::oneshot;

use crate::ClusterResult;
use crate::Error;

/// The eventual result of a background cluster operation.
///
/// The operation runs whether or not the promise is awaited; awaiting it
/// yields the operation's result exactly once.
///
/// If the operation's task ends without producing a result (for example, it
/// panicked), the promise resolves to [`Error::Abandoned`].
#[must_use = "the result of the operation is only observable by awaiting the promise"]
#[derive(Debug)]
pub struct Promise<T> {
    /// The receiving end of the result channel.
    rx: oneshot::Receiver<ClusterResult<T>>,
}

impl<T: Send + 'static> Promise<T> {
    /// Runs the given future as a task and returns a promise of its output.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = ClusterResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            // The receiver may have been dropped; the result is discarded then
            let _ = tx.send(fut.await);
        });

        Self { rx }
    }
}

impl<T> Promise<T> {
    /// Constructs a promise that is already resolved with the given result.
    pub fn resolved(result: ClusterResult<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Constructs a promise that is already resolved with a value.
    pub fn ready(value: T) -> Self {
        Self::resolved(Ok(value))
    }

    /// Constructs a promise that is already resolved with an error.
    pub fn failed(e: Error) -> Self {
        Self::resolved(Err(e))
    }
}

impl<T> Future for Promise<T> {
    type Output = ClusterResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::Abandoned)))
    }
}
