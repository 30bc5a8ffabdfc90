//! Single-assignment promise and the future observing it.
//!
//! Commit results, local flushes and snapshot builds are produced in one
//! place and awaited in another. A [`Promise`] is fulfilled at most once; if
//! it is dropped unfulfilled (for instance because its epoch was torn down)
//! the matching [`PromiseFuture`] resolves with an `InvalidState` error
//! instead of hanging.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::HydraError;

/// Create a connected promise/future pair.
pub fn promise<T>() -> (Promise<T>, PromiseFuture<T>) {
    let (sender, receiver) = oneshot::channel();
    (Promise { sender }, PromiseFuture { receiver })
}

/// Producer side of a promise.
#[derive(Debug)]
pub struct Promise<T> {
    sender: oneshot::Sender<Result<T, HydraError>>,
}

impl<T> Promise<T> {
    /// Fulfill the promise. Ignored if nobody is waiting anymore.
    pub fn set(self, result: Result<T, HydraError>) {
        let _ = self.sender.send(result);
    }

    /// Fulfill with a value.
    pub fn set_value(self, value: T) {
        self.set(Ok(value));
    }

    /// Fulfill with an error.
    pub fn set_error(self, error: HydraError) {
        self.set(Err(error));
    }

    /// Whether the waiting side has gone away.
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consumer side of a promise.
#[derive(Debug)]
pub struct PromiseFuture<T> {
    receiver: oneshot::Receiver<Result<T, HydraError>>,
}

impl<T> PromiseFuture<T> {
    /// A future that is already resolved.
    pub fn ready(result: Result<T, HydraError>) -> Self {
        let (promise, future) = promise();
        promise.set(result);
        future
    }
}

impl<T> Future for PromiseFuture<T> {
    type Output = Result<T, HydraError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(HydraError::invalid_state("promise abandoned")))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
