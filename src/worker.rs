use crate::error::FlowError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// An expensive, stateful executor managed by a [`ResourcePool`](crate::ResourcePool).
///
/// A worker accepts one request at a time and settles it exactly once through
/// the returned [`Outcome`]. How the request reaches the worker (a channel, a
/// process pipe, a socket) is up to the implementation.
pub trait Worker: Send + Sync + 'static {
  type Request: Send + 'static;
  type Response: Send + 'static;

  /// Hands `request` to the worker.
  ///
  /// # Errors
  /// Returns `FlowError::WorkerFault` if the request could not be delivered,
  /// e.g. because the worker has been terminated.
  fn send(&self, request: Self::Request) -> Result<Outcome<Self::Response>, FlowError>;

  /// Forcefully stops the worker. Fire-and-forget and idempotent.
  fn terminate(&self);
}

/// Creates a linked [`Resolver`] / [`Outcome`] pair for one dispatched request.
pub fn outcome<T>() -> (Resolver<T>, Outcome<T>) {
  let (tx, rx) = oneshot::channel();
  (Resolver { tx }, Outcome { rx })
}

/// The settling side of a single request. Consumed by the first settlement,
/// so a request can never be settled twice.
pub struct Resolver<T> {
  tx: oneshot::Sender<Result<T, FlowError>>,
}

impl<T> Resolver<T> {
  pub fn succeed(self, value: T) {
    let _ = self.tx.send(Ok(value));
  }

  pub fn fail(self, reason: impl fmt::Display) {
    let _ = self.tx.send(Err(FlowError::WorkerFault(reason.to_string())));
  }

  /// Returns `true` once the awaiting side has gone away.
  pub fn is_abandoned(&self) -> bool {
    self.tx.is_closed()
  }
}

impl<T> fmt::Debug for Resolver<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Resolver").field("abandoned", &self.is_abandoned()).finish()
  }
}

/// The pending result of a single request.
///
/// Resolves to `FlowError::WorkerFault` if the [`Resolver`] is dropped
/// without being settled.
#[must_use = "an outcome does nothing unless awaited"]
pub struct Outcome<T> {
  rx: oneshot::Receiver<Result<T, FlowError>>,
}

impl<T> Outcome<T> {
  /// An outcome that is already settled with `value`.
  pub fn ready(value: T) -> Self {
    let (resolver, outcome) = outcome();
    resolver.succeed(value);
    outcome
  }
}

impl<T> fmt::Debug for Outcome<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Outcome").finish_non_exhaustive()
  }
}

impl<T> Future for Outcome<T> {
  type Output = Result<T, FlowError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.rx).poll(cx) {
      Poll::Ready(Ok(settled)) => Poll::Ready(settled),
      Poll::Ready(Err(_)) => {
        tracing::warn!("Outcome channel closed before the worker settled the request.");
        Poll::Ready(Err(FlowError::WorkerFault(
          "worker dropped the request without settling it".to_string(),
        )))
      }
      Poll::Pending => Poll::Pending,
    }
  }
}
