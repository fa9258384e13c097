use super::{BoxSubscriber, Publisher, SafeSubscriber, Subscriber, SubscriptionRef};
use crate::error::{BoxError, FlowError};

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::warn;

/// Side effects attached to a flow by [`Tap`].
///
/// A callback returning `Err` fails the flow: upstream is cancelled and
/// downstream receives `FlowError::ProtocolFault` in place of the signal.
pub trait TapObserver<T>: Send + Sync + 'static {
  fn on_next(&self, item: &T) -> Result<(), BoxError> {
    let _ = item;
    Ok(())
  }

  fn on_error(&self, error: &FlowError) -> Result<(), BoxError> {
    let _ = error;
    Ok(())
  }

  fn on_complete(&self) -> Result<(), BoxError> {
    Ok(())
  }
}

/// A [`TapObserver`] built from a closure that looks at items only.
pub struct OnNext<F, E> {
  on_next: F,
  _error: PhantomData<fn() -> E>,
}

impl<F, E> OnNext<F, E> {
  pub fn new(on_next: F) -> Self {
    Self {
      on_next,
      _error: PhantomData,
    }
  }
}

impl<T, F, E> TapObserver<T> for OnNext<F, E>
where
  F: Fn(&T) -> Result<(), E> + Send + Sync + 'static,
  E: Into<BoxError> + 'static,
{
  fn on_next(&self, item: &T) -> Result<(), BoxError> {
    (self.on_next)(item).map_err(Into::into)
  }
}

/// Pass-through operator that runs a [`TapObserver`] for every signal before
/// forwarding it unchanged. Demand and cancellation go straight upstream.
pub struct Tap<T: Send + 'static> {
  upstream: Arc<dyn Publisher<T>>,
  observer: Arc<dyn TapObserver<T>>,
}

impl<T: Send + 'static> fmt::Debug for Tap<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Tap").finish_non_exhaustive()
  }
}

impl<T: Send + 'static> Tap<T> {
  pub fn new(upstream: Arc<dyn Publisher<T>>, observer: Arc<dyn TapObserver<T>>) -> Self {
    Self { upstream, observer }
  }
}

impl<T: Send + 'static> Publisher<T> for Tap<T> {
  fn subscribe(&self, subscriber: BoxSubscriber<T>) {
    self.upstream.subscribe(Box::new(TapSubscriber {
      observer: self.observer.clone(),
      downstream: SafeSubscriber::new(subscriber),
      upstream: None,
      terminated: false,
    }));
  }
}

struct TapSubscriber<T: Send + 'static> {
  observer: Arc<dyn TapObserver<T>>,
  downstream: SafeSubscriber<T>,
  upstream: Option<SubscriptionRef>,
  terminated: bool,
}

impl<T: Send + 'static> TapSubscriber<T> {
  fn fail(&mut self, signal: &str, callback_error: BoxError) {
    warn!("Tap {} callback failed: {}", signal, callback_error);
    self.terminated = true;
    if let Some(upstream) = self.upstream.take() {
      upstream.cancel();
    }
    self
      .downstream
      .on_error(FlowError::ProtocolFault(format!("tap {signal} callback failed: {callback_error}")));
  }
}

impl<T: Send + 'static> Subscriber<T> for TapSubscriber<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, item: T) {
    if self.terminated {
      return;
    }
    match self.observer.on_next(&item) {
      Ok(()) => self.downstream.on_next(item),
      Err(callback_error) => self.fail("on_next", callback_error),
    }
  }

  fn on_error(&mut self, error: FlowError) {
    if self.terminated {
      return;
    }
    self.terminated = true;
    match self.observer.on_error(&error) {
      Ok(()) => self.downstream.on_error(error),
      Err(callback_error) => self.fail("on_error", callback_error),
    }
  }

  fn on_complete(&mut self) {
    if self.terminated {
      return;
    }
    self.terminated = true;
    match self.observer.on_complete() {
      Ok(()) => self.downstream.on_complete(),
      Err(callback_error) => self.fail("on_complete", callback_error),
    }
  }
}
