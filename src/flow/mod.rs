//! Demand-driven publish/subscribe protocol.
//!
//! A [`Publisher`] emits to a [`Subscriber`] only what the subscriber has
//! asked for through its [`Subscription`]. Every subscription receives
//! `on_subscribe` first, then at most the requested number of `on_next`
//! signals, then at most one terminal signal (`on_error` or `on_complete`).
//! Nothing is emitted after a terminal signal or after `cancel`.

mod demand;
mod safe;
mod sink;
mod source;
mod tap;
mod upstream;

pub use safe::SafeSubscriber;
pub use sink::{collect, for_each};
pub use source::{SourcePublisher, SourceStream};
pub use tap::{OnNext, Tap, TapObserver};

pub(crate) use demand::SubscriptionCore;
pub(crate) use upstream::{ForwardingSubscriber, UpstreamSlot};

use crate::error::{BoxError, FlowError};
use crate::map_with_workers::MapWithWorkers;
use crate::pool::ResourcePool;
use crate::worker::Worker;

use std::sync::Arc;

/// Demand large enough to be treated as unbounded.
pub const UNBOUNDED: u64 = u64::MAX;

/// The subscriber's handle for pulling items and stopping the flow.
///
/// Both methods may be called from inside the subscriber's own callbacks.
pub trait Subscription: Send + Sync + 'static {
  /// Asks for `n` more items. Demand accumulates and saturates at [`UNBOUNDED`].
  ///
  /// `n == 0` is a protocol violation: the flow is cancelled and
  /// `FlowError::InvalidDemand` is delivered through `on_error`.
  fn request(&self, n: u64);

  /// Stops the flow. Idempotent; no signal is delivered afterwards.
  fn cancel(&self);
}

pub type SubscriptionRef = Arc<dyn Subscription>;

/// Receives the signals of one subscription.
///
/// Callbacks for a single subscription are never invoked concurrently.
pub trait Subscriber<T>: Send + 'static {
  fn on_subscribe(&mut self, subscription: SubscriptionRef);

  fn on_next(&mut self, item: T) {
    let _ = item;
  }

  fn on_error(&mut self, error: FlowError) {
    let _ = error;
  }

  fn on_complete(&mut self) {}
}

pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

impl<T, S: Subscriber<T> + ?Sized> Subscriber<T> for Box<S> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    (**self).on_subscribe(subscription)
  }

  fn on_next(&mut self, item: T) {
    (**self).on_next(item)
  }

  fn on_error(&mut self, error: FlowError) {
    (**self).on_error(error)
  }

  fn on_complete(&mut self) {
    (**self).on_complete()
  }
}

/// A cold source of items. Each `subscribe` starts an independent traversal.
pub trait Publisher<T: Send + 'static>: Send + Sync + 'static {
  fn subscribe(&self, subscriber: BoxSubscriber<T>);
}

impl<T: Send + 'static, P: Publisher<T> + ?Sized> Publisher<T> for Arc<P> {
  fn subscribe(&self, subscriber: BoxSubscriber<T>) {
    (**self).subscribe(subscriber)
  }
}

/// Operator chaining for any [`Publisher`].
pub trait PublisherExt<T: Send + 'static>: Publisher<T> + Sized {
  /// Observes every signal without changing it. See [`Tap`].
  fn tap<O: TapObserver<T>>(self, observer: O) -> Tap<T> {
    Tap::new(Arc::new(self), Arc::new(observer))
  }

  /// Shorthand for a [`tap`](Self::tap) that only looks at items.
  fn do_on_next<F, E>(self, on_next: F) -> Tap<T>
  where
    F: Fn(&T) -> Result<(), E> + Send + Sync + 'static,
    E: Into<BoxError> + 'static,
  {
    self.tap(OnNext::new(on_next))
  }

  /// Transforms every item on a worker leased from `pool`, keeping upstream order.
  fn map_with_workers<W>(self, pool: Arc<ResourcePool<W>>) -> MapWithWorkers<W>
  where
    W: Worker<Request = T>,
  {
    MapWithWorkers::new(Arc::new(self), pool)
  }

  fn into_shared(self) -> Arc<dyn Publisher<T>> {
    Arc::new(self)
  }
}

impl<T: Send + 'static, P: Publisher<T>> PublisherExt<T> for P {}

/// A signal travelling from a publisher towards a subscriber.
#[derive(Debug)]
pub(crate) enum Signal<T> {
  Next(T),
  Error(FlowError),
  Complete,
}

/// Subscription with nothing behind it, handed out alongside an immediate terminal.
pub(crate) struct InertSubscription;

impl Subscription for InertSubscription {
  fn request(&self, _n: u64) {}

  fn cancel(&self) {}
}

/// Completes the protocol for a subscriber that cannot be served.
pub(crate) fn reject<T: 'static>(subscriber: &mut dyn Subscriber<T>, error: FlowError) {
  subscriber.on_subscribe(Arc::new(InertSubscription));
  subscriber.on_error(error);
}
