use super::{reject, BoxSubscriber, Publisher, SafeSubscriber, Subscriber, Subscription, SubscriptionCore, SubscriptionRef};
use crate::error::{panic_message, FlowError};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::{debug, error, info_span, trace, Instrument};

/// The sequence walked by one subscription to a [`SourcePublisher`].
pub type SourceStream<T> = BoxStream<'static, Result<T, FlowError>>;

type StreamFactory<T> = Arc<dyn Fn() -> SourceStream<T> + Send + Sync + 'static>;

/// A cold publisher over a finite sequence.
///
/// Every subscription calls the factory for a fresh stream and pulls from it
/// only as far as downstream demand allows. It looks at most one item ahead,
/// so exhaustion and failure are signalled without waiting for demand. The
/// stream is dropped (its teardown) as soon as the subscription completes,
/// fails or is cancelled.
///
/// Subscribing spawns a driver task, so it must happen inside a Tokio runtime.
pub struct SourcePublisher<T> {
  factory: StreamFactory<T>,
}

impl<T> fmt::Debug for SourcePublisher<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SourcePublisher").finish_non_exhaustive()
  }
}

impl<T> Clone for SourcePublisher<T> {
  fn clone(&self) -> Self {
    Self {
      factory: self.factory.clone(),
    }
  }
}

impl<T: Send + 'static> SourcePublisher<T> {
  /// Emits the items of `items`, re-iterated from the start for every subscription.
  pub fn from_iter<I>(items: I) -> Self
  where
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
  {
    Self::from_factory(move || stream::iter(items.clone()).map(Ok).boxed())
  }

  /// Emits whatever a fresh stream from `factory` yields.
  pub fn from_stream<F, S>(factory: F) -> Self
  where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = T> + Send + 'static,
  {
    Self::from_factory(move || factory().map(Ok).boxed())
  }

  /// Like [`from_stream`](Self::from_stream), but an `Err` item ends the flow
  /// with `FlowError::SourceFault`.
  pub fn from_try_stream<F, S, E>(factory: F) -> Self
  where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = Result<T, E>> + Send + 'static,
    E: fmt::Display,
  {
    Self::from_factory(move || {
      factory()
        .map(|item| item.map_err(|source_error| FlowError::SourceFault(source_error.to_string())))
        .boxed()
    })
  }

  pub fn from_factory<F>(factory: F) -> Self
  where
    F: Fn() -> SourceStream<T> + Send + Sync + 'static,
  {
    Self {
      factory: Arc::new(factory),
    }
  }
}

impl<T: Send + 'static> Publisher<T> for SourcePublisher<T> {
  fn subscribe(&self, subscriber: BoxSubscriber<T>) {
    let mut downstream = SafeSubscriber::new(subscriber);

    let stream = match catch_unwind(AssertUnwindSafe(|| (self.factory)())) {
      Ok(stream) => stream,
      Err(panic_payload) => {
        let message = panic_message(&*panic_payload);
        error!("Source factory panicked: {}", message);
        reject(&mut downstream, FlowError::SourceFault(format!("source factory panicked: {message}")));
        return;
      }
    };

    let core = Arc::new(SubscriptionCore::new());
    let subscription_id = core.id();
    let subscription: SubscriptionRef = Arc::new(SourceSubscription { core: core.clone() });
    tokio::spawn(
      drive_source(core, downstream, subscription, stream).instrument(info_span!("source", subscription_id)),
    );
  }
}

struct SourceSubscription {
  core: Arc<SubscriptionCore>,
}

impl Subscription for SourceSubscription {
  fn request(&self, n: u64) {
    self.core.request(n);
  }

  fn cancel(&self) {
    self.core.cancel();
  }
}

async fn drive_source<T: Send + 'static>(
  core: Arc<SubscriptionCore>,
  mut downstream: SafeSubscriber<T>,
  subscription: SubscriptionRef,
  stream: SourceStream<T>,
) {
  downstream.on_subscribe(subscription);
  let mut stream = stream.peekable();
  let mut emitted = 0u64;

  loop {
    // Terminal signals need no demand, so look ahead before taking any.
    let has_item = tokio::select! {
      biased;
      _ = core.cancelled() => break,
      peeked = Pin::new(&mut stream).peek() => matches!(peeked, Some(Ok(_))),
    };

    if has_item {
      tokio::select! {
        biased;
        _ = core.cancelled() => break,
        _ = core.demand().take() => {}
      }
    }

    match stream.next().await {
      Some(Ok(item)) => {
        emitted += 1;
        trace!(emitted, "Emitting item.");
        downstream.on_next(item);
      }
      Some(Err(source_error)) => {
        debug!(emitted, "Source failed: {}", source_error);
        core.cancel();
        downstream.on_error(source_error);
        break;
      }
      None => {
        debug!(emitted, "Source exhausted.");
        core.cancel();
        downstream.on_complete();
        break;
      }
    }
  }

  if let Some(fault) = core.take_fault() {
    downstream.on_error(fault);
  }
  drop(stream);
  debug!(emitted, "Source subscription finished.");
}
