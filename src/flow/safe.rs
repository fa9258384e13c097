use super::{BoxSubscriber, Subscriber, Subscription, SubscriptionRef};
use crate::error::{panic_message, FlowError};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use tracing::{error, trace, warn};

/// Enforces the subscriber side of the protocol around a user subscriber.
///
/// - `on_subscribe` is delivered once; a second subscription is cancelled.
/// - Nothing is delivered after a terminal signal or after the wrapped
///   subscriber cancelled.
/// - A panic in `on_subscribe` or `on_next` cancels the subscription and ends
///   delivery. The faulting subscriber is not called again; operators that
///   own a callback report the fault to the stage below them instead.
pub struct SafeSubscriber<T> {
  delegate: Option<BoxSubscriber<T>>,
  subscription: Option<SubscriptionRef>,
  cancelled_by_delegate: Arc<AtomicBool>,
}

impl<T: Send + 'static> fmt::Debug for SafeSubscriber<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SafeSubscriber")
      .field("subscribed", &self.subscription.is_some())
      .field("terminated", &self.is_terminated())
      .finish()
  }
}

impl<T: Send + 'static> SafeSubscriber<T> {
  pub fn new(delegate: BoxSubscriber<T>) -> Self {
    Self {
      delegate: Some(delegate),
      subscription: None,
      cancelled_by_delegate: Arc::new(AtomicBool::new(false)),
    }
  }

  /// `true` once no further signal will reach the wrapped subscriber.
  pub fn is_terminated(&self) -> bool {
    self.delegate.is_none() || self.cancelled_by_delegate.load(AtomicOrdering::Acquire)
  }

  fn fault(&mut self, message: String) {
    error!("Subscriber callback panicked: {}. Cancelling the subscription.", message);
    if let Some(subscription) = &self.subscription {
      subscription.cancel();
    }
    self.delegate = None;
  }
}

impl<T: Send + 'static> Subscriber<T> for SafeSubscriber<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.subscription.is_some() {
      warn!("Rejected a second on_subscribe for the same subscriber.");
      subscription.cancel();
      return;
    }
    self.subscription = Some(subscription.clone());

    let guarded: SubscriptionRef = Arc::new(GuardedSubscription {
      inner: subscription,
      cancelled_by_delegate: self.cancelled_by_delegate.clone(),
    });
    let result = match self.delegate.as_mut() {
      Some(delegate) => catch_unwind(AssertUnwindSafe(|| delegate.on_subscribe(guarded))),
      None => return,
    };
    if let Err(panic_payload) = result {
      self.fault(format!("on_subscribe panicked: {}", panic_message(&*panic_payload)));
    }
  }

  fn on_next(&mut self, item: T) {
    if self.is_terminated() {
      trace!("Dropped on_next after termination.");
      return;
    }
    let result = match self.delegate.as_mut() {
      Some(delegate) => catch_unwind(AssertUnwindSafe(|| delegate.on_next(item))),
      None => return,
    };
    if let Err(panic_payload) = result {
      self.fault(format!("on_next panicked: {}", panic_message(&*panic_payload)));
    }
  }

  fn on_error(&mut self, error: FlowError) {
    if self.cancelled_by_delegate.load(AtomicOrdering::Acquire) {
      trace!("Dropped on_error after cancellation: {}", error);
      return;
    }
    let Some(mut delegate) = self.delegate.take() else {
      trace!("Dropped on_error after termination: {}", error);
      return;
    };
    if let Err(panic_payload) = catch_unwind(AssertUnwindSafe(|| delegate.on_error(error))) {
      error!("on_error panicked: {}", panic_message(&*panic_payload));
    }
  }

  fn on_complete(&mut self) {
    if self.cancelled_by_delegate.load(AtomicOrdering::Acquire) {
      trace!("Dropped on_complete after cancellation.");
      return;
    }
    let Some(mut delegate) = self.delegate.take() else {
      trace!("Dropped on_complete after termination.");
      return;
    };
    if let Err(panic_payload) = catch_unwind(AssertUnwindSafe(|| delegate.on_complete())) {
      error!("on_complete panicked: {}", panic_message(&*panic_payload));
    }
  }
}

/// The subscription as seen by the wrapped subscriber. Remembers a cancel so
/// that later signals are suppressed even if the publisher races it.
struct GuardedSubscription {
  inner: SubscriptionRef,
  cancelled_by_delegate: Arc<AtomicBool>,
}

impl Subscription for GuardedSubscription {
  fn request(&self, n: u64) {
    self.inner.request(n);
  }

  fn cancel(&self) {
    self.cancelled_by_delegate.store(true, AtomicOrdering::Release);
    self.inner.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct Counts {
    cancels: AtomicUsize,
  }

  struct CountingSubscription(Arc<Counts>);

  impl Subscription for CountingSubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {
      self.0.cancels.fetch_add(1, AtomicOrdering::SeqCst);
    }
  }

  #[derive(Clone, Default)]
  struct Log(Arc<Mutex<Vec<String>>>);

  struct Scripted {
    log: Log,
    panic_on: Option<u32>,
    cancel_on: Option<u32>,
    subscription: Option<SubscriptionRef>,
  }

  impl Subscriber<u32> for Scripted {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
      self.log.0.lock().push("subscribe".to_string());
      self.subscription = Some(subscription);
    }

    fn on_next(&mut self, item: u32) {
      self.log.0.lock().push(format!("next {item}"));
      if self.panic_on == Some(item) {
        panic!("cannot handle {item}");
      }
      if self.cancel_on == Some(item) {
        if let Some(subscription) = &self.subscription {
          subscription.cancel();
        }
      }
    }

    fn on_error(&mut self, error: FlowError) {
      self.log.0.lock().push(format!("error {error}"));
    }

    fn on_complete(&mut self) {
      self.log.0.lock().push("complete".to_string());
    }
  }

  fn scripted(panic_on: Option<u32>, cancel_on: Option<u32>) -> (SafeSubscriber<u32>, Log) {
    let log = Log::default();
    let subscriber = SafeSubscriber::new(Box::new(Scripted {
      log: log.clone(),
      panic_on,
      cancel_on,
      subscription: None,
    }));
    (subscriber, log)
  }

  #[test]
  fn test_panic_in_on_next_cancels_and_silences_the_subscriber() {
    let counts = Arc::new(Counts::default());
    let (mut subscriber, log) = scripted(Some(2), None);

    subscriber.on_subscribe(Arc::new(CountingSubscription(counts.clone())));
    subscriber.on_next(1);
    subscriber.on_next(2);
    subscriber.on_next(3);
    subscriber.on_error(FlowError::SourceFault("late".to_string()));
    subscriber.on_complete();

    assert_eq!(*log.0.lock(), vec!["subscribe", "next 1", "next 2"]);
    assert_eq!(counts.cancels.load(AtomicOrdering::SeqCst), 1);
    assert!(subscriber.is_terminated());
  }

  #[test]
  fn test_signals_after_delegate_cancel_are_dropped() {
    let counts = Arc::new(Counts::default());
    let (mut subscriber, log) = scripted(None, Some(1));

    subscriber.on_subscribe(Arc::new(CountingSubscription(counts.clone())));
    subscriber.on_next(1);
    subscriber.on_next(2);
    subscriber.on_error(FlowError::SourceFault("late".to_string()));

    assert_eq!(*log.0.lock(), vec!["subscribe", "next 1"]);
    assert_eq!(counts.cancels.load(AtomicOrdering::SeqCst), 1);
  }

  #[test]
  fn test_only_one_terminal_is_delivered() {
    let (mut subscriber, log) = scripted(None, None);
    subscriber.on_subscribe(Arc::new(CountingSubscription(Arc::default())));
    subscriber.on_complete();
    subscriber.on_error(FlowError::SourceFault("late".to_string()));
    subscriber.on_next(9);

    assert_eq!(*log.0.lock(), vec!["subscribe", "complete"]);
  }

  #[test]
  fn test_second_subscription_is_cancelled() {
    let first = Arc::new(Counts::default());
    let second = Arc::new(Counts::default());
    let (mut subscriber, log) = scripted(None, None);

    subscriber.on_subscribe(Arc::new(CountingSubscription(first.clone())));
    subscriber.on_subscribe(Arc::new(CountingSubscription(second.clone())));

    assert_eq!(*log.0.lock(), vec!["subscribe"]);
    assert_eq!(first.cancels.load(AtomicOrdering::SeqCst), 0);
    assert_eq!(second.cancels.load(AtomicOrdering::SeqCst), 1);
  }
}
