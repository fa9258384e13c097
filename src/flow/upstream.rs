use super::{Signal, Subscriber, SubscriptionRef};
use crate::error::FlowError;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

enum SlotState {
  /// Upstream has not called `on_subscribe` yet; remember what to replay.
  Detached { requested: u64, cancelled: bool },
  Attached(SubscriptionRef),
}

/// An operator's handle on its upstream subscription, usable before the
/// upstream has called `on_subscribe`.
pub(crate) struct UpstreamSlot {
  state: Mutex<SlotState>,
}

impl fmt::Debug for UpstreamSlot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let attached = matches!(*self.state.lock(), SlotState::Attached(_));
    f.debug_struct("UpstreamSlot").field("attached", &attached).finish()
  }
}

impl UpstreamSlot {
  pub(crate) fn new() -> Self {
    Self {
      state: Mutex::new(SlotState::Detached {
        requested: 0,
        cancelled: false,
      }),
    }
  }

  /// Installs the upstream subscription and replays buffered demand or cancellation.
  pub(crate) fn attach(&self, subscription: SubscriptionRef) {
    let previous = {
      let mut state = self.state.lock();
      if matches!(*state, SlotState::Attached(_)) {
        None
      } else {
        Some(std::mem::replace(&mut *state, SlotState::Attached(subscription.clone())))
      }
    };

    match previous {
      None => {
        debug!("Upstream subscribed twice. Cancelling the second subscription.");
        subscription.cancel();
      }
      Some(SlotState::Detached { cancelled: true, .. }) => subscription.cancel(),
      Some(SlotState::Detached { requested, .. }) if requested > 0 => {
        trace!(requested, "Replaying demand to upstream.");
        subscription.request(requested);
      }
      Some(_) => {}
    }
  }

  pub(crate) fn request(&self, n: u64) {
    let attached = {
      let mut state = self.state.lock();
      match &mut *state {
        SlotState::Attached(subscription) => Some(subscription.clone()),
        SlotState::Detached { requested, cancelled } => {
          if !*cancelled {
            *requested = requested.saturating_add(n);
          }
          None
        }
      }
    };
    if let Some(subscription) = attached {
      subscription.request(n);
    }
  }

  pub(crate) fn cancel(&self) {
    let attached = {
      let mut state = self.state.lock();
      match &mut *state {
        SlotState::Attached(subscription) => Some(subscription.clone()),
        SlotState::Detached { cancelled, .. } => {
          *cancelled = true;
          None
        }
      }
    };
    if let Some(subscription) = attached {
      subscription.cancel();
    }
  }
}

/// Subscribes to an upstream publisher on an operator's behalf and turns its
/// callbacks into [`Signal`]s on a channel.
pub(crate) struct ForwardingSubscriber<T> {
  signal_tx: mpsc::UnboundedSender<Signal<T>>,
  slot: Arc<UpstreamSlot>,
}

impl<T> ForwardingSubscriber<T> {
  pub(crate) fn new(signal_tx: mpsc::UnboundedSender<Signal<T>>, slot: Arc<UpstreamSlot>) -> Self {
    Self { signal_tx, slot }
  }

  fn forward(&self, signal: Signal<T>) {
    if self.signal_tx.send(signal).is_err() {
      trace!("Operator stopped listening. Dropping upstream signal.");
    }
  }
}

impl<T: Send + 'static> Subscriber<T> for ForwardingSubscriber<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.slot.attach(subscription);
  }

  fn on_next(&mut self, item: T) {
    self.forward(Signal::Next(item));
  }

  fn on_error(&mut self, error: FlowError) {
    self.forward(Signal::Error(error));
  }

  fn on_complete(&mut self) {
    self.forward(Signal::Complete);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::flow::Subscription;

  #[derive(Default)]
  struct Recorded {
    requests: Mutex<Vec<u64>>,
    cancelled: Mutex<bool>,
  }

  impl Subscription for Recorded {
    fn request(&self, n: u64) {
      self.requests.lock().push(n);
    }

    fn cancel(&self) {
      *self.cancelled.lock() = true;
    }
  }

  #[test]
  fn test_demand_before_attach_is_replayed_as_one_request() {
    let slot = UpstreamSlot::new();
    slot.request(2);
    slot.request(3);
    let upstream = Arc::new(Recorded::default());
    slot.attach(upstream.clone());
    slot.request(1);

    assert_eq!(*upstream.requests.lock(), vec![5, 1]);
    assert!(!*upstream.cancelled.lock());
  }

  #[test]
  fn test_cancel_before_attach_cancels_on_attach() {
    let slot = UpstreamSlot::new();
    slot.request(4);
    slot.cancel();
    let upstream = Arc::new(Recorded::default());
    slot.attach(upstream.clone());

    assert!(upstream.requests.lock().is_empty());
    assert!(*upstream.cancelled.lock());
  }

  #[test]
  fn test_second_attach_is_cancelled() {
    let slot = UpstreamSlot::new();
    let first = Arc::new(Recorded::default());
    let second = Arc::new(Recorded::default());
    slot.attach(first.clone());
    slot.attach(second.clone());

    assert!(!*first.cancelled.lock());
    assert!(*second.cancelled.lock());
  }
}
