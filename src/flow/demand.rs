use crate::error::FlowError;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

lazy_static::lazy_static! {
  static ref NEXT_SUBSCRIPTION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Outstanding downstream demand.
#[derive(Debug, Default)]
pub(crate) struct Demand {
  outstanding: AtomicU64,
  granted: Notify,
}

impl Demand {
  /// Adds `n` (saturating) and returns the new outstanding total.
  pub(crate) fn add(&self, n: u64) -> u64 {
    let previous = self
      .outstanding
      .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |current| {
        Some(current.saturating_add(n))
      })
      .unwrap_or_else(|current| current);
    self.granted.notify_one();
    previous.saturating_add(n)
  }

  /// Consumes one unit of demand if any is outstanding.
  pub(crate) fn try_take(&self) -> bool {
    self
      .outstanding
      .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |current| {
        current.checked_sub(1)
      })
      .is_ok()
  }

  /// Waits until one unit of demand is available and consumes it.
  pub(crate) async fn take(&self) {
    loop {
      if self.try_take() {
        return;
      }
      self.granted.notified().await;
    }
  }

  pub(crate) fn outstanding(&self) -> u64 {
    self.outstanding.load(AtomicOrdering::Acquire)
  }
}

/// Shared bookkeeping behind one subscription: demand, cancellation and the
/// first operator fault, which is reported once the flow has stopped.
#[derive(Debug)]
pub(crate) struct SubscriptionCore {
  id: u64,
  cancelled: AtomicBool,
  token: CancellationToken,
  demand: Demand,
  fault: Mutex<Option<FlowError>>,
}

impl SubscriptionCore {
  pub(crate) fn new() -> Self {
    Self {
      id: NEXT_SUBSCRIPTION_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
      cancelled: AtomicBool::new(false),
      token: CancellationToken::new(),
      demand: Demand::default(),
      fault: Mutex::new(None),
    }
  }

  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  pub(crate) fn demand(&self) -> &Demand {
    &self.demand
  }

  pub(crate) fn token(&self) -> &CancellationToken {
    &self.token
  }

  pub(crate) fn is_cancelled(&self) -> bool {
    self.cancelled.load(AtomicOrdering::Acquire)
  }

  pub(crate) async fn cancelled(&self) {
    self.token.cancelled().await
  }

  /// Records `n` more demand. Returns `false` if the request was ignored
  /// (already cancelled) or rejected (`n == 0`, which fails the subscription).
  pub(crate) fn request(&self, n: u64) -> bool {
    if self.is_cancelled() {
      trace!(subscription_id = self.id, n, "Ignoring request on a cancelled subscription.");
      return false;
    }
    if n == 0 {
      self.fail(FlowError::InvalidDemand(n));
      return false;
    }
    let outstanding = self.demand.add(n);
    trace!(subscription_id = self.id, n, outstanding, "Demand requested.");
    true
  }

  /// Cancels the subscription. Returns `true` only for the first call.
  pub(crate) fn cancel(&self) -> bool {
    if self.cancelled.swap(true, AtomicOrdering::AcqRel) {
      return false;
    }
    debug!(subscription_id = self.id, "Subscription cancelled.");
    self.token.cancel();
    true
  }

  /// Records `error` as the fault to report and cancels. A fault arriving
  /// after cancellation is dropped. Returns `true` if it was recorded.
  pub(crate) fn fail(&self, error: FlowError) -> bool {
    let recorded = {
      let mut fault = self.fault.lock();
      if fault.is_none() && !self.is_cancelled() {
        debug!(subscription_id = self.id, "Subscription failed: {}", error);
        *fault = Some(error);
        true
      } else {
        false
      }
    };
    self.cancel();
    recorded
  }

  pub(crate) fn take_fault(&self) -> Option<FlowError> {
    self.fault.lock().take()
  }
}
