use crate::error::FlowError;
use crate::flow::{
  BoxSubscriber, ForwardingSubscriber, Publisher, SafeSubscriber, Signal, Subscriber, Subscription, SubscriptionCore,
  SubscriptionRef, UpstreamSlot,
};
use crate::inflight::{InFlightConsumer, InFlightEntry, InFlightProducer, InFlightQueue, UpstreamTerminal};
use crate::pool::{Lease, ResourcePool};
use crate::worker::{Outcome, Worker};

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument};

/// Lifecycle of one map subscription. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum OperatorState {
  /// Accepting upstream items and delivering results.
  Active,
  /// Upstream has terminated; in-flight results are still being delivered.
  Draining,
  /// Terminal signal delivered or subscription cancelled.
  Terminated,
}

/// Per-subscription state shared by the subscription handle and both loops.
struct MapShared {
  core: SubscriptionCore,
  upstream: Arc<UpstreamSlot>,
  state: Mutex<OperatorState>,
}

impl MapShared {
  fn new() -> Self {
    Self {
      core: SubscriptionCore::new(),
      upstream: Arc::new(UpstreamSlot::new()),
      state: Mutex::new(OperatorState::Active),
    }
  }

  fn state(&self) -> OperatorState {
    *self.state.lock()
  }

  fn is_terminated(&self) -> bool {
    self.state() == OperatorState::Terminated
  }

  /// Moves the state forward. Returns `false` if it already was at or past `next`.
  fn advance(&self, next: OperatorState) -> bool {
    let mut state = self.state.lock();
    if next <= *state {
      return false;
    }
    trace!(subscription_id = self.core.id(), from = ?*state, to = ?next, "Operator state changed.");
    *state = next;
    true
  }

  /// Claims the right to end the subscription. Only the first caller gets `true`.
  fn terminate(&self) -> bool {
    self.advance(OperatorState::Terminated)
  }

  /// Records an operator fault. The collector delivers it when it sees the cancellation.
  fn fail(&self, fault: FlowError) {
    self.core.fail(fault);
    self.upstream.cancel();
  }

  /// Downstream cancellation: nothing is delivered from here on.
  fn cancel(&self) {
    self.terminate();
    if self.core.cancel() {
      self.upstream.cancel();
    }
  }
}

struct MapSubscription {
  shared: Arc<MapShared>,
}

impl Subscription for MapSubscription {
  fn request(&self, n: u64) {
    if self.shared.core.request(n) {
      // Upstream demand mirrors downstream demand one to one.
      self.shared.upstream.request(n);
    } else {
      self.shared.upstream.cancel();
    }
  }

  fn cancel(&self) {
    self.shared.cancel();
  }
}

/// Order-preserving asynchronous map over a [`ResourcePool`].
///
/// Each upstream item is sent to a worker leased from the pool, so at most
/// `pool.size()` items are processed at once across all subscriptions sharing
/// the pool. Results are delivered in upstream order regardless of which
/// worker finishes first. A failing item ends the flow with its error once
/// every earlier result has been delivered.
///
/// Each subscription runs two tasks: a dispatch loop that leases workers and
/// hands out items, and a collect loop that awaits outcomes in order, returns
/// the workers and talks to the downstream subscriber.
pub struct MapWithWorkers<W: Worker> {
  upstream: Arc<dyn Publisher<W::Request>>,
  pool: Arc<ResourcePool<W>>,
}

impl<W: Worker> fmt::Debug for MapWithWorkers<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MapWithWorkers")
      .field("pool", &self.pool)
      .finish_non_exhaustive()
  }
}

impl<W: Worker> MapWithWorkers<W> {
  pub fn new(upstream: Arc<dyn Publisher<W::Request>>, pool: Arc<ResourcePool<W>>) -> Self {
    Self { upstream, pool }
  }
}

impl<W: Worker> Publisher<W::Response> for MapWithWorkers<W> {
  fn subscribe(&self, subscriber: BoxSubscriber<W::Response>) {
    let shared = Arc::new(MapShared::new());
    let subscription_id = shared.core.id();
    let pool_name = self.pool.name().to_string();
    debug!(pool_name = %pool_name, subscription_id, "New map subscription.");

    let subscription: SubscriptionRef = Arc::new(MapSubscription { shared: shared.clone() });
    let (pending_tx, pending_rx) = mpsc::unbounded_channel();
    let (producer, consumer) = InFlightQueue::new().split();

    let collector = Collector::<W> {
      shared: shared.clone(),
      downstream: SafeSubscriber::new(subscriber),
      delivered: 0,
    };
    tokio::spawn(
      collector
        .run(subscription, consumer)
        .instrument(info_span!("map_collect", pool_name = %pool_name, subscription_id)),
    );
    tokio::spawn(
      run_dispatch_loop(shared.clone(), self.pool.clone(), pending_rx, producer)
        .instrument(info_span!("map_dispatch", pool_name = %pool_name, subscription_id)),
    );

    self
      .upstream
      .subscribe(Box::new(ForwardingSubscriber::new(pending_tx, shared.upstream.clone())));
  }
}

/// Takes upstream signals in arrival order, leases a worker for each item and
/// queues the pending outcome. The upstream terminal is queued behind them.
async fn run_dispatch_loop<W: Worker>(
  shared: Arc<MapShared>,
  pool: Arc<ResourcePool<W>>,
  mut pending: mpsc::UnboundedReceiver<Signal<W::Request>>,
  inflight: InFlightProducer<W>,
) {
  debug!("Dispatch loop started.");
  let mut dispatched = 0u64;

  while shared.state() == OperatorState::Active {
    let signal = tokio::select! {
      biased;
      _ = shared.core.cancelled() => break,
      signal = pending.recv() => signal,
    };

    let item = match signal {
      Some(Signal::Next(item)) => item,
      Some(Signal::Complete) => {
        shared.advance(OperatorState::Draining);
        debug!(dispatched, in_flight = inflight.len(), "Upstream completed. Draining in-flight work.");
        let _ = inflight.push_terminal(UpstreamTerminal::Complete);
        break;
      }
      Some(Signal::Error(upstream_error)) => {
        shared.advance(OperatorState::Draining);
        debug!(dispatched, in_flight = inflight.len(), "Upstream failed: {}. Draining in-flight work.", upstream_error);
        let _ = inflight.push_terminal(UpstreamTerminal::Error(upstream_error));
        break;
      }
      None => {
        debug!("Upstream went away without a terminal signal.");
        break;
      }
    };

    let lease: Lease<W> = tokio::select! {
      biased;
      _ = shared.core.cancelled() => break,
      leased = pool.lease() => match leased {
        Ok(lease) => lease,
        Err(pool_error) => {
          warn!("Could not lease a worker: {}", pool_error);
          shared.fail(FlowError::Pool(pool_error));
          break;
        }
      },
    };

    if shared.core.is_cancelled() || shared.is_terminated() {
      break;
    }

    match lease.worker().send(item) {
      Ok(outcome) => {
        dispatched += 1;
        trace!(dispatched, in_flight = inflight.len() + 1, "Item dispatched to worker.");
        if inflight.push_task(lease, outcome).is_err() {
          debug!("Collector is gone. Stopping dispatch.");
          break;
        }
      }
      Err(send_error) => {
        if let Err(release_error) = lease.release() {
          error!("Failed to release worker after a failed send: {}", release_error);
        }
        warn!("Could not send item to worker: {}", send_error);
        shared.fail(send_error);
        break;
      }
    }
  }

  pending.close();
  let mut discarded = 0usize;
  while pending.try_recv().is_ok() {
    discarded += 1;
  }
  debug!(dispatched, discarded, "Dispatch loop stopped.");
}

/// Owns the downstream subscriber and delivers results in dispatch order.
struct Collector<W: Worker> {
  shared: Arc<MapShared>,
  downstream: SafeSubscriber<W::Response>,
  delivered: u64,
}

impl<W: Worker> Collector<W> {
  async fn run(mut self, subscription: SubscriptionRef, mut inflight: InFlightConsumer<W>) {
    self.downstream.on_subscribe(subscription);
    let token = self.shared.core.token().clone();

    loop {
      let entry = tokio::select! {
        biased;
        _ = token.cancelled(), if !self.shared.is_terminated() => {
          self.stop_delivering();
          continue;
        }
        entry = inflight.recv() => entry,
      };

      match entry {
        Some(InFlightEntry::Task { lease, outcome }) => self.collect(&token, lease, outcome).await,
        Some(InFlightEntry::Terminal(terminal)) => self.finish(terminal),
        None => break,
      }
    }

    if self.shared.terminate() {
      let fault = self.shared.core.take_fault().unwrap_or_else(|| {
        FlowError::ProtocolFault("upstream ended without a terminal signal".to_string())
      });
      self.shared.cancel();
      warn!("Map subscription ended abnormally: {}", fault);
      self.downstream.on_error(fault);
    }
    debug!(delivered = self.delivered, "Collect loop stopped.");
  }

  async fn collect(&mut self, token: &CancellationToken, lease: Lease<W>, mut outcome: Outcome<W::Response>) {
    // Keep awaiting after cancellation so the worker is only reused once idle.
    let result = loop {
      tokio::select! {
        biased;
        _ = token.cancelled(), if !self.shared.is_terminated() => self.stop_delivering(),
        result = &mut outcome => break result,
      }
    };

    if let Err(release_error) = lease.release() {
      error!("Failed to release worker: {}", release_error);
    }

    if self.shared.is_terminated() {
      trace!("Discarding result collected after termination.");
      return;
    }

    match result {
      Ok(value) => {
        let shared = self.shared.clone();
        if shared.core.demand().outstanding() == 0 {
          trace!("Result ready. Waiting for downstream demand.");
        }
        let granted = tokio::select! {
          biased;
          _ = token.cancelled() => false,
          _ = shared.core.demand().take() => true,
        };
        if !granted {
          self.stop_delivering();
          return;
        }
        self.delivered += 1;
        trace!(delivered = self.delivered, "Delivering result.");
        self.downstream.on_next(value);
      }
      Err(fault) => {
        if !self.shared.terminate() {
          return;
        }
        warn!(delivered = self.delivered, "Worker fault ends the subscription: {}", fault);
        self.shared.cancel();
        self.downstream.on_error(fault);
      }
    }
  }

  fn finish(&mut self, terminal: UpstreamTerminal) {
    if !self.shared.terminate() {
      return;
    }
    self.shared.cancel();
    match terminal {
      UpstreamTerminal::Complete => {
        debug!(delivered = self.delivered, "All results delivered. Completing.");
        self.downstream.on_complete();
      }
      UpstreamTerminal::Error(upstream_error) => {
        debug!(delivered = self.delivered, "All results delivered. Forwarding upstream error.");
        self.downstream.on_error(upstream_error);
      }
    }
  }

  /// Reacts to cancellation: delivers a pending operator fault if there is one.
  fn stop_delivering(&mut self) {
    if !self.shared.terminate() {
      return;
    }
    match self.shared.core.take_fault() {
      Some(fault) => {
        warn!(delivered = self.delivered, "Operator fault ends the subscription: {}", fault);
        self.shared.upstream.cancel();
        self.downstream.on_error(fault);
      }
      None => debug!(delivered = self.delivered, "Cancelled downstream. Draining in-flight work silently."),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_state_only_moves_forward() {
    let shared = MapShared::new();
    assert_eq!(shared.state(), OperatorState::Active);

    assert!(shared.advance(OperatorState::Draining));
    assert!(!shared.advance(OperatorState::Active));
    assert!(!shared.advance(OperatorState::Draining));
    assert_eq!(shared.state(), OperatorState::Draining);

    assert!(shared.terminate());
    assert!(!shared.terminate());
    assert!(!shared.advance(OperatorState::Draining));
    assert!(shared.is_terminated());
  }

  #[test]
  fn test_operator_fault_leaves_termination_to_the_collector() {
    let shared = MapShared::new();
    shared.fail(FlowError::WorkerFault("gone".to_string()));

    assert!(shared.core.is_cancelled());
    assert_eq!(shared.state(), OperatorState::Active);
    assert!(shared.terminate());
    assert_eq!(shared.core.take_fault(), Some(FlowError::WorkerFault("gone".to_string())));
  }

  #[test]
  fn test_downstream_cancel_terminates_at_once() {
    let shared = MapShared::new();
    shared.cancel();

    assert!(shared.is_terminated());
    assert!(shared.core.is_cancelled());
    assert!(!shared.terminate());
  }
}
