use crate::error::FlowError;
use crate::pool::Lease;
use crate::worker::{Outcome, Worker};

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// How the upstream sequence ended.
#[derive(Debug)]
pub(crate) enum UpstreamTerminal {
  Complete,
  Error(FlowError),
}

/// One slot of the in-flight queue, in upstream order.
pub(crate) enum InFlightEntry<W: Worker> {
  /// A dispatched item: the worker stays leased until its outcome is collected.
  Task {
    lease: Lease<W>,
    outcome: Outcome<W::Response>,
  },
  /// The upstream terminal, latched behind every earlier task.
  Terminal(UpstreamTerminal),
}

impl<W: Worker> fmt::Debug for InFlightEntry<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Task { lease, .. } => f.debug_struct("Task").field("lease", lease).finish_non_exhaustive(),
      Self::Terminal(terminal) => f.debug_tuple("Terminal").field(terminal).finish(),
    }
  }
}

/// FIFO of dispatched work between the dispatch and collect loops of a map
/// subscription. Every `Task` holds a lease, so it never holds more tasks
/// than the pool has workers.
pub(crate) struct InFlightQueue<W: Worker> {
  tx: mpsc::UnboundedSender<InFlightEntry<W>>,
  rx: mpsc::UnboundedReceiver<InFlightEntry<W>>,
  len: Arc<AtomicUsize>,
}

impl<W: Worker> InFlightQueue<W> {
  pub(crate) fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      tx,
      rx,
      len: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Splits the queue into its dispatching and collecting halves.
  pub(crate) fn split(self) -> (InFlightProducer<W>, InFlightConsumer<W>) {
    (
      InFlightProducer {
        tx: self.tx,
        len: self.len.clone(),
      },
      InFlightConsumer {
        rx: self.rx,
        len: self.len,
      },
    )
  }
}

pub(crate) struct InFlightProducer<W: Worker> {
  tx: mpsc::UnboundedSender<InFlightEntry<W>>,
  len: Arc<AtomicUsize>,
}

impl<W: Worker> InFlightProducer<W> {
  /// Appends a dispatched task. Hands the entry back if the collector is gone,
  /// so the caller decides when its lease is released.
  pub(crate) fn push_task(&self, lease: Lease<W>, outcome: Outcome<W::Response>) -> Result<(), InFlightEntry<W>> {
    self.push(InFlightEntry::Task { lease, outcome })
  }

  pub(crate) fn push_terminal(&self, terminal: UpstreamTerminal) -> Result<(), InFlightEntry<W>> {
    self.push(InFlightEntry::Terminal(terminal))
  }

  fn push(&self, entry: InFlightEntry<W>) -> Result<(), InFlightEntry<W>> {
    self.len.fetch_add(1, AtomicOrdering::AcqRel);
    self.tx.send(entry).map_err(|returned| {
      self.len.fetch_sub(1, AtomicOrdering::AcqRel);
      returned.0
    })
  }

  pub(crate) fn len(&self) -> usize {
    self.len.load(AtomicOrdering::Acquire)
  }
}

pub(crate) struct InFlightConsumer<W: Worker> {
  rx: mpsc::UnboundedReceiver<InFlightEntry<W>>,
  len: Arc<AtomicUsize>,
}

impl<W: Worker> InFlightConsumer<W> {
  /// Next entry in dispatch order; `None` once the producer is gone and the
  /// queue is empty.
  pub(crate) async fn recv(&mut self) -> Option<InFlightEntry<W>> {
    let entry = self.rx.recv().await?;
    self.len.fetch_sub(1, AtomicOrdering::AcqRel);
    Some(entry)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pool::{PoolConfig, ResourcePool};
  use crate::task_worker::TaskWorker;
  use tokio::runtime::Handle as TokioHandle;

  type Echo = TaskWorker<u32, u32>;

  fn echo_pool(size: usize) -> Arc<ResourcePool<Echo>> {
    ResourcePool::new(PoolConfig::new("inflight", size), |index| {
      TaskWorker::spawn(&format!("echo-{index}"), TokioHandle::current(), |x: u32| async move { Ok(x) })
    })
    .unwrap()
  }

  #[tokio::test]
  async fn test_entries_come_out_in_push_order() {
    let pool = echo_pool(2);
    let (producer, mut consumer) = InFlightQueue::<Echo>::new().split();

    for value in [7, 8] {
      let lease = pool.lease().await.unwrap();
      let outcome = lease.worker().send(value).unwrap();
      producer.push_task(lease, outcome).unwrap();
    }
    producer.push_terminal(UpstreamTerminal::Complete).unwrap();
    assert_eq!(producer.len(), 3);
    assert_eq!(pool.idle_len(), 0);
    drop(producer);

    let mut seen = Vec::new();
    while let Some(entry) = consumer.recv().await {
      match entry {
        InFlightEntry::Task { lease, outcome } => {
          seen.push(outcome.await.unwrap());
          lease.release().unwrap();
        }
        InFlightEntry::Terminal(terminal) => assert!(matches!(terminal, UpstreamTerminal::Complete)),
      }
    }
    assert_eq!(seen, vec![7, 8]);
    assert_eq!(pool.idle_len(), 2);
  }

  #[tokio::test]
  async fn test_push_after_consumer_dropped_returns_the_lease() {
    let pool = echo_pool(1);
    let (producer, consumer) = InFlightQueue::<Echo>::new().split();
    drop(consumer);

    let lease = pool.lease().await.unwrap();
    let outcome = lease.worker().send(1).unwrap();
    let returned = producer.push_task(lease, outcome).unwrap_err();
    assert_eq!(producer.len(), 0);
    assert_eq!(pool.idle_len(), 0);
    drop(returned);
    assert_eq!(pool.idle_len(), 1);
  }
}
