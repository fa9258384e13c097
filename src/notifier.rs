use crate::error::panic_message;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, trace};

/// Identifies a handler registered with
/// [`ResourcePool::watch_idle_count`](crate::ResourcePool::watch_idle_count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type IdleCountHandler = Arc<dyn Fn(usize) + Send + Sync + 'static>;

enum Observer {
  Handler(ObserverId, IdleCountHandler),
  Stream(mpsc::UnboundedSender<usize>),
}

/// Ordered registry of idle-count observers.
///
/// Lives inside the pool's state lock, so observers see changes in the exact
/// order they happened. Handlers therefore run while the lock is held and must
/// not call back into the pool.
pub(crate) struct IdleCountNotifier {
  observers: Vec<Observer>,
  next_observer_id: u64,
}

impl fmt::Debug for IdleCountNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IdleCountNotifier")
      .field("observer_count", &self.observers.len())
      .finish()
  }
}

impl IdleCountNotifier {
  pub(crate) fn new() -> Self {
    Self {
      observers: Vec::new(),
      next_observer_id: 0,
    }
  }

  pub(crate) fn add_handler(&mut self, handler: impl Fn(usize) + Send + Sync + 'static) -> ObserverId {
    let id = ObserverId(self.next_observer_id);
    self.next_observer_id += 1;
    self.observers.push(Observer::Handler(id, Arc::new(handler)));
    debug!(observer_id = id.0, "Added idle count handler. Total observers: {}", self.observers.len());
    id
  }

  pub(crate) fn remove_handler(&mut self, id: ObserverId) -> bool {
    let before = self.observers.len();
    self
      .observers
      .retain(|observer| !matches!(observer, Observer::Handler(existing, _) if *existing == id));
    before != self.observers.len()
  }

  /// Registers a stream observer that starts with `current`.
  pub(crate) fn add_stream(&mut self, current: usize) -> IdleCountStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(current);
    self.observers.push(Observer::Stream(tx));
    IdleCountStream {
      inner: UnboundedReceiverStream::new(rx),
    }
  }

  pub(crate) fn notify(&mut self, idle_count: usize) {
    trace!(idle_count, "Notifying {} idle count observers.", self.observers.len());
    self.observers.retain(|observer| match observer {
      Observer::Handler(id, handler) => {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(idle_count)));
        if let Err(panic_payload) = result {
          error!(
            observer_id = id.0,
            "An idle count handler panicked: {}",
            panic_message(&*panic_payload)
          );
        }
        true
      }
      // Dropped streams unregister themselves here.
      Observer::Stream(tx) => tx.send(idle_count).is_ok(),
    });
  }
}

/// Live sequence of a pool's idle-worker count.
///
/// Yields the count at subscription time first, then one value per change.
/// Ends once the pool itself is dropped.
pub struct IdleCountStream {
  inner: UnboundedReceiverStream<usize>,
}

impl fmt::Debug for IdleCountStream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IdleCountStream").finish_non_exhaustive()
  }
}

impl Stream for IdleCountStream {
  type Item = usize;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<usize>> {
    Pin::new(&mut self.inner).poll_next(cx)
  }
}
