use crate::error::PoolError;
use crate::notifier::{IdleCountNotifier, IdleCountStream, ObserverId};
use crate::worker::Worker;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how the pool treats workers that are still held when shutdown starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Held workers finish their current request; each is terminated when released.
  Graceful,
  /// Held workers are terminated immediately. Shutdown still completes only
  /// once every one of them has been released.
  ForcefulTerminate,
}

/// Sizing and naming for a [`ResourcePool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  pub name: String,
  pub size: usize,
}

impl PoolConfig {
  pub fn new(name: &str, size: usize) -> Self {
    Self {
      name: name.to_string(),
      size,
    }
  }

  /// One worker per available core, keeping one core free for the caller.
  pub fn from_available_parallelism(name: &str) -> Self {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    Self::new(name, cores.saturating_sub(1).max(1))
  }
}

/// A worker checked out of a [`ResourcePool`].
///
/// The handle is the only proof of checkout and cannot be duplicated, so a
/// worker goes back to the pool at most once per acquire:
///
/// ```compile_fail
/// fn duplicable<T: Clone>() {}
/// duplicable::<pooled_flow::WorkerHandle<pooled_flow::TaskWorker<u8, u8>>>();
/// ```
pub struct WorkerHandle<W> {
  pool_id: u64,
  index: usize,
  worker: Arc<W>,
}

impl<W> WorkerHandle<W> {
  /// Position of the worker inside its pool.
  pub fn index(&self) -> usize {
    self.index
  }

  pub fn worker(&self) -> &W {
    &self.worker
  }
}

impl<W> fmt::Debug for WorkerHandle<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerHandle")
      .field("pool_id", &self.pool_id)
      .field("index", &self.index)
      .finish()
  }
}

enum ShutdownProgress {
  Waiting(oneshot::Sender<()>),
  Completed,
}

struct PoolState<W> {
  idle: VecDeque<usize>,
  waiters: VecDeque<oneshot::Sender<WorkerHandle<W>>>,
  shutdown: Option<ShutdownProgress>,
  notifier: IdleCountNotifier,
}

/// A fixed set of interchangeable workers handed out with FIFO fairness.
///
/// All bookkeeping (idle subset, waiter queue, shutdown progress and idle
/// count observers) sits behind a single lock.
pub struct ResourcePool<W: Worker> {
  pool_id: u64,
  pool_name: Arc<String>,
  workers: Vec<Arc<W>>,
  state: Mutex<PoolState<W>>,
}

impl<W: Worker> fmt::Debug for ResourcePool<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResourcePool")
      .field("pool_name", &self.pool_name)
      .field("size", &self.workers.len())
      .field("idle", &self.idle_len())
      .field("shutting_down", &self.is_shutting_down())
      .finish()
  }
}

impl<W: Worker> ResourcePool<W> {
  /// Builds the pool, calling `factory` once per worker index.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidConfiguration` if `config.size` is zero. The
  /// factory is not called in that case.
  pub fn new(config: PoolConfig, mut factory: impl FnMut(usize) -> W) -> Result<Arc<Self>, PoolError> {
    if config.size == 0 {
      warn!(pool_name = %config.name, "Rejected pool configuration with zero workers.");
      return Err(PoolError::InvalidConfiguration(
        "pool size must be positive".to_string(),
      ));
    }

    let workers: Vec<Arc<W>> = (0..config.size).map(|index| Arc::new(factory(index))).collect();
    let pool = Arc::new(Self {
      pool_id: NEXT_POOL_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
      pool_name: Arc::new(config.name),
      state: Mutex::new(PoolState {
        idle: (0..workers.len()).collect(),
        waiters: VecDeque::new(),
        shutdown: None,
        notifier: IdleCountNotifier::new(),
      }),
      workers,
    });
    info!(pool_name = %pool.pool_name, size = pool.workers.len(), "Resource pool created.");
    Ok(pool)
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn size(&self) -> usize {
    self.workers.len()
  }

  /// Number of workers currently in the idle subset (terminated ones included).
  pub fn idle_len(&self) -> usize {
    self.state.lock().idle.len()
  }

  pub fn held_len(&self) -> usize {
    self.workers.len() - self.idle_len()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.state.lock().shutdown.is_some()
  }

  /// Checks out a worker, waiting in line behind earlier callers if none is idle.
  ///
  /// Dropping the returned future while it waits is safe: a worker handed to it
  /// in the meantime goes straight back to the pool.
  ///
  /// # Errors
  /// Returns `PoolError::PoolShuttingDown` if shutdown has started, including
  /// while this caller was waiting.
  pub async fn acquire(&self) -> Result<WorkerHandle<W>, PoolError> {
    let rx = {
      let mut state = self.state.lock();
      if state.shutdown.is_some() {
        warn!(pool_name = %self.pool_name, "Acquire: Attempted to acquire a worker from a pool that is shutting down.");
        return Err(PoolError::PoolShuttingDown);
      }
      if let Some(index) = state.idle.pop_front() {
        let idle_count = state.idle.len();
        state.notifier.notify(idle_count);
        trace!(pool_name = %self.pool_name, worker_index = index, idle_count, "Acquired idle worker.");
        return Ok(self.handle_for(index));
      }
      let (tx, rx) = oneshot::channel();
      state.waiters.push_back(tx);
      debug!(pool_name = %self.pool_name, waiters = state.waiters.len(), "No idle worker. Queued acquire request.");
      rx
    };

    PendingAcquire { pool: self, rx: Some(rx) }.await
  }

  /// [`acquire`](Self::acquire), wrapped in a [`Lease`] that releases on drop.
  pub async fn lease(self: &Arc<Self>) -> Result<Lease<W>, PoolError> {
    let handle = self.acquire().await?;
    Ok(Lease {
      pool: self.clone(),
      worker: handle.worker.clone(),
      handle: Some(handle),
    })
  }

  /// Returns a worker to the pool.
  ///
  /// During shutdown the worker is terminated instead of being handed out again.
  ///
  /// # Errors
  /// Returns `PoolError::NotOwned` for a handle from another pool and
  /// `PoolError::AlreadyIdle` if the worker is already in the idle subset.
  pub fn release(&self, worker: WorkerHandle<W>) -> Result<(), PoolError> {
    if worker.pool_id != self.pool_id || worker.index >= self.workers.len() {
      warn!(pool_name = %self.pool_name, "Release: Worker is not from this pool.");
      return Err(PoolError::NotOwned);
    }

    let mut guard = self.state.lock();
    let state = &mut *guard;
    if state.idle.contains(&worker.index) {
      warn!(pool_name = %self.pool_name, worker_index = worker.index, "Release: Worker is already idle.");
      return Err(PoolError::AlreadyIdle);
    }

    if let Some(progress) = state.shutdown.as_mut() {
      self.workers[worker.index].terminate();
      state.idle.push_back(worker.index);
      let idle_count = state.idle.len();
      debug!(pool_name = %self.pool_name, worker_index = worker.index, idle_count, "Terminated worker released during shutdown.");
      if idle_count == self.workers.len() {
        if let ShutdownProgress::Waiting(done_tx) = std::mem::replace(progress, ShutdownProgress::Completed) {
          info!(pool_name = %self.pool_name, "All workers returned. Pool shutdown completed.");
          let _ = done_tx.send(());
        }
      }
      state.notifier.notify(idle_count);
      return Ok(());
    }

    let mut handle = worker;
    while let Some(waiter) = state.waiters.pop_front() {
      match waiter.send(handle) {
        Ok(()) => {
          trace!(pool_name = %self.pool_name, waiters = state.waiters.len(), "Handed released worker to the longest waiting caller.");
          return Ok(());
        }
        // The waiter stopped waiting; try the next one.
        Err(returned) => handle = returned,
      }
    }

    state.idle.push_back(handle.index);
    let idle_count = state.idle.len();
    trace!(pool_name = %self.pool_name, worker_index = handle.index, idle_count, "Worker returned to idle subset.");
    state.notifier.notify(idle_count);
    Ok(())
  }

  /// Live sequence of the idle count, starting with the current value.
  pub fn idle_count(&self) -> IdleCountStream {
    let mut state = self.state.lock();
    let current = state.idle.len();
    state.notifier.add_stream(current)
  }

  /// Calls `handler` with the new idle count on every change.
  ///
  /// The handler runs under the pool lock and must not call back into the pool.
  pub fn watch_idle_count(&self, handler: impl Fn(usize) + Send + Sync + 'static) -> ObserverId {
    self.state.lock().notifier.add_handler(handler)
  }

  /// Unregisters a handler. Returns `false` if it was not registered.
  pub fn unwatch_idle_count(&self, id: ObserverId) -> bool {
    self.state.lock().notifier.remove_handler(id)
  }

  /// Starts shutting the pool down.
  ///
  /// Pending acquirers are rejected and idle workers terminated right away. The
  /// returned [`Shutdown`] resolves once every held worker has been released.
  ///
  /// # Errors
  /// Returns `PoolError::ShutdownAlreadyRequested` on any call after the first.
  pub fn shutdown(&self, mode: ShutdownMode) -> Result<Shutdown, PoolError> {
    let mut state = self.state.lock();
    if state.shutdown.is_some() {
      warn!(pool_name = %self.pool_name, "Shutdown already in progress or completed.");
      return Err(PoolError::ShutdownAlreadyRequested);
    }

    info!(pool_name = %self.pool_name, "Initiating pool shutdown (mode: {:?}).", mode);

    // Dropping the senders rejects the waiters with PoolShuttingDown.
    let rejected = state.waiters.len();
    state.waiters.clear();
    if rejected > 0 {
      debug!(pool_name = %self.pool_name, rejected, "Rejected pending acquire requests.");
    }

    for &index in &state.idle {
      self.workers[index].terminate();
    }
    let held = self.workers.len() - state.idle.len();
    if mode == ShutdownMode::ForcefulTerminate && held > 0 {
      info!(pool_name = %self.pool_name, held, "Forceful shutdown: Terminating held workers.");
      for (index, worker) in self.workers.iter().enumerate() {
        if !state.idle.contains(&index) {
          worker.terminate();
        }
      }
    }

    if held == 0 {
      state.shutdown = Some(ShutdownProgress::Completed);
      info!(pool_name = %self.pool_name, "No workers held. Pool shutdown completed.");
      return Ok(Shutdown { done_rx: None });
    }

    let (done_tx, done_rx) = oneshot::channel();
    state.shutdown = Some(ShutdownProgress::Waiting(done_tx));
    info!(pool_name = %self.pool_name, held, "Waiting for held workers to be released.");
    Ok(Shutdown { done_rx: Some(done_rx) })
  }

  fn handle_for(&self, index: usize) -> WorkerHandle<W> {
    WorkerHandle {
      pool_id: self.pool_id,
      index,
      worker: self.workers[index].clone(),
    }
  }
}

impl<W: Worker> Drop for ResourcePool<W> {
  fn drop(&mut self) {
    if self.state.get_mut().shutdown.is_none() {
      info!(
        pool_name = %*self.pool_name,
        "ResourcePool dropped without shutdown. Terminating all workers."
      );
      for worker in &self.workers {
        worker.terminate();
      }
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Shutdown already requested. No new signals sent.");
    }
  }
}

/// Waits in the acquire queue; gives back a worker that arrives after it was dropped.
struct PendingAcquire<'a, W: Worker> {
  pool: &'a ResourcePool<W>,
  rx: Option<oneshot::Receiver<WorkerHandle<W>>>,
}

impl<W: Worker> Future for PendingAcquire<'_, W> {
  type Output = Result<WorkerHandle<W>, PoolError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let Some(rx) = self.rx.as_mut() else {
      return Poll::Ready(Err(PoolError::PoolShuttingDown));
    };
    let received = ready!(Pin::new(rx).poll(cx));
    self.rx = None;
    Poll::Ready(received.map_err(|_| PoolError::PoolShuttingDown))
  }
}

impl<W: Worker> Drop for PendingAcquire<'_, W> {
  fn drop(&mut self) {
    if let Some(mut rx) = self.rx.take() {
      rx.close();
      if let Ok(handle) = rx.try_recv() {
        debug!(pool_name = %self.pool.pool_name, "Acquire abandoned after a worker was handed over. Returning it.");
        if let Err(release_error) = self.pool.release(handle) {
          error!(pool_name = %self.pool.pool_name, "Failed to return worker from abandoned acquire: {}", release_error);
        }
      }
    }
  }
}

/// Resolves once every worker of a shutting-down pool has been released.
#[must_use = "shutdown completion is only observed when awaited"]
#[derive(Debug)]
pub struct Shutdown {
  done_rx: Option<oneshot::Receiver<()>>,
}

impl Shutdown {
  pub fn is_completed(&self) -> bool {
    self.done_rx.is_none()
  }
}

impl Future for Shutdown {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    if let Some(rx) = self.done_rx.as_mut() {
      // A closed channel means the pool itself is gone, which also ends shutdown.
      let _ = ready!(Pin::new(rx).poll(cx));
      self.done_rx = None;
    }
    Poll::Ready(())
  }
}

/// A held worker that returns itself to its pool when dropped.
pub struct Lease<W: Worker> {
  pool: Arc<ResourcePool<W>>,
  worker: Arc<W>,
  handle: Option<WorkerHandle<W>>,
}

impl<W: Worker> fmt::Debug for Lease<W> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Lease")
      .field("pool_name", &self.pool.pool_name)
      .field("handle", &self.handle)
      .finish()
  }
}

impl<W: Worker> Lease<W> {
  pub fn worker(&self) -> &W {
    &self.worker
  }

  /// Releases the worker now instead of on drop.
  ///
  /// # Errors
  /// Propagates the pool's release error.
  pub fn release(mut self) -> Result<(), PoolError> {
    match self.handle.take() {
      Some(handle) => self.pool.release(handle),
      None => Ok(()),
    }
  }
}

impl<W: Worker> Drop for Lease<W> {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      if let Err(release_error) = self.pool.release(handle) {
        error!(pool_name = %self.pool.pool_name, "Failed to release leased worker: {}", release_error);
      }
    }
  }
}
