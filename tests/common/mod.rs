#![allow(dead_code)]

use parking_lot::Mutex;
use pooled_flow::{
  BoxSubscriber, FlowError, Outcome, PoolConfig, ResourcePool, Subscriber, SubscriptionRef, TaskWorker, Worker,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pooled_flow=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

// --- Recording subscriber ---

#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
  Next(T),
  Error(FlowError),
  Complete,
}

type SharedSubscription = Arc<Mutex<Option<SubscriptionRef>>>;

/// Subscriber that forwards every signal to a [`RecorderHandle`].
pub struct Recorder<T> {
  events_tx: mpsc::UnboundedSender<Event<T>>,
  subscription: SharedSubscription,
  request_on_subscribe: Option<u64>,
  cancel_after: Option<usize>,
  subscribe_count: Arc<AtomicUsize>,
  received: usize,
}

pub struct RecorderHandle<T> {
  events_rx: mpsc::UnboundedReceiver<Event<T>>,
  subscription: SharedSubscription,
  subscribe_count: Arc<AtomicUsize>,
}

pub fn recorder<T: Send + 'static>() -> (Recorder<T>, RecorderHandle<T>) {
  let (events_tx, events_rx) = mpsc::unbounded_channel();
  let subscription = Arc::new(Mutex::new(None));
  let subscribe_count = Arc::new(AtomicUsize::new(0));
  (
    Recorder {
      events_tx,
      subscription: subscription.clone(),
      request_on_subscribe: None,
      cancel_after: None,
      subscribe_count: subscribe_count.clone(),
      received: 0,
    },
    RecorderHandle {
      events_rx,
      subscription,
      subscribe_count,
    },
  )
}

impl<T: Send + 'static> Recorder<T> {
  pub fn request_on_subscribe(mut self, n: u64) -> Self {
    self.request_on_subscribe = Some(n);
    self
  }

  /// Cancels from inside `on_next` once `n` items have arrived.
  pub fn cancel_after(mut self, n: usize) -> Self {
    self.cancel_after = Some(n);
    self
  }

  pub fn boxed(self) -> BoxSubscriber<T> {
    Box::new(self)
  }
}

impl<T: Send + 'static> Subscriber<T> for Recorder<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.subscribe_count.fetch_add(1, Ordering::SeqCst);
    *self.subscription.lock() = Some(subscription.clone());
    if let Some(n) = self.request_on_subscribe {
      subscription.request(n);
    }
  }

  fn on_next(&mut self, item: T) {
    let _ = self.events_tx.send(Event::Next(item));
    self.received += 1;
    if self.cancel_after == Some(self.received) {
      let subscription = self.subscription.lock().clone();
      if let Some(subscription) = subscription {
        subscription.cancel();
      }
    }
  }

  fn on_error(&mut self, error: FlowError) {
    let _ = self.events_tx.send(Event::Error(error));
  }

  fn on_complete(&mut self) {
    let _ = self.events_tx.send(Event::Complete);
  }
}

impl<T: Send + std::fmt::Debug + 'static> RecorderHandle<T> {
  pub fn subscribe_count(&self) -> usize {
    self.subscribe_count.load(Ordering::SeqCst)
  }

  async fn subscription(&self) -> SubscriptionRef {
    tokio::time::timeout(WAIT, async {
      loop {
        if let Some(subscription) = self.subscription.lock().clone() {
          return subscription;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
      }
    })
    .await
    .expect("on_subscribe was never called")
  }

  pub async fn request(&self, n: u64) {
    self.subscription().await.request(n);
  }

  pub async fn cancel(&self) {
    self.subscription().await.cancel();
  }

  /// Next signal, failing the test if none arrives in time.
  pub async fn next_event(&mut self) -> Event<T> {
    tokio::time::timeout(WAIT, self.events_rx.recv())
      .await
      .expect("timed out waiting for a signal")
      .expect("recorder dropped without a signal")
  }

  pub async fn next_events(&mut self, count: usize) -> Vec<Event<T>> {
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
      events.push(self.next_event().await);
    }
    events
  }

  /// Signals up to and including the terminal one.
  pub async fn until_terminal(&mut self) -> Vec<Event<T>> {
    let mut events = Vec::new();
    loop {
      let event = self.next_event().await;
      let terminal = !matches!(event, Event::Next(_));
      events.push(event);
      if terminal {
        return events;
      }
    }
  }

  /// Asserts that nothing is delivered for `window`.
  pub async fn expect_quiet(&mut self, window: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(window, self.events_rx.recv()).await {
      panic!("expected no signal, got {:?}", event);
    }
  }
}

// --- Workers ---

/// Records concurrency and the order in which items reached the workers.
#[derive(Debug, Default)]
pub struct WorkLog {
  active: AtomicUsize,
  max_active: AtomicUsize,
  started: Mutex<Vec<u64>>,
}

impl WorkLog {
  pub fn max_active(&self) -> usize {
    self.max_active.load(Ordering::SeqCst)
  }

  pub fn active(&self) -> usize {
    self.active.load(Ordering::SeqCst)
  }

  pub fn started(&self) -> Vec<u64> {
    self.started.lock().clone()
  }
}

pub type Doubler = TaskWorker<u64, u64>;

/// Pool of workers that double their input after `delay(input)`, failing on
/// `fail_on` if given.
pub fn doubling_pool(
  name: &str,
  size: usize,
  work_log: Arc<WorkLog>,
  delay: fn(u64) -> Duration,
  fail_on: Option<u64>,
) -> Arc<ResourcePool<Doubler>> {
  ResourcePool::new(PoolConfig::new(name, size), |index| {
    let work_log = work_log.clone();
    TaskWorker::spawn(&format!("{name}-{index}"), Handle::current(), move |x: u64| {
      let work_log = work_log.clone();
      async move {
        work_log.started.lock().push(x);
        let now_active = work_log.active.fetch_add(1, Ordering::SeqCst) + 1;
        work_log.max_active.fetch_max(now_active, Ordering::SeqCst);
        tokio::time::sleep(delay(x)).await;
        work_log.active.fetch_sub(1, Ordering::SeqCst);
        if fail_on == Some(x) {
          return Err(format!("cannot double {x}").into());
        }
        Ok(x * 2)
      }
    })
  })
  .expect("pool creation failed")
}

/// Synchronous worker that echoes its input and counts terminations.
#[derive(Debug, Default)]
pub struct EchoWorker {
  pub terminations: Arc<AtomicUsize>,
}

impl EchoWorker {
  pub fn is_terminated(&self) -> bool {
    self.terminations.load(Ordering::SeqCst) > 0
  }
}

impl Worker for EchoWorker {
  type Request = u32;
  type Response = u32;

  fn send(&self, request: u32) -> Result<Outcome<u32>, FlowError> {
    if self.is_terminated() {
      return Err(FlowError::WorkerFault("terminated".to_string()));
    }
    Ok(Outcome::ready(request))
  }

  fn terminate(&self) {
    self.terminations.fetch_add(1, Ordering::SeqCst);
  }
}

pub fn echo_pool(name: &str, size: usize) -> Arc<ResourcePool<EchoWorker>> {
  echo_pool_tracked(name, size).0
}

/// Like [`echo_pool`], also returning each worker's termination counter by index.
pub fn echo_pool_tracked(name: &str, size: usize) -> (Arc<ResourcePool<EchoWorker>>, Vec<Arc<AtomicUsize>>) {
  let counters: Vec<Arc<AtomicUsize>> = (0..size).map(|_| Arc::new(AtomicUsize::new(0))).collect();
  let pool = ResourcePool::new(PoolConfig::new(name, size), |index| EchoWorker {
    terminations: counters[index].clone(),
  })
  .expect("pool creation failed");
  (pool, counters)
}

pub fn is_terminated(counter: &AtomicUsize) -> bool {
  counter.load(Ordering::SeqCst) > 0
}

/// Polls `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
  let deadline = tokio::time::Instant::now() + WAIT;
  while !condition() {
    if tokio::time::Instant::now() >= deadline {
      panic!("condition never held: {what}");
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}
