use super::{Publisher, Subscriber, SubscriptionRef, UNBOUNDED};
use crate::error::FlowError;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

/// Terminal subscriber that hands every item to a callback.
struct Drain<F> {
  on_item: F,
  batch: u64,
  subscription: Option<SubscriptionRef>,
  done_tx: Option<oneshot::Sender<Result<(), FlowError>>>,
}

impl<F> Drain<F> {
  fn finish(&mut self, result: Result<(), FlowError>) {
    self.subscription = None;
    if let Some(done_tx) = self.done_tx.take() {
      let _ = done_tx.send(result);
    }
  }
}

impl<T, F> Subscriber<T> for Drain<F>
where
  T: Send + 'static,
  F: FnMut(T) + Send + 'static,
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    subscription.request(self.batch);
    self.subscription = Some(subscription);
  }

  fn on_next(&mut self, item: T) {
    (self.on_item)(item);
    // Keep `batch` items outstanding.
    if self.batch != UNBOUNDED {
      if let Some(subscription) = &self.subscription {
        subscription.request(1);
      }
    }
  }

  fn on_error(&mut self, error: FlowError) {
    self.finish(Err(error));
  }

  fn on_complete(&mut self) {
    self.finish(Ok(()));
  }
}

async fn drain<T, P, F>(publisher: &P, batch: u64, on_item: F) -> Result<(), FlowError>
where
  T: Send + 'static,
  P: Publisher<T> + ?Sized,
  F: FnMut(T) + Send + 'static,
{
  let (done_tx, done_rx) = oneshot::channel();
  publisher.subscribe(Box::new(Drain {
    on_item,
    batch,
    subscription: None,
    done_tx: Some(done_tx),
  }));
  match done_rx.await {
    Ok(result) => result,
    Err(_) => {
      warn!("Publisher dropped the subscriber without a terminal signal.");
      Err(FlowError::ProtocolFault(
        "publisher dropped the subscriber without a terminal signal".to_string(),
      ))
    }
  }
}

/// Subscribes to `publisher`, requesting one item at a time, and calls
/// `on_item` for each. Resolves with the terminal signal.
pub async fn for_each<T, P, F>(publisher: &P, on_item: F) -> Result<(), FlowError>
where
  T: Send + 'static,
  P: Publisher<T> + ?Sized,
  F: FnMut(T) + Send + 'static,
{
  drain(publisher, 1, on_item).await
}

/// Subscribes to `publisher` and gathers every item, keeping `prefetch`
/// items requested ahead ([`UNBOUNDED`] requests everything at once).
///
/// # Errors
/// Returns the error the flow terminated with. A `prefetch` of zero is an
/// invalid request and fails with `FlowError::InvalidDemand`.
pub async fn collect<T, P>(publisher: &P, prefetch: u64) -> Result<Vec<T>, FlowError>
where
  T: Send + 'static,
  P: Publisher<T> + ?Sized,
{
  let items = Arc::new(Mutex::new(Vec::new()));
  let sink = items.clone();
  drain(publisher, prefetch, move |item| sink.lock().push(item)).await?;
  let collected = std::mem::take(&mut *items.lock());
  Ok(collected)
}
