use crate::error::{panic_message, BoxError, FlowError};
use crate::worker::{outcome, Outcome, Resolver, Worker};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

type Request<I, O> = (I, Resolver<O>);

/// A [`Worker`] backed by a dedicated Tokio task.
///
/// The task owns the handler (and therefore any state the handler captures)
/// and processes requests strictly one at a time. A panicking handler settles
/// the current request with a `WorkerFault` and the worker keeps serving.
pub struct TaskWorker<I: Send + 'static, O: Send + 'static> {
  name: Arc<String>,
  request_tx: mpsc::UnboundedSender<Request<I, O>>,
  termination_token: CancellationToken,
}

impl<I: Send + 'static, O: Send + 'static> fmt::Debug for TaskWorker<I, O> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskWorker")
      .field("name", &self.name)
      .field("terminated", &self.is_terminated())
      .finish_non_exhaustive()
  }
}

impl<I: Send + 'static, O: Send + 'static> TaskWorker<I, O> {
  /// Spawns the worker loop on `tokio_handle`.
  pub fn spawn<F, Fut>(name: &str, tokio_handle: TokioHandle, handler: F) -> Self
  where
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
  {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let termination_token = CancellationToken::new();
    let name = Arc::new(name.to_string());

    tokio_handle.spawn(
      Self::run_request_loop(name.clone(), handler, request_rx, termination_token.clone())
        .instrument(info_span!("task_worker_loop", worker = %name)),
    );

    Self {
      name,
      request_tx,
      termination_token,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_terminated(&self) -> bool {
    self.termination_token.is_cancelled()
  }

  async fn run_request_loop<F, Fut>(
    name: Arc<String>,
    mut handler: F,
    mut request_rx: mpsc::UnboundedReceiver<Request<I, O>>,
    termination_token: CancellationToken,
  ) where
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
  {
    info!(worker = %*name, "Worker loop started.");

    loop {
      let (request, resolver) = tokio::select! {
        biased;

        _ = termination_token.cancelled() => {
          info!(worker = %*name, "Termination requested. Worker loop stopping.");
          break;
        }

        next = request_rx.recv() => match next {
          Some(request) => request,
          None => {
            info!(worker = %*name, "Request channel closed. Worker loop stopping.");
            break;
          }
        }
      };

      if resolver.is_abandoned() {
        debug!(worker = %*name, "Skipping request whose outcome is no longer awaited.");
        continue;
      }

      let execution = AssertUnwindSafe(async { handler(request).await }).catch_unwind();

      tokio::select! {
        biased;

        _ = termination_token.cancelled() => {
          warn!(worker = %*name, "Worker terminated while handling a request.");
          resolver.fail("worker terminated while handling the request");
          break;
        }

        result = execution => match result {
          Ok(Ok(response)) => {
            trace!(worker = %*name, "Request handled successfully.");
            resolver.succeed(response);
          }
          Ok(Err(handler_error)) => {
            debug!(worker = %*name, "Handler reported an error: {}", handler_error);
            resolver.fail(handler_error);
          }
          Err(panic_payload) => {
            let message = panic_message(&*panic_payload);
            error!(worker = %*name, "Handler panicked: {}", message);
            resolver.fail(format!("worker panicked: {message}"));
          }
        }
      }
    }

    request_rx.close();
    let mut rejected = 0usize;
    while let Ok((_, resolver)) = request_rx.try_recv() {
      resolver.fail("worker terminated before handling the request");
      rejected += 1;
    }
    info!(worker = %*name, rejected, "Worker loop stopped.");
  }
}

impl<I: Send + 'static, O: Send + 'static> Worker for TaskWorker<I, O> {
  type Request = I;
  type Response = O;

  fn send(&self, request: I) -> Result<Outcome<O>, FlowError> {
    if self.termination_token.is_cancelled() {
      return Err(FlowError::WorkerFault(format!("worker '{}' is terminated", self.name)));
    }
    let (resolver, outcome) = outcome();
    self
      .request_tx
      .send((request, resolver))
      .map_err(|_| FlowError::WorkerFault(format!("worker '{}' is no longer accepting requests", self.name)))?;
    Ok(outcome)
  }

  fn terminate(&self) {
    if !self.termination_token.is_cancelled() {
      debug!(worker = %*self.name, "Terminating worker.");
      self.termination_token.cancel();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn doubling_worker() -> TaskWorker<u32, u32> {
    TaskWorker::spawn("doubler", TokioHandle::current(), |x: u32| async move { Ok(x * 2) })
  }

  #[tokio::test]
  async fn test_handles_requests_in_order_with_state() {
    let mut seen = 0u32;
    let worker = TaskWorker::spawn("counter", TokioHandle::current(), move |x: u32| {
      seen += 1;
      let count = seen;
      async move { Ok::<_, BoxError>((x, count)) }
    });

    assert_eq!(worker.send(10).unwrap().await, Ok((10, 1)));
    assert_eq!(worker.send(20).unwrap().await, Ok((20, 2)));
  }

  #[tokio::test]
  async fn test_handler_error_is_a_worker_fault() {
    let worker: TaskWorker<u32, u32> =
      TaskWorker::spawn("failing", TokioHandle::current(), |_| async move { Err("nope".into()) });
    assert_eq!(worker.send(1).unwrap().await, Err(FlowError::WorkerFault("nope".to_string())));
  }

  #[tokio::test]
  async fn test_handler_panic_is_caught_and_worker_survives() {
    let worker = TaskWorker::spawn("panicky", TokioHandle::current(), |x: u32| async move {
      if x == 0 {
        panic!("zero is not allowed");
      }
      Ok(x)
    });

    match worker.send(0).unwrap().await {
      Err(FlowError::WorkerFault(message)) => assert!(message.contains("zero is not allowed")),
      other => panic!("Expected WorkerFault, got {:?}", other),
    }
    assert_eq!(worker.send(5).unwrap().await, Ok(5));
  }

  #[tokio::test]
  async fn test_terminate_fails_in_flight_and_later_requests() {
    let worker: TaskWorker<u32, u32> = TaskWorker::spawn("slow", TokioHandle::current(), |x| async move {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok(x)
    });

    let in_flight = worker.send(1).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    worker.terminate();
    worker.terminate();

    assert!(matches!(in_flight.await, Err(FlowError::WorkerFault(_))));
    assert!(worker.is_terminated());
    assert!(matches!(worker.send(2), Err(FlowError::WorkerFault(_))));
  }

  #[tokio::test]
  async fn test_doubling_worker() {
    let worker = doubling_worker();
    assert_eq!(worker.send(21).unwrap().await, Ok(42));
    assert_eq!(worker.name(), "doubler");
  }
}
