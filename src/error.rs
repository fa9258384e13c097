use thiserror::Error;

/// Boxed error returned by user callbacks (tap observers, worker handlers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the [`ResourcePool`](crate::ResourcePool).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Invalid pool configuration: {0}")]
  InvalidConfiguration(String),

  #[error("Worker is not from this pool")]
  NotOwned,

  #[error("Worker is already idle")]
  AlreadyIdle,

  #[error("Pool is shutting down or already shut down, cannot hand out workers")]
  PoolShuttingDown,

  #[error("Shutdown has already been requested for this pool")]
  ShutdownAlreadyRequested,
}

/// Errors delivered through the `on_error` channel of a subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
  #[error("Non-positive request is not allowed (got {0})")]
  InvalidDemand(u64),

  #[error("Worker fault: {0}")]
  WorkerFault(String),

  #[error("Subscriber callback failed: {0}")]
  ProtocolFault(String),

  #[error("Source sequence failed: {0}")]
  SourceFault(String),

  #[error(transparent)]
  Pool(#[from] PoolError),
}

/// Extracts a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
