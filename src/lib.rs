//! A Tokio-based pool of stateful workers driven by a pull-based stream
//! protocol, with an order-preserving concurrent map between the two.
//!
//! Subscribing to a publisher and spawning a [`TaskWorker`] both spawn Tokio
//! tasks, so they must happen inside a Tokio runtime.

mod error;
mod flow;
mod inflight;
mod map_with_workers;
mod notifier;
mod pool;
mod task_worker;
mod worker;

pub use error::{BoxError, FlowError, PoolError};
pub use flow::{
  collect, for_each, BoxSubscriber, OnNext, Publisher, PublisherExt, SafeSubscriber, SourcePublisher, SourceStream,
  Subscriber, Subscription, SubscriptionRef, Tap, TapObserver, UNBOUNDED,
};
pub use map_with_workers::MapWithWorkers;
pub use notifier::{IdleCountStream, ObserverId};
pub use pool::{Lease, PoolConfig, ResourcePool, Shutdown, ShutdownMode, WorkerHandle};
pub use task_worker::TaskWorker;
pub use worker::{outcome, Outcome, Resolver, Worker};
