use pooled_flow::{
  collect, PoolConfig, PublisherExt, ResourcePool, ShutdownMode, SourcePublisher, TaskWorker, UNBOUNDED,
};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Ordered Doubling Example ---");

  let config = PoolConfig::from_available_parallelism("doubling_pool");
  info!("Starting {} workers.", config.size);

  let pool = ResourcePool::new(config, |index| {
    let mut handled = 0usize;
    TaskWorker::spawn(&format!("doubler-{index}"), Handle::current(), move |x: u64| {
      handled += 1;
      info!("Worker {} handling {} (request #{} for this worker)", index, x, handled);
      async move {
        // Later items finish first, results still come out in input order.
        tokio::time::sleep(Duration::from_millis(400u64.saturating_sub(x * 30))).await;
        Ok(x * 2)
      }
    })
  })
  .expect("Pool creation failed");

  let watcher = pool.watch_idle_count(|idle| info!("Idle workers: {}", idle));

  let pipeline = SourcePublisher::from_iter(1..=10u64)
    .do_on_next(|x: &u64| {
      info!("Dispatching {}", x);
      Ok::<_, std::convert::Infallible>(())
    })
    .map_with_workers(pool.clone());

  match collect(&pipeline, UNBOUNDED).await {
    Ok(doubled) => info!("Results in order: {:?}", doubled),
    Err(e) => tracing::error!("Pipeline failed: {}", e),
  }

  pool.unwatch_idle_count(watcher);
  info!("Shutting down pool.");
  pool
    .shutdown(ShutdownMode::Graceful)
    .expect("Pool shutdown failed")
    .await;
  info!("Pool shutdown complete.");
  info!("--- Ordered Doubling Example End ---");
}
