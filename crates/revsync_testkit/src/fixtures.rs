//! Test fixtures for async replication tests.

use crate::memory_store::MemoryStore;
use crate::mock_remote::MockRemote;
use revsync_engine::{Replicator, ReplicatorConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Installs a tracing subscriber controlled by `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
///
/// Returns whether the condition was met.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Awaits `future`, panicking if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out after {:?}", timeout),
    }
}

/// Shortens the replicator's timers so tests finish quickly.
pub fn fast_config(config: ReplicatorConfig) -> ReplicatorConfig {
    config
        .with_inbox(100, Duration::from_millis(10))
        .with_downloads(200, Duration::from_millis(10))
        .with_checkpoint_save_delay(Duration::from_millis(20))
}

/// A replicator wired to a [`MemoryStore`] and a [`MockRemote`].
pub struct TestReplication {
    /// The local store.
    pub store: Arc<MemoryStore>,
    /// The remote database.
    pub remote: Arc<MockRemote>,
    /// The replicator.
    pub replicator: Replicator,
}

impl TestReplication {
    /// Builds a replicator over existing fixtures.
    pub fn new(store: Arc<MemoryStore>, remote: Arc<MockRemote>, config: ReplicatorConfig) -> Self {
        let replicator = Replicator::new(fast_config(config), store.clone(), remote.clone())
            .expect("replicator construction");
        Self {
            store,
            remote,
            replicator,
        }
    }

    /// Starts the replicator and waits until it stops.
    pub async fn run_to_completion(&self) {
        self.replicator.start();
        within(Duration::from_secs(10), self.replicator.wait_until_stopped()).await;
    }
}
