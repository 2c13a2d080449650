//! Configuration for the replication engine.

use crate::store::RevisionFilter;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Which way revisions flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationDirection {
    /// Local store to remote.
    Push,
    /// Remote to local store.
    Pull,
}

impl ReplicationDirection {
    /// Returns true for [`ReplicationDirection::Push`].
    pub fn is_push(self) -> bool {
        matches!(self, ReplicationDirection::Push)
    }
}

/// Configuration for a replicator.
#[derive(Clone)]
pub struct ReplicatorConfig {
    /// Remote database URL. Userinfo is used for Basic auth.
    pub remote_url: String,
    /// Replication direction.
    pub direction: ReplicationDirection,
    /// Keep running and replicate new changes as they happen.
    pub continuous: bool,
    /// Create the remote database if it does not exist (push only).
    pub create_target: bool,
    /// Name of a server-side `_changes` filter (pull only).
    pub filter_name: Option<String>,
    /// Parameters passed to the server-side filter.
    pub filter_params: BTreeMap<String, String>,
    /// Local predicate selecting revisions to push.
    pub push_filter: Option<RevisionFilter>,
    /// Inbox batch size.
    pub inbox_capacity: usize,
    /// Inbox quiescence delay.
    pub inbox_delay: Duration,
    /// Batch size for inserting downloaded revisions.
    pub download_capacity: usize,
    /// Delay before inserting a partial batch of downloads.
    pub download_delay: Duration,
    /// Minimum spacing between checkpoint saves.
    pub checkpoint_save_delay: Duration,
    /// Maximum concurrent revision GETs.
    pub max_open_connections: usize,
    /// Pending pulls above which the change feed is throttled.
    pub pull_backlog_limit: usize,
    /// `heartbeat` parameter of the change feed.
    pub heartbeat: Duration,
    /// Retry policy for remote requests.
    pub retry: RetryConfig,
}

impl ReplicatorConfig {
    /// Creates a configuration with default tuning.
    pub fn new(remote_url: impl Into<String>, direction: ReplicationDirection) -> Self {
        Self {
            remote_url: remote_url.into(),
            direction,
            continuous: false,
            create_target: false,
            filter_name: None,
            filter_params: BTreeMap::new(),
            push_filter: None,
            inbox_capacity: 100,
            inbox_delay: Duration::from_millis(500),
            download_capacity: 200,
            download_delay: Duration::from_secs(1),
            checkpoint_save_delay: Duration::from_secs(2),
            max_open_connections: 16,
            pull_backlog_limit: 1000,
            heartbeat: Duration::from_millis(300_000),
            retry: RetryConfig::default(),
        }
    }

    /// Creates a push configuration.
    pub fn push(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, ReplicationDirection::Push)
    }

    /// Creates a pull configuration.
    pub fn pull(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, ReplicationDirection::Pull)
    }

    /// Sets continuous mode.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Creates the remote database before pushing.
    pub fn with_create_target(mut self, create_target: bool) -> Self {
        self.create_target = create_target;
        self
    }

    /// Sets a server-side change filter and its parameters.
    pub fn with_filter(
        mut self,
        name: impl Into<String>,
        params: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.filter_name = Some(name.into());
        self.filter_params = params.into_iter().collect();
        self
    }

    /// Sets a local push filter.
    pub fn with_push_filter(mut self, filter: RevisionFilter) -> Self {
        self.push_filter = Some(filter);
        self
    }

    /// Sets the inbox batch size and delay.
    pub fn with_inbox(mut self, capacity: usize, delay: Duration) -> Self {
        self.inbox_capacity = capacity.max(1);
        self.inbox_delay = delay;
        self
    }

    /// Sets the download batch size and delay.
    pub fn with_downloads(mut self, capacity: usize, delay: Duration) -> Self {
        self.download_capacity = capacity.max(1);
        self.download_delay = delay;
        self
    }

    /// Sets the checkpoint save delay.
    pub fn with_checkpoint_save_delay(mut self, delay: Duration) -> Self {
        self.checkpoint_save_delay = delay;
        self
    }

    /// Sets the maximum number of concurrent revision GETs.
    pub fn with_max_open_connections(mut self, max: usize) -> Self {
        self.max_open_connections = max.max(1);
        self
    }

    /// Sets the pending-pull backlog limit.
    pub fn with_pull_backlog_limit(mut self, limit: usize) -> Self {
        self.pull_backlog_limit = limit;
        self
    }

    /// Sets the change feed heartbeat.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for ReplicatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfig")
            .field("direction", &self.direction)
            .field("continuous", &self.continuous)
            .field("create_target", &self.create_target)
            .field("filter_name", &self.filter_name)
            .field("filter_params", &self.filter_params)
            .field("push_filter", &self.push_filter.is_some())
            .field("inbox_capacity", &self.inbox_capacity)
            .field("inbox_delay", &self.inbox_delay)
            .field("download_capacity", &self.download_capacity)
            .field("download_delay", &self.download_delay)
            .field("checkpoint_save_delay", &self.checkpoint_save_delay)
            .field("max_open_connections", &self.max_open_connections)
            .field("pull_backlog_limit", &self.pull_backlog_limit)
            .field("heartbeat", &self.heartbeat)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
