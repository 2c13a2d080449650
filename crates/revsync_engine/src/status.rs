//! Observable replicator state.

use crate::error::ReplicationError;

/// Lifecycle of a replicator. Instances are single-use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Created, not started.
    NotStarted,
    /// Replicating.
    Running,
    /// Finished or stopped.
    Stopped,
}

impl ReplicatorState {
    /// Returns true while running.
    pub fn is_running(&self) -> bool {
        matches!(self, ReplicatorState::Running)
    }
}

/// Event published on the replicator's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// Progress counters changed.
    Progress {
        /// Changes handled so far.
        processed: u64,
        /// Changes known about.
        total: u64,
    },
    /// State, activity or error changed.
    Status {
        /// Lifecycle state.
        state: ReplicatorState,
        /// Whether the inbox has work.
        active: bool,
        /// Last recorded error.
        error: Option<ReplicationError>,
    },
}

/// Point-in-time view of a replicator.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorStatus {
    /// Lifecycle state.
    pub state: ReplicatorState,
    /// Whether the inbox has work.
    pub active: bool,
    /// Changes handled so far.
    pub changes_processed: u64,
    /// Changes known about.
    pub changes_total: u64,
    /// Checkpointed sequence.
    pub last_sequence: Option<String>,
    /// Last recorded error.
    pub last_error: Option<ReplicationError>,
}
