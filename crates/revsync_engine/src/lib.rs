//! # revsync Engine
//!
//! Pull/push replication between a local revision-tree store and a remote
//! CouchDB-compatible database.
//!
//! This crate provides:
//! - Replicator state machine with remote checkpoints
//! - Batcher for size- and time-triggered batches
//! - SequenceMap for gap-aware checkpointing of pulls
//! - ChangeTracker for the remote `_changes` feed, with backoff
//! - Puller and pusher protocols
//! - Remote requests with retry
//!
//! ## Architecture
//!
//! A replicator runs one direction against one remote:
//! 1. Read the remote `_local` checkpoint and compare it with the local one
//! 2. Feed changes (remote `_changes` or local change list) into the inbox
//! 3. Drop what the other side already has (`_revs_diff` or a local lookup)
//! 4. Transfer the rest (`_bulk_docs` upload or concurrent GETs)
//! 5. Advance and save the checkpoint
//!
//! ## Key Invariants
//!
//! - A saved checkpoint never passes an unfinished revision
//! - Replicated revisions keep their revision ids (`new_edits: false`)
//! - A one-shot replicator stops once no work is outstanding
//! - Credentials never appear in logs or checkpoint ids

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batcher;
mod change_tracker;
mod config;
mod error;
mod http;
mod puller;
mod pusher;
mod remote;
mod replicator;
mod sequence_map;
mod status;
mod store;

pub use batcher::{BatchProcessor, Batcher};
pub use change_tracker::{
    ChangeTracker, ChangeTrackerBackoff, ChangeTrackerClient, ChangeTrackerConfig,
};
pub use config::{ReplicationDirection, ReplicatorConfig, RetryConfig};
pub use error::{ReplicationError, ReplicationResult};
pub use http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestClient, StreamingResponse, Url,
};
pub use remote::RemoteDatabase;
pub use replicator::Replicator;
pub use sequence_map::SequenceMap;
pub use status::{ReplicationEvent, ReplicatorState, ReplicatorStatus};
pub use store::{
    ContentOptions, DatabaseChange, DocumentStore, RevisionFilter, StoreError, StoreResult,
};
