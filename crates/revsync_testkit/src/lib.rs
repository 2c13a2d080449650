//! # revsync Testkit
//!
//! Test utilities for revsync.
//!
//! This crate provides:
//! - An in-memory revision-tree store implementing `DocumentStore`
//! - An in-memory CouchDB-style remote implementing `HttpClient`
//! - Revision trees shared by both
//! - Tracing setup and polling helpers for async tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use revsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes_a_document() {
//!     let store = MemoryStore::new();
//!     store.put_revision("doc1", "1-a", json!({"n": 1}));
//!     let remote = MockRemote::new();
//!     let replicator = Replicator::new(
//!         ReplicatorConfig::push(MockRemote::URL),
//!         store.clone(),
//!         remote.clone(),
//!     )?;
//!     replicator.start();
//!     replicator.wait_until_stopped().await;
//!     assert!(remote.has_revision("doc1", "1-a"));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod memory_store;
pub mod mock_remote;
pub mod rev_tree;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::memory_store::*;
    pub use crate::mock_remote::*;
    pub use crate::rev_tree::*;
}

pub use fixtures::*;
pub use memory_store::*;
pub use mock_remote::*;
pub use rev_tree::*;
