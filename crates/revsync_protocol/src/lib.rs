//! # revsync Protocol
//!
//! Replication wire types for revsync.
//!
//! This crate provides:
//! - `Revision` and document id validation
//! - Revision history encoding (`_revisions`)
//! - `_changes` feed entries and line classification
//! - Checkpoint document ids and bodies (`_local/<id>`)
//! - `_revs_diff` and `_bulk_docs` request/response shapes
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes;
mod checkpoint;
mod error;
mod history;
mod messages;
mod revision;

pub use changes::{classify_line, sequence_token, ChangeEntry, ChangesFeedMode, FeedLine};
pub use checkpoint::{checkpoint_doc_id, Checkpoint, LOCAL_DOC_PREFIX};
pub use error::{ProtocolError, ProtocolResult};
pub use history::{parse_revision_history, RevisionHistory};
pub use messages::{
    parse_changes_response, BulkDocsRequest, BulkDocsResult, PutResponse, RevsDiffEntry,
    RevsDiffRequest, RevsDiffResponse,
};
pub use revision::{is_valid_document_id, parse_rev_id, Body, Revision};
