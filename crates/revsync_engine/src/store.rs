//! The local document store consumed by the replicator.
//!
//! The replicator never touches storage directly. Everything it needs from
//! the local database goes through [`DocumentStore`], which an embedding
//! application implements over its own revision-tree storage.

use revsync_protocol::Revision;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Predicate selecting which local revisions are pushed.
pub type RevisionFilter = Arc<dyn Fn(&Revision) -> bool + Send + Sync>;

/// Status returned by a store operation that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Local validation rejected the revision.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The document or revision does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The revision conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The input was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Any other storage failure.
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Maps the error to an HTTP-style status code.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::Forbidden(_) => 403,
            StoreError::NotFound(_) => 404,
            StoreError::Conflict(_) => 409,
            StoreError::BadRequest(_) => 400,
            StoreError::Internal(_) => 500,
        }
    }
}

/// What [`DocumentStore::load_revision_body`] should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentOptions {
    /// Inline attachment bodies.
    pub include_attachments: bool,
}

/// A change notification from the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseChange {
    /// The new revision, with its local sequence.
    pub revision: Revision,
    /// URL of the remote the revision was replicated from, if any.
    pub source: Option<String>,
}

/// Local revision-tree store.
///
/// Implementations must be safe to call from several tasks at once. The
/// replicator never holds one of its own locks while calling into the store.
pub trait DocumentStore: Send + Sync {
    /// Returns the store's private UUID, used to key checkpoints.
    fn private_uuid(&self) -> String;

    /// Returns current leaf revisions changed after `since`, in sequence order.
    fn changes_since(
        &self,
        since: u64,
        filter: Option<&RevisionFilter>,
    ) -> StoreResult<Vec<Revision>>;

    /// Returns the subset of `revisions` that is not stored locally.
    fn find_missing_revisions(&self, revisions: &[Revision]) -> StoreResult<Vec<Revision>>;

    /// Returns the ids of locally stored revisions of a document.
    ///
    /// Sent as `atts_since` so the remote can skip attachments we already have.
    fn known_revision_ids(&self, doc_id: &str) -> Vec<String>;

    /// Inserts a revision with an explicit history (newest first).
    ///
    /// `source` is the remote URL the revision came from.
    fn force_insert(
        &self,
        revision: &Revision,
        history: &[String],
        source: Option<&str>,
    ) -> StoreResult<()>;

    /// Loads the body of `revision` in place.
    fn load_revision_body(
        &self,
        revision: &mut Revision,
        options: ContentOptions,
    ) -> StoreResult<()>;

    /// Returns the revision's history, newest first.
    fn revision_history(&self, revision: &Revision) -> StoreResult<Vec<String>>;

    /// Returns the checkpointed sequence stored for a remote and direction.
    fn last_sequence_with_remote(&self, remote_url: &str, is_push: bool) -> Option<String>;

    /// Stores the checkpointed sequence for a remote and direction.
    fn set_last_sequence(
        &self,
        sequence: &str,
        remote_url: &str,
        is_push: bool,
    ) -> StoreResult<()>;

    /// Runs `body` in a transaction, committing if it returns true.
    fn transaction(&self, body: &mut dyn FnMut() -> bool) -> StoreResult<bool>;

    /// Subscribes to change notifications. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> UnboundedReceiver<DatabaseChange>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(StoreError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(StoreError::NotFound("x".into()).status_code(), 404);
        assert_eq!(StoreError::Conflict("x".into()).status_code(), 409);
        assert_eq!(StoreError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(StoreError::Internal("x".into()).status_code(), 500);
    }
}
