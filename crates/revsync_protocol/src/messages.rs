//! Request and response bodies of the replication endpoints.

use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `POST /_revs_diff` request: `{docId: [revId, ...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffRequest(pub BTreeMap<String, Vec<String>>);

impl RevsDiffRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a revision to ask about.
    pub fn add(&mut self, doc_id: impl Into<String>, rev_id: impl Into<String>) {
        self.0.entry(doc_id.into()).or_default().push(rev_id.into());
    }

    /// Returns true if nothing was added.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-document entry of a `_revs_diff` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    /// Revision ids the remote does not have.
    #[serde(default)]
    pub missing: Vec<String>,
    /// Revisions the remote has that may be ancestors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_ancestors: Option<Vec<String>>,
}

/// `POST /_revs_diff` response: `{docId: {"missing": [revId, ...]}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffResponse(pub BTreeMap<String, RevsDiffEntry>);

impl RevsDiffResponse {
    /// Parses a response body.
    pub fn from_slice(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Returns true if `(doc_id, rev_id)` was reported missing.
    pub fn is_missing(&self, doc_id: &str, rev_id: &str) -> bool {
        self.0
            .get(doc_id)
            .is_some_and(|entry| entry.missing.iter().any(|r| r == rev_id))
    }

    /// Returns true if nothing is missing.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|entry| entry.missing.is_empty())
    }
}

/// `POST /_bulk_docs` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    /// Documents to store, each with `_id`, `_rev` and usually `_revisions`.
    pub docs: Vec<Value>,
    /// `false` makes the server keep the given revision ids.
    pub new_edits: bool,
}

impl BulkDocsRequest {
    /// Creates a replication upload (`new_edits: false`).
    pub fn replicated(docs: Vec<Value>) -> Self {
        Self {
            docs,
            new_edits: false,
        }
    }
}

/// Per-document result of `_bulk_docs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDocsResult {
    /// Document id.
    pub id: String,
    /// Stored revision, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Error kind, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error detail, on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Response to a document PUT: `{"ok": true, "id": ..., "rev": ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    /// Whether the write succeeded.
    #[serde(default)]
    pub ok: bool,
    /// Document id.
    #[serde(default)]
    pub id: Option<String>,
    /// New revision id.
    #[serde(default)]
    pub rev: Option<String>,
}

/// Parses a `feed=longpoll` response into its `results` entries and `last_seq`.
pub fn parse_changes_response(bytes: &[u8]) -> ProtocolResult<(Vec<Value>, Option<Value>)> {
    #[derive(Deserialize)]
    struct ChangesResponse {
        results: Vec<Value>,
        #[serde(default)]
        last_seq: Option<Value>,
    }

    let response: ChangesResponse = serde_json::from_slice(bytes)?;
    Ok((response.results, response.last_seq))
}
