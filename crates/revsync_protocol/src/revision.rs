//! Document revisions.

use serde_json::{Map, Value};

/// JSON object body of a document revision.
pub type Body = Map<String, Value>;

/// A single revision of a document.
///
/// Revisions pulled from a remote carry the `_changes` sequence token they
/// arrived with in `remote_sequence`; local revisions leave it empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Revision {
    /// Document id.
    pub doc_id: String,
    /// Revision id (`<generation>-<suffix>`).
    pub rev_id: String,
    /// Whether this revision is a deletion tombstone.
    pub deleted: bool,
    /// Local sequence number, or the fake sequence while being pulled.
    pub sequence: u64,
    /// Document properties, if loaded.
    pub body: Option<Body>,
    /// Opaque sequence token from the remote change feed.
    pub remote_sequence: Option<String>,
}

impl Revision {
    /// Creates a revision without a body.
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>, deleted: bool) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            deleted,
            ..Self::default()
        }
    }

    /// Creates a revision announced by a remote change feed.
    pub fn pulled(
        doc_id: impl Into<String>,
        rev_id: impl Into<String>,
        deleted: bool,
        remote_sequence: impl Into<String>,
    ) -> Self {
        Self {
            remote_sequence: Some(remote_sequence.into()),
            ..Self::new(doc_id, rev_id, deleted)
        }
    }

    /// Builds a revision from fetched document properties (`_id`, `_rev`, `_deleted`).
    pub fn from_properties(properties: Body) -> Option<Self> {
        let doc_id = properties.get("_id")?.as_str()?.to_string();
        let rev_id = properties.get("_rev")?.as_str()?.to_string();
        let deleted = properties
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Some(Self {
            body: Some(properties),
            ..Self::new(doc_id, rev_id, deleted)
        })
    }

    /// Sets the local sequence.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns the revision generation, if the id is well formed.
    pub fn generation(&self) -> Option<u64> {
        parse_rev_id(&self.rev_id).map(|(generation, _)| generation)
    }

    /// Returns the minimal tombstone body used when uploading a deletion.
    pub fn tombstone_body(&self) -> Body {
        let mut body = Map::new();
        body.insert("_id".into(), Value::String(self.doc_id.clone()));
        body.insert("_rev".into(), Value::String(self.rev_id.clone()));
        body.insert("_deleted".into(), Value::Bool(true));
        body
    }

    /// Returns the body with `_id`, `_rev` and (for tombstones) `_deleted` filled in.
    pub fn properties(&self) -> Body {
        let mut body = self.body.clone().unwrap_or_default();
        body.insert("_id".into(), Value::String(self.doc_id.clone()));
        body.insert("_rev".into(), Value::String(self.rev_id.clone()));
        if self.deleted {
            body.insert("_deleted".into(), Value::Bool(true));
        }
        body
    }
}

/// Splits a revision id into its generation and suffix.
pub fn parse_rev_id(rev_id: &str) -> Option<(u64, &str)> {
    let (generation, suffix) = rev_id.split_once('-')?;
    let generation: u64 = generation.parse().ok()?;
    if generation == 0 || suffix.is_empty() {
        return None;
    }
    Some((generation, suffix))
}

/// Returns true if `doc_id` may be replicated.
///
/// Ids starting with `_` are reserved except for design documents.
pub fn is_valid_document_id(doc_id: &str) -> bool {
    if doc_id.is_empty() {
        return false;
    }
    if doc_id.starts_with('_') {
        return doc_id.starts_with("_design/");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_id_validation() {
        assert!(is_valid_document_id("doc1"));
        assert!(is_valid_document_id("_design/views"));
        assert!(!is_valid_document_id(""));
        assert!(!is_valid_document_id("_local/abc"));
        assert!(!is_valid_document_id("_private"));
    }

    #[test]
    fn rev_id_parsing() {
        assert_eq!(parse_rev_id("3-abc"), Some((3, "abc")));
        assert_eq!(parse_rev_id("12-a-b"), Some((12, "a-b")));
        assert_eq!(parse_rev_id("0-abc"), None);
        assert_eq!(parse_rev_id("x-abc"), None);
        assert_eq!(parse_rev_id("3-"), None);
        assert_eq!(parse_rev_id("abc"), None);
    }

    #[test]
    fn revision_from_properties() {
        let props = json!({"_id": "doc1", "_rev": "2-b", "_deleted": true, "n": 1});
        let rev = Revision::from_properties(props.as_object().unwrap().clone()).unwrap();
        assert_eq!(rev.doc_id, "doc1");
        assert_eq!(rev.rev_id, "2-b");
        assert!(rev.deleted);
        assert_eq!(rev.generation(), Some(2));
        assert_eq!(rev.body.unwrap()["n"], json!(1));

        let missing_rev = json!({"_id": "doc1"});
        assert!(Revision::from_properties(missing_rev.as_object().unwrap().clone()).is_none());
    }

    #[test]
    fn tombstone_body_is_minimal() {
        let rev = Revision::new("doc1", "3-c", true);
        let body = rev.tombstone_body();
        assert_eq!(Value::Object(body), json!({"_id": "doc1", "_rev": "3-c", "_deleted": true}));
    }

    #[test]
    fn properties_fill_in_metadata() {
        let rev = Revision::new("doc1", "1-a", false)
            .with_body(json!({"title": "x"}).as_object().unwrap().clone());
        let props = rev.properties();
        assert_eq!(props["_id"], json!("doc1"));
        assert_eq!(props["_rev"], json!("1-a"));
        assert_eq!(props["title"], json!("x"));
        assert!(!props.contains_key("_deleted"));
    }
}
