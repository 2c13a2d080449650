//! Replication checkpoint documents.
//!
//! A checkpoint lives on the remote as `_local/<id>`, where `id` is derived
//! from the local database, the remote URL and the replication direction.

use crate::changes::sequence_token;
use crate::revision::Body;
use serde_json::Value;
use sha1::{Digest, Sha1};

/// Path prefix of non-replicated local documents.
pub const LOCAL_DOC_PREFIX: &str = "_local";

/// Computes the checkpoint document id.
///
/// Lowercase hex SHA-1 of `"<private_uuid>\n<remote_url>\n<1|0>"`.
pub fn checkpoint_doc_id(private_uuid: &str, remote_url: &str, is_push: bool) -> String {
    let input = format!(
        "{}\n{}\n{}",
        private_uuid,
        remote_url,
        if is_push { "1" } else { "0" }
    );
    hex::encode(Sha1::digest(input.as_bytes()))
}

/// Body of a remote checkpoint document.
///
/// Unknown fields written by other replicators are preserved across saves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    body: Body,
}

impl Checkpoint {
    /// Wraps a fetched checkpoint body.
    pub fn from_body(body: Body) -> Self {
        Self { body }
    }

    /// Returns the recorded `lastSequence`, if any.
    pub fn last_sequence(&self) -> Option<String> {
        self.body
            .get("lastSequence")
            .filter(|seq| !seq.is_null())
            .map(sequence_token)
    }

    /// Returns the remote revision of the checkpoint document.
    pub fn rev(&self) -> Option<&str> {
        self.body.get("_rev").and_then(Value::as_str)
    }

    /// Returns the body to PUT for a new `lastSequence`.
    pub fn updated_body(&self, last_sequence: &str) -> Body {
        let mut body = self.body.clone();
        body.insert(
            "lastSequence".into(),
            Value::String(last_sequence.to_string()),
        );
        body
    }

    /// Records a successful save: the PUT body plus the new remote `_rev`.
    pub fn saved(mut body: Body, rev: Option<&str>) -> Self {
        if let Some(rev) = rev {
            body.insert("_rev".into(), Value::String(rev.to_string()));
        }
        Self { body }
    }

    /// Returns the raw body.
    pub fn body(&self) -> &Body {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn doc_id_is_deterministic() {
        let a = checkpoint_doc_id("uuid-1", "http://host/db", true);
        let b = checkpoint_doc_id("uuid-1", "http://host/db", true);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn doc_id_depends_on_direction() {
        let push = checkpoint_doc_id("uuid-1", "http://host/db", true);
        let pull = checkpoint_doc_id("uuid-1", "http://host/db", false);
        assert_ne!(push, pull);
    }

    #[test]
    fn doc_id_known_value() {
        // sha1("\n\n0")
        assert_eq!(
            checkpoint_doc_id("", "", false),
            hex::encode(Sha1::digest(b"\n\n0"))
        );
    }

    #[test]
    fn updated_body_merges_fields() {
        let fetched = json!({"_id": "_local/x", "_rev": "0-1", "lastSequence": "4", "extra": true});
        let checkpoint = Checkpoint::from_body(fetched.as_object().unwrap().clone());
        assert_eq!(checkpoint.last_sequence().as_deref(), Some("4"));
        assert_eq!(checkpoint.rev(), Some("0-1"));

        let body = checkpoint.updated_body("9");
        assert_eq!(body["lastSequence"], json!("9"));
        assert_eq!(body["_rev"], json!("0-1"));
        assert_eq!(body["extra"], json!(true));

        let saved = Checkpoint::saved(body, Some("0-2"));
        assert_eq!(saved.rev(), Some("0-2"));
        assert_eq!(saved.last_sequence().as_deref(), Some("9"));
    }

    #[test]
    fn numeric_last_sequence() {
        let checkpoint = Checkpoint::from_body(json!({"lastSequence": 12}).as_object().unwrap().clone());
        assert_eq!(checkpoint.last_sequence().as_deref(), Some("12"));
        assert_eq!(Checkpoint::default().last_sequence(), None);
    }
}
