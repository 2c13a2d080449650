//! `_changes` feed entries.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::Value;

/// How the `_changes` feed is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesFeedMode {
    /// `feed=normal`: read everything once, then stop.
    OneShot,
    /// `feed=longpoll&limit=50`: poll repeatedly, each request waits for news.
    LongPoll,
    /// `feed=continuous`: a single streaming response of newline-separated entries.
    Continuous,
}

impl ChangesFeedMode {
    /// Query parameters selecting this feed mode.
    pub fn query_pairs(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ChangesFeedMode::OneShot => &[("feed", "normal")],
            ChangesFeedMode::LongPoll => &[("feed", "longpoll"), ("limit", "50")],
            ChangesFeedMode::Continuous => &[("feed", "continuous")],
        }
    }
}

/// A single entry of the change feed.
///
/// ```json
/// {"seq": 5, "id": "doc1", "deleted": true, "changes": [{"rev": "2-z"}]}
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Opaque sequence token, stringified.
    pub seq: String,
    /// Document id, if present.
    pub id: Option<String>,
    /// Whether the document is deleted.
    pub deleted: bool,
    /// Leaf revision ids listed under `changes`.
    pub revs: Vec<String>,
}

impl ChangeEntry {
    /// Parses an entry. Only `seq` is required here; callers validate the rest.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::invalid("change", "expected an object"))?;
        let seq = object
            .get("seq")
            .filter(|seq| !seq.is_null())
            .map(sequence_token)
            .ok_or(ProtocolError::MissingField("seq"))?;
        let id = object.get("id").and_then(Value::as_str).map(str::to_string);
        let deleted = object
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let revs = object
            .get("changes")
            .and_then(Value::as_array)
            .map(|changes| {
                changes
                    .iter()
                    .filter_map(|change| change.get("rev").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            seq,
            id,
            deleted,
            revs,
        })
    }

    /// Parses one line of a streamed feed.
    pub fn from_line(line: &str) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(&value)
    }
}

/// Converts a sequence value into the string token used for checkpoints.
///
/// Strings are kept verbatim; numbers and other values use their JSON text.
pub fn sequence_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Classification of one line of a streamed `_changes` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedLine<'a> {
    /// Empty or whitespace line (continuous-feed heartbeat).
    Blank,
    /// `{"results":[` or `],` wrapper of a normal feed.
    Envelope,
    /// The trailing `last_seq` line.
    LastSeq,
    /// A change entry, with any trailing comma removed.
    Change(&'a str),
}

/// Classifies a line of a `feed=normal` or `feed=continuous` body.
pub fn classify_line(line: &str) -> FeedLine<'_> {
    let line = line.trim();
    if line.len() <= 1 {
        return match line {
            "]" | "}" => FeedLine::Envelope,
            _ => FeedLine::Blank,
        };
    }
    if line.starts_with("{\"results\":[") || line.starts_with("],") {
        return FeedLine::Envelope;
    }
    if line.starts_with("\"last_seq\"") || line.starts_with("{\"last_seq\"") {
        return FeedLine::LastSeq;
    }
    FeedLine::Change(line.strip_suffix(',').unwrap_or(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn feed_query_pairs() {
        assert_eq!(ChangesFeedMode::OneShot.query_pairs(), &[("feed", "normal")]);
        assert_eq!(
            ChangesFeedMode::LongPoll.query_pairs(),
            &[("feed", "longpoll"), ("limit", "50")]
        );
        assert_eq!(
            ChangesFeedMode::Continuous.query_pairs(),
            &[("feed", "continuous")]
        );
    }

    #[test]
    fn parse_entry() {
        let entry = ChangeEntry::from_value(&json!({
            "seq": 5,
            "id": "doc1",
            "changes": [{"rev": "2-z"}, {"rev": "2-y"}]
        }))
        .unwrap();
        assert_eq!(entry.seq, "5");
        assert_eq!(entry.id.as_deref(), Some("doc1"));
        assert!(!entry.deleted);
        assert_eq!(entry.revs, vec!["2-z".to_string(), "2-y".to_string()]);
    }

    #[test]
    fn string_sequences_are_verbatim() {
        let entry = ChangeEntry::from_value(&json!({"seq": "12-g1AAAA", "id": "d"})).unwrap();
        assert_eq!(entry.seq, "12-g1AAAA");
        assert!(entry.revs.is_empty());
    }

    #[test]
    fn missing_seq_is_rejected() {
        let err = ChangeEntry::from_value(&json!({"id": "doc1", "changes": []})).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("seq")));
        assert!(ChangeEntry::from_value(&json!({"seq": null})).is_err());
        assert!(ChangeEntry::from_value(&json!([1, 2])).is_err());
    }

    #[test]
    fn deleted_flag() {
        let entry = ChangeEntry::from_line(r#"{"seq":3,"id":"d","deleted":true,"changes":[{"rev":"2-a"}]}"#)
            .unwrap();
        assert!(entry.deleted);
    }

    #[test]
    fn line_classification() {
        assert_eq!(classify_line(""), FeedLine::Blank);
        assert_eq!(classify_line("\n"), FeedLine::Blank);
        assert_eq!(classify_line("{\"results\":["), FeedLine::Envelope);
        assert_eq!(classify_line("],"), FeedLine::Envelope);
        assert_eq!(classify_line("\"last_seq\":7}"), FeedLine::LastSeq);
        assert_eq!(classify_line("{\"last_seq\":7}"), FeedLine::LastSeq);
        assert_eq!(
            classify_line("{\"seq\":1,\"id\":\"a\",\"changes\":[]},"),
            FeedLine::Change("{\"seq\":1,\"id\":\"a\",\"changes\":[]}")
        );
    }
}
