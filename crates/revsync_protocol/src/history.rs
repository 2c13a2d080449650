//! Revision history in the `_revisions` wire form.

use crate::revision::{parse_rev_id, Body};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Compact revision history: `{"start": N, "ids": [suffix, ...]}`.
///
/// `ids` are newest first. When the generations in a history are not
/// consecutive the compact form cannot express them, so `start` is omitted
/// and `ids` carries full revision ids instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    /// Generation of the newest revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    /// Revision suffixes (or full ids when `start` is absent), newest first.
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Encodes a newest-first list of full revision ids.
    pub fn from_rev_ids(history: &[String]) -> Self {
        let mut start = None;
        let mut suffixes = Vec::with_capacity(history.len());

        for (i, rev_id) in history.iter().enumerate() {
            let Some((generation, suffix)) = parse_rev_id(rev_id) else {
                return Self::full(history);
            };
            match start {
                None => start = Some(generation),
                Some(first) if first.checked_sub(i as u64) == Some(generation) => {}
                Some(_) => return Self::full(history),
            }
            suffixes.push(suffix.to_string());
        }

        Self {
            start,
            ids: suffixes,
        }
    }

    fn full(history: &[String]) -> Self {
        Self {
            start: None,
            ids: history.to_vec(),
        }
    }

    /// Expands back into full revision ids, newest first.
    pub fn to_rev_ids(&self) -> Vec<String> {
        match self.start {
            Some(start) => self
                .ids
                .iter()
                .enumerate()
                .map(|(i, id)| format!("{}-{}", start.saturating_sub(i as u64), id))
                .collect(),
            None => self.ids.clone(),
        }
    }

    /// Returns the JSON value stored under `_revisions`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Reads the `_revisions` property of fetched document properties.
///
/// Returns `None` when the property is absent or malformed.
pub fn parse_revision_history(properties: &Body) -> Option<Vec<String>> {
    let revisions = properties.get("_revisions")?;
    let history: RevisionHistory = serde_json::from_value(revisions.clone()).ok()?;
    Some(history.to_rev_ids())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn compact_history() {
        let history = RevisionHistory::from_rev_ids(&ids(&["3-c", "2-b", "1-a"]));
        assert_eq!(history.start, Some(3));
        assert_eq!(history.ids, ids(&["c", "b", "a"]));
        assert_eq!(history.to_value(), json!({"start": 3, "ids": ["c", "b", "a"]}));
    }

    #[test]
    fn gap_falls_back_to_full_ids() {
        let history = RevisionHistory::from_rev_ids(&ids(&["5-e", "2-b"]));
        assert_eq!(history.start, None);
        assert_eq!(history.ids, ids(&["5-e", "2-b"]));
        assert_eq!(history.to_value(), json!({"ids": ["5-e", "2-b"]}));
    }

    #[test]
    fn malformed_id_falls_back_to_full_ids() {
        let history = RevisionHistory::from_rev_ids(&ids(&["2-b", "bogus"]));
        assert_eq!(history.start, None);
    }

    #[test]
    fn parse_from_properties() {
        let props = json!({
            "_id": "doc1",
            "_rev": "2-z",
            "_revisions": {"start": 2, "ids": ["z", "x"]}
        });
        let history = parse_revision_history(props.as_object().unwrap()).unwrap();
        assert_eq!(history, ids(&["2-z", "1-x"]));
    }

    #[test]
    fn parse_missing_history() {
        let props = json!({"_id": "doc1", "_rev": "2-z"});
        assert!(parse_revision_history(props.as_object().unwrap()).is_none());

        let props = json!({"_id": "doc1", "_revisions": {"start": 2}});
        assert!(parse_revision_history(props.as_object().unwrap()).is_none());
    }

    proptest! {
        #[test]
        fn consecutive_histories_survive_encoding(
            start in 1u64..500,
            suffixes in proptest::collection::vec("[a-f0-9]{1,8}", 1..20),
        ) {
            let len = suffixes.len() as u64;
            prop_assume!(start >= len);
            let history: Vec<String> = suffixes
                .iter()
                .enumerate()
                .map(|(i, s)| format!("{}-{}", start - i as u64, s))
                .collect();
            let encoded = RevisionHistory::from_rev_ids(&history);
            prop_assert_eq!(encoded.start, Some(start));
            prop_assert_eq!(encoded.to_rev_ids(), history);
        }
    }
}
