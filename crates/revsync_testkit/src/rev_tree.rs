//! Revision trees for the in-memory store and remote.

use revsync_protocol::{parse_rev_id, Body};
use std::collections::BTreeMap;

/// A revision held in a [`RevTree`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRevision {
    /// Revision id.
    pub rev_id: String,
    /// Parent revision id.
    pub parent: Option<String>,
    /// Whether this is a tombstone.
    pub deleted: bool,
    /// Body; `None` for ancestors known only from a history.
    pub body: Option<Body>,
    /// Sequence the revision was stored at; 0 for ancestors.
    pub sequence: u64,
}

impl StoredRevision {
    /// Generation of the revision id.
    pub fn generation(&self) -> u64 {
        parse_rev_id(&self.rev_id).map_or(0, |(generation, _)| generation)
    }
}

/// All known revisions of one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevTree {
    revisions: BTreeMap<String, StoredRevision>,
}

impl RevTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the tree knows `rev_id`, with or without a body.
    pub fn contains(&self, rev_id: &str) -> bool {
        self.revisions.contains_key(rev_id)
    }

    /// Looks up a revision.
    pub fn get(&self, rev_id: &str) -> Option<&StoredRevision> {
        self.revisions.get(rev_id)
    }

    /// Forgets the body of a stored revision. Returns false if it is unknown.
    pub fn compact(&mut self, rev_id: &str) -> bool {
        match self.revisions.get_mut(rev_id) {
            Some(revision) => {
                revision.body = None;
                true
            }
            None => false,
        }
    }

    /// Returns true if the tree has no revisions.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Ids of revisions stored with a body, newest generation first.
    pub fn stored_rev_ids(&self) -> Vec<String> {
        let mut stored: Vec<&StoredRevision> = self
            .revisions
            .values()
            .filter(|rev| rev.body.is_some())
            .collect();
        stored.sort_by(|a, b| {
            b.generation()
                .cmp(&a.generation())
                .then_with(|| b.rev_id.cmp(&a.rev_id))
        });
        stored.into_iter().map(|rev| rev.rev_id.clone()).collect()
    }

    /// Inserts a revision given its history (newest first).
    ///
    /// Unknown ancestors are added without bodies. Returns false if the
    /// newest revision was already present.
    pub fn insert_history(
        &mut self,
        history: &[String],
        deleted: bool,
        body: Body,
        sequence: u64,
    ) -> bool {
        let Some(rev_id) = history.first() else {
            return false;
        };
        if self.contains(rev_id) {
            return false;
        }

        for (i, ancestor) in history.iter().enumerate().skip(1) {
            if self.contains(ancestor) {
                break;
            }
            self.revisions.insert(
                ancestor.clone(),
                StoredRevision {
                    rev_id: ancestor.clone(),
                    parent: history.get(i + 1).cloned(),
                    deleted: false,
                    body: None,
                    sequence: 0,
                },
            );
        }

        self.revisions.insert(
            rev_id.clone(),
            StoredRevision {
                rev_id: rev_id.clone(),
                parent: history.get(1).cloned(),
                deleted,
                body: Some(body),
                sequence,
            },
        );
        true
    }

    /// History of `rev_id`, newest first. Empty if unknown.
    pub fn history(&self, rev_id: &str) -> Vec<String> {
        let mut history = Vec::new();
        let mut current = self.revisions.get(rev_id);
        while let Some(rev) = current {
            history.push(rev.rev_id.clone());
            current = rev.parent.as_deref().and_then(|p| self.revisions.get(p));
        }
        history
    }

    /// Revisions that are nobody's parent, in sequence order.
    pub fn leaves(&self) -> Vec<&StoredRevision> {
        let mut leaves: Vec<&StoredRevision> = self
            .revisions
            .values()
            .filter(|rev| {
                !self
                    .revisions
                    .values()
                    .any(|other| other.parent.as_deref() == Some(rev.rev_id.as_str()))
            })
            .collect();
        leaves.sort_by_key(|rev| rev.sequence);
        leaves
    }

    /// The current revision: live before deleted, then highest generation,
    /// then highest revision id.
    pub fn winning(&self) -> Option<&StoredRevision> {
        self.leaves().into_iter().max_by(|a, b| {
            (!a.deleted, a.generation(), &a.rev_id).cmp(&(!b.deleted, b.generation(), &b.rev_id))
        })
    }

    /// Highest sequence of any revision.
    pub fn sequence(&self) -> u64 {
        self.revisions
            .values()
            .map(|rev| rev.sequence)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn history_adds_ancestor_stubs() {
        let mut tree = RevTree::new();
        assert!(tree.insert_history(&ids(&["3-c", "2-b", "1-a"]), false, Body::new(), 7));

        assert!(tree.contains("1-a"));
        assert!(tree.get("2-b").unwrap().body.is_none());
        assert_eq!(tree.history("3-c"), ids(&["3-c", "2-b", "1-a"]));
        assert_eq!(tree.stored_rev_ids(), ids(&["3-c"]));
        assert_eq!(tree.sequence(), 7);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut tree = RevTree::new();
        assert!(tree.insert_history(&ids(&["1-a"]), false, Body::new(), 1));
        assert!(!tree.insert_history(&ids(&["1-a"]), false, Body::new(), 2));
        assert_eq!(tree.get("1-a").unwrap().sequence, 1);
    }

    #[test]
    fn winner_prefers_live_leaves() {
        let mut tree = RevTree::new();
        tree.insert_history(&ids(&["1-a"]), false, Body::new(), 1);
        tree.insert_history(&ids(&["2-b", "1-a"]), false, Body::new(), 2);
        tree.insert_history(&ids(&["3-x", "2-c", "1-a"]), true, Body::new(), 3);

        let leaves: Vec<&str> = tree.leaves().iter().map(|r| r.rev_id.as_str()).collect();
        assert_eq!(leaves, vec!["2-b", "3-x"]);
        assert_eq!(tree.winning().unwrap().rev_id, "2-b");
    }
}
