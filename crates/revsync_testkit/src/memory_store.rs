//! In-memory [`DocumentStore`].
//!
//! Keeps a [`RevTree`] per document and a single sequence counter, like a
//! real revision-tree database, and supports rollback of transactions.

use crate::rev_tree::{RevTree, StoredRevision};
use parking_lot::{Mutex, RwLock};
use revsync_engine::{
    ContentOptions, DatabaseChange, DocumentStore, RevisionFilter, StoreError, StoreResult,
};
use revsync_protocol::{Body, Revision};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Validation hook for forced inserts. `Err(reason)` rejects the revision.
pub type Validator = Arc<dyn Fn(&Revision) -> Result<(), String> + Send + Sync>;

/// A revision-tree store held in memory.
pub struct MemoryStore {
    uuid: String,
    state: RwLock<StoreState>,
    subscribers: Mutex<Vec<UnboundedSender<DatabaseChange>>>,
    validator: RwLock<Option<Validator>>,
}

#[derive(Default)]
struct StoreState {
    docs: BTreeMap<String, RevTree>,
    last_sequence: u64,
    checkpoints: HashMap<(String, bool), String>,
    inserted: Vec<(String, String)>,
    in_transaction: bool,
    pending_changes: Vec<DatabaseChange>,
}

impl MemoryStore {
    /// Creates an empty store with a random private UUID.
    pub fn new() -> Arc<Self> {
        Self::with_uuid(Uuid::new_v4().simple().to_string())
    }

    /// Creates an empty store with a fixed private UUID.
    pub fn with_uuid(uuid: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.into(),
            state: RwLock::new(StoreState::default()),
            subscribers: Mutex::new(Vec::new()),
            validator: RwLock::new(None),
        })
    }

    /// Installs a validation hook for forced inserts.
    pub fn set_validator(&self, validator: Validator) {
        *self.validator.write() = Some(validator);
    }

    /// Stores a local edit on top of the current revision of `doc_id`.
    ///
    /// `body` must be a JSON object.
    pub fn put_revision(&self, doc_id: &str, rev_id: &str, body: Value) -> Revision {
        self.local_edit(doc_id, rev_id, false, object(body))
    }

    /// Stores a local deletion on top of the current revision of `doc_id`.
    pub fn delete(&self, doc_id: &str, rev_id: &str) -> Revision {
        self.local_edit(doc_id, rev_id, true, Body::new())
    }

    fn local_edit(&self, doc_id: &str, rev_id: &str, deleted: bool, body: Body) -> Revision {
        let change = {
            let mut state = self.state.write();
            state.last_sequence += 1;
            let sequence = state.last_sequence;
            let tree = state.docs.entry(doc_id.to_string()).or_default();
            let mut history = vec![rev_id.to_string()];
            if let Some(parent) = tree.winning() {
                history.extend(tree.history(&parent.rev_id));
            }
            tree.insert_history(&history, deleted, body.clone(), sequence);

            let revision = Revision::new(doc_id, rev_id, deleted)
                .with_sequence(sequence)
                .with_body(body);
            DatabaseChange {
                revision,
                source: None,
            }
        };
        let revision = change.revision.clone();
        self.publish(vec![change]);
        revision
    }

    /// Current revision of a document, with its body.
    pub fn document(&self, doc_id: &str) -> Option<Revision> {
        let state = self.state.read();
        let tree = state.docs.get(doc_id)?;
        let winner = tree.winning()?;
        Some(to_revision(doc_id, winner))
    }

    /// Looks up one stored revision.
    pub fn get_revision(&self, doc_id: &str, rev_id: &str) -> Option<StoredRevision> {
        self.state.read().docs.get(doc_id)?.get(rev_id).cloned()
    }

    /// Drops the stored body of a revision, as compaction would.
    pub fn compact_revision(&self, doc_id: &str, rev_id: &str) -> bool {
        self.state
            .write()
            .docs
            .get_mut(doc_id)
            .is_some_and(|tree| tree.compact(rev_id))
    }

    /// `(doc_id, rev_id)` of every revision inserted by replication, in order.
    pub fn inserted_revisions(&self) -> Vec<(String, String)> {
        self.state.read().inserted.clone()
    }

    /// Latest local sequence.
    pub fn last_sequence(&self) -> u64 {
        self.state.read().last_sequence
    }

    fn publish(&self, changes: Vec<DatabaseChange>) {
        if changes.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            changes
                .iter()
                .all(|change| subscriber.send(change.clone()).is_ok())
        });
    }
}

fn object(value: Value) -> Body {
    match value {
        Value::Object(body) => body,
        _ => Body::new(),
    }
}

fn to_revision(doc_id: &str, stored: &StoredRevision) -> Revision {
    let mut revision =
        Revision::new(doc_id, stored.rev_id.as_str(), stored.deleted).with_sequence(stored.sequence);
    revision.body = stored.body.clone();
    revision
}

impl DocumentStore for MemoryStore {
    fn private_uuid(&self) -> String {
        self.uuid.clone()
    }

    fn changes_since(
        &self,
        since: u64,
        filter: Option<&RevisionFilter>,
    ) -> StoreResult<Vec<Revision>> {
        let state = self.state.read();
        let mut changes: Vec<Revision> = state
            .docs
            .iter()
            .flat_map(|(doc_id, tree)| {
                tree.leaves()
                    .into_iter()
                    .filter(|leaf| leaf.sequence > since)
                    .map(|leaf| to_revision(doc_id, leaf))
                    .collect::<Vec<_>>()
            })
            .filter(|revision| filter.map_or(true, |filter| filter(revision)))
            .collect();
        changes.sort_by_key(|revision| revision.sequence);
        for change in &mut changes {
            change.body = None;
        }
        Ok(changes)
    }

    fn find_missing_revisions(&self, revisions: &[Revision]) -> StoreResult<Vec<Revision>> {
        let state = self.state.read();
        Ok(revisions
            .iter()
            .filter(|revision| {
                !state
                    .docs
                    .get(&revision.doc_id)
                    .is_some_and(|tree| tree.contains(&revision.rev_id))
            })
            .cloned()
            .collect())
    }

    fn known_revision_ids(&self, doc_id: &str) -> Vec<String> {
        self.state
            .read()
            .docs
            .get(doc_id)
            .map(RevTree::stored_rev_ids)
            .unwrap_or_default()
    }

    fn force_insert(
        &self,
        revision: &Revision,
        history: &[String],
        source: Option<&str>,
    ) -> StoreResult<()> {
        if history.first() != Some(&revision.rev_id) {
            return Err(StoreError::BadRequest(format!(
                "history of {} does not start with {}",
                revision.doc_id, revision.rev_id
            )));
        }
        let validator = self.validator.read().clone();
        if let Some(validator) = validator {
            validator(revision).map_err(StoreError::Forbidden)?;
        }

        let mut body = revision.body.clone().unwrap_or_default();
        body.retain(|key, _| !key.starts_with('_'));

        let published = {
            let mut state = self.state.write();
            let sequence = state.last_sequence + 1;
            let tree = state.docs.entry(revision.doc_id.clone()).or_default();
            if !tree.insert_history(history, revision.deleted, body.clone(), sequence) {
                return Ok(());
            }
            state.last_sequence = sequence;
            state
                .inserted
                .push((revision.doc_id.clone(), revision.rev_id.clone()));

            let change = DatabaseChange {
                revision: Revision::new(
                    revision.doc_id.as_str(),
                    revision.rev_id.as_str(),
                    revision.deleted,
                )
                .with_sequence(sequence)
                .with_body(body),
                source: source.map(str::to_string),
            };
            if state.in_transaction {
                state.pending_changes.push(change);
                Vec::new()
            } else {
                vec![change]
            }
        };
        self.publish(published);
        Ok(())
    }

    fn load_revision_body(
        &self,
        revision: &mut Revision,
        _options: ContentOptions,
    ) -> StoreResult<()> {
        let state = self.state.read();
        let stored = state
            .docs
            .get(&revision.doc_id)
            .and_then(|tree| tree.get(&revision.rev_id))
            .ok_or_else(|| {
                StoreError::NotFound(format!("{} {}", revision.doc_id, revision.rev_id))
            })?;
        let body = stored.body.clone().ok_or_else(|| {
            StoreError::NotFound(format!("body of {} {}", revision.doc_id, revision.rev_id))
        })?;
        revision.deleted = stored.deleted;
        revision.body = Some(body);
        Ok(())
    }

    fn revision_history(&self, revision: &Revision) -> StoreResult<Vec<String>> {
        let history = self
            .state
            .read()
            .docs
            .get(&revision.doc_id)
            .map(|tree| tree.history(&revision.rev_id))
            .unwrap_or_default();
        if history.is_empty() {
            return Err(StoreError::NotFound(format!(
                "{} {}",
                revision.doc_id, revision.rev_id
            )));
        }
        Ok(history)
    }

    fn last_sequence_with_remote(&self, remote_url: &str, is_push: bool) -> Option<String> {
        self.state
            .read()
            .checkpoints
            .get(&(remote_url.to_string(), is_push))
            .cloned()
    }

    fn set_last_sequence(
        &self,
        sequence: &str,
        remote_url: &str,
        is_push: bool,
    ) -> StoreResult<()> {
        self.state
            .write()
            .checkpoints
            .insert((remote_url.to_string(), is_push), sequence.to_string());
        Ok(())
    }

    fn transaction(&self, body: &mut dyn FnMut() -> bool) -> StoreResult<bool> {
        let snapshot = {
            let mut state = self.state.write();
            if state.in_transaction {
                return Err(StoreError::Internal("nested transaction".into()));
            }
            state.in_transaction = true;
            (
                state.docs.clone(),
                state.last_sequence,
                state.inserted.len(),
            )
        };

        let commit = body();

        let published = {
            let mut state = self.state.write();
            state.in_transaction = false;
            if commit {
                std::mem::take(&mut state.pending_changes)
            } else {
                let (docs, last_sequence, inserted) = snapshot;
                state.docs = docs;
                state.last_sequence = last_sequence;
                state.inserted.truncate(inserted);
                state.pending_changes.clear();
                Vec::new()
            }
        };
        self.publish(published);
        Ok(commit)
    }

    fn subscribe(&self) -> UnboundedReceiver<DatabaseChange> {
        let (sender, receiver) = unbounded_channel();
        self.subscribers.lock().push(sender);
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn history(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn local_edits_extend_the_winner() {
        let store = MemoryStore::new();
        store.put_revision("doc", "1-a", json!({"n": 1}));
        let second = store.put_revision("doc", "2-b", json!({"n": 2}));

        assert_eq!(second.sequence, 2);
        let current = store.document("doc").unwrap();
        assert_eq!(current.rev_id, "2-b");
        assert_eq!(
            store.revision_history(&current).unwrap(),
            history(&["2-b", "1-a"])
        );

        let changes = store.changes_since(0, None).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].rev_id, "2-b");
        assert!(store.changes_since(2, None).unwrap().is_empty());
    }

    #[test]
    fn missing_revisions() {
        let store = MemoryStore::new();
        store.put_revision("doc", "1-a", json!({}));
        let missing = store
            .find_missing_revisions(&[
                Revision::new("doc", "1-a", false),
                Revision::new("doc", "2-b", false),
                Revision::new("other", "1-c", false),
            ])
            .unwrap();
        let missing: Vec<&str> = missing.iter().map(|r| r.rev_id.as_str()).collect();
        assert_eq!(missing, vec!["2-b", "1-c"]);
    }

    #[test]
    fn rolled_back_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();
        let revision = Revision::new("doc", "1-a", false);

        let committed = store
            .transaction(&mut || {
                store.force_insert(&revision, &history(&["1-a"]), Some("remote")).unwrap();
                false
            })
            .unwrap();

        assert!(!committed);
        assert!(store.document("doc").is_none());
        assert!(store.inserted_revisions().is_empty());
        assert_eq!(store.last_sequence(), 0);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn committed_transaction_notifies_with_source() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();
        let revision = Revision::new("doc", "2-b", false).with_body(object(json!({"x": 1})));

        store
            .transaction(&mut || {
                store
                    .force_insert(&revision, &history(&["2-b", "1-a"]), Some("remote"))
                    .is_ok()
            })
            .unwrap();

        let change = changes.try_recv().unwrap();
        assert_eq!(change.source.as_deref(), Some("remote"));
        assert_eq!(change.revision.sequence, 1);
        assert!(store.get_revision("doc", "1-a").unwrap().body.is_none());
        assert_eq!(store.known_revision_ids("doc"), history(&["2-b"]));
    }

    #[test]
    fn validator_rejects() {
        let store = MemoryStore::new();
        store.set_validator(Arc::new(|revision: &Revision| {
            if revision.doc_id.starts_with("secret") {
                Err("no secrets".into())
            } else {
                Ok(())
            }
        }));
        let err = store
            .force_insert(&Revision::new("secret1", "1-a", false), &history(&["1-a"]), None)
            .unwrap_err();
        assert_eq!(err, StoreError::Forbidden("no secrets".into()));
        assert!(store
            .force_insert(&Revision::new("open", "1-a", false), &history(&["1-a"]), None)
            .is_ok());
    }

    #[test]
    fn checkpoints_are_per_remote_and_direction() {
        let store = MemoryStore::new();
        store.set_last_sequence("5", "http://a/db", true).unwrap();
        assert_eq!(
            store.last_sequence_with_remote("http://a/db", true).as_deref(),
            Some("5")
        );
        assert_eq!(store.last_sequence_with_remote("http://a/db", false), None);
    }
}
