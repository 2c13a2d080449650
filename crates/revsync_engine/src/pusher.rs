//! Push direction: local changes to the remote database.

use crate::http::HttpMethod;
use crate::replicator::ReplicatorInner;
use crate::store::{ContentOptions, DatabaseChange, DocumentStore, StoreResult};
use parking_lot::Mutex;
use revsync_protocol::{
    Body, BulkDocsRequest, BulkDocsResult, Revision, RevisionHistory, RevsDiffRequest,
    RevsDiffResponse,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct Pusher {
    observer: Mutex<Option<CancellationToken>>,
}

impl Pusher {
    pub(crate) fn new() -> Self {
        Self {
            observer: Mutex::new(None),
        }
    }

    /// Creates the remote database if configured to. An existing database is fine.
    pub(crate) async fn maybe_create_target(&self, inner: &Arc<ReplicatorInner>) -> bool {
        if !inner.config.create_target {
            return true;
        }
        info!(remote = %inner.remote, "creating remote database");
        let request = inner
            .remote
            .request(HttpMethod::Put, inner.remote.endpoint(&[], &[]));
        match inner.remote.send(request).await {
            Ok(_) => true,
            Err(err) if err.status() == Some(412) => {
                debug!("remote database already exists");
                true
            }
            Err(err) => {
                inner.record_error(err);
                inner.stop();
                false
            }
        }
    }

    pub(crate) fn begin_replicating(&self, inner: &Arc<ReplicatorInner>) {
        // subscribe before reading so nothing committed in between is missed
        let observer = inner.is_continuous().then(|| inner.store.subscribe());

        let since = inner
            .last_sequence()
            .and_then(|sequence| sequence.parse::<u64>().ok())
            .unwrap_or(0);
        match inner
            .store
            .changes_since(since, inner.config.push_filter.as_ref())
        {
            Ok(changes) => {
                info!(since, count = changes.len(), "pushing local changes");
                for revision in changes {
                    inner.add_to_inbox(revision);
                }
            }
            Err(err) => inner.record_error(err.into()),
        }

        if let Some(changes) = observer {
            self.observe(inner, changes);
        }
    }

    fn observe(&self, inner: &Arc<ReplicatorInner>, mut changes: UnboundedReceiver<DatabaseChange>) {
        let cancel = CancellationToken::new();
        *self.observer.lock() = Some(cancel.clone());
        // released when the observer ends
        inner.async_task_started();

        let inner = Arc::clone(inner);
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            let remote = inner.remote.url().to_string();
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => change,
                };
                let Some(change) = change else {
                    break;
                };
                if change.source.as_deref() == Some(remote.as_str()) {
                    continue;
                }
                if let Some(filter) = &inner.config.push_filter {
                    if !filter(&change.revision) {
                        continue;
                    }
                }
                inner.add_to_inbox(change.revision);
            }
            debug!("stopped observing local changes");
            inner.async_task_finished(1);
        });
    }

    pub(crate) fn stop(&self) {
        if let Some(cancel) = self.observer.lock().take() {
            cancel.cancel();
        }
    }

    pub(crate) async fn process_inbox(&self, inner: &Arc<ReplicatorInner>, inbox: Vec<Revision>) {
        let last_sequence = inbox.last().map(|revision| revision.sequence.to_string());

        let mut diff = RevsDiffRequest::new();
        for revision in &inbox {
            diff.add(revision.doc_id.as_str(), revision.rev_id.as_str());
        }
        let missing = match inner
            .remote
            .send_json(HttpMethod::Post, &["_revs_diff"], &diff)
            .await
            .and_then(|response| response.json::<RevsDiffResponse>())
        {
            Ok(missing) => missing,
            Err(err) => {
                inner.record_error(err);
                inner.stop();
                return;
            }
        };

        if missing.is_empty() {
            debug!(count = inbox.len(), "remote already has every revision");
            inner.set_last_sequence(last_sequence);
            return;
        }

        let mut docs = Vec::new();
        for revision in inbox
            .iter()
            .filter(|revision| missing.is_missing(&revision.doc_id, &revision.rev_id))
        {
            let properties = if revision.deleted {
                revision.tombstone_body()
            } else {
                match upload_body(inner.store.as_ref(), revision) {
                    Ok(properties) => properties,
                    Err(err) => {
                        warn!(
                            doc_id = %revision.doc_id,
                            rev_id = %revision.rev_id,
                            error = %err,
                            "cannot load revision for upload, skipping"
                        );
                        continue;
                    }
                }
            };
            docs.push(Value::Object(properties));
        }

        let count = docs.len() as u64;
        inner.add_to_total(count);
        debug!(count, "uploading revisions");
        let uploaded = inner
            .remote
            .send_json(HttpMethod::Post, &["_bulk_docs"], &BulkDocsRequest::replicated(docs))
            .await;
        match uploaded {
            Ok(response) => {
                if let Ok(results) = response.json::<Vec<BulkDocsResult>>() {
                    for result in results.iter().filter(|result| result.error.is_some()) {
                        warn!(
                            doc_id = %result.id,
                            error = ?result.error,
                            reason = ?result.reason,
                            "remote rejected revision"
                        );
                    }
                }
                info!(count, "pushed revisions");
                inner.set_last_sequence(last_sequence);
            }
            Err(err) => inner.record_error(err),
        }
        inner.add_processed(count);
    }
}

/// Loads a revision with attachments and attaches its `_revisions` history.
fn upload_body(store: &dyn DocumentStore, revision: &Revision) -> StoreResult<Body> {
    let mut loaded = revision.clone();
    store.load_revision_body(
        &mut loaded,
        ContentOptions {
            include_attachments: true,
        },
    )?;
    let history = store.revision_history(&loaded)?;
    let mut properties = loaded.properties();
    properties.insert(
        "_revisions".into(),
        RevisionHistory::from_rev_ids(&history).to_value(),
    );
    Ok(properties)
}

