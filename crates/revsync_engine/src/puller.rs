//! Pull direction: remote change feed into the local store.
//!
//! Changes from the [`ChangeTracker`] go through the inbox, where revisions
//! already stored locally are dropped. The rest get a fake sequence in a
//! [`SequenceMap`] and are fetched with at most `max_open_connections`
//! concurrent GETs. Fetched revisions are batched again and force-inserted
//! in one transaction per batch. The checkpoint only ever moves to the
//! remote sequence below which every revision has been handled.

use crate::batcher::{BatchProcessor, Batcher};
use crate::change_tracker::{ChangeTracker, ChangeTrackerClient, ChangeTrackerConfig};
use crate::config::ReplicatorConfig;
use crate::error::ReplicationError;
use crate::replicator::ReplicatorInner;
use crate::sequence_map::SequenceMap;
use crate::store::StoreError;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use revsync_protocol::{
    is_valid_document_id, parse_revision_history, Body, ChangeEntry, ChangesFeedMode, Revision,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// How often a throttled change feed rechecks the backlog without a wakeup.
const BACKLOG_RECHECK: Duration = Duration::from_millis(500);

pub(crate) struct Puller {
    tracker: Mutex<Option<ChangeTracker>>,
    sequences: Mutex<SequenceMap>,
    queue: Mutex<PullQueue>,
    downloads: Batcher<Download>,
    backlog_drained: Notify,
}

#[derive(Default)]
struct PullQueue {
    pending: VecDeque<Revision>,
    open: usize,
}

/// A fetched revision waiting to be inserted.
struct Download {
    revision: Revision,
    history: Vec<String>,
}

struct TrackerClient {
    replicator: Weak<ReplicatorInner>,
}

#[async_trait]
impl ChangeTrackerClient for TrackerClient {
    async fn received_change(&self, change: ChangeEntry) {
        let Some(inner) = self.replicator.upgrade() else {
            return;
        };
        if let Some(puller) = inner.puller() {
            puller.received_change(&inner, change).await;
        }
    }

    fn tracker_stopped(&self, error: Option<ReplicationError>) {
        let Some(inner) = self.replicator.upgrade() else {
            return;
        };
        if let Some(puller) = inner.puller() {
            puller.tracker_stopped(&inner, error);
        }
    }
}

fn downloads_processor(replicator: Weak<ReplicatorInner>) -> BatchProcessor<Download> {
    Arc::new(move |batch: Vec<Download>| {
        let replicator = replicator.clone();
        async move {
            if let Some(inner) = replicator.upgrade() {
                let count = batch.len();
                insert_downloads(&inner, batch);
                inner.async_task_finished(count);
            }
        }
        .boxed()
    })
}

impl Puller {
    pub(crate) fn new(
        replicator: Weak<ReplicatorInner>,
        config: &ReplicatorConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            tracker: Mutex::new(None),
            sequences: Mutex::new(SequenceMap::new()),
            queue: Mutex::new(PullQueue::default()),
            downloads: Batcher::new(
                config.download_capacity,
                config.download_delay,
                runtime,
                downloads_processor(replicator),
            ),
            backlog_drained: Notify::new(),
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.queue.lock().pending.len()
    }

    pub(crate) fn begin_replicating(&self, inner: &Arc<ReplicatorInner>) {
        let mode = if inner.is_continuous() {
            ChangesFeedMode::LongPoll
        } else {
            ChangesFeedMode::OneShot
        };
        let mut config = ChangeTrackerConfig::new(mode);
        config.since = inner.last_sequence();
        config.filter_name = inner.config.filter_name.clone();
        config.filter_params = inner.config.filter_params.clone();
        config.heartbeat = inner.config.heartbeat;

        info!(since = ?config.since, mode = ?mode, "starting change tracker");
        let client = Arc::new(TrackerClient {
            replicator: Arc::downgrade(inner),
        });
        let tracker = ChangeTracker::new(Arc::clone(&inner.remote), config, client);

        // released in tracker_stopped
        inner.async_task_started();
        *self.tracker.lock() = Some(tracker.clone());
        tracker.start(&inner.runtime);
    }

    pub(crate) fn stop(&self, inner: &Arc<ReplicatorInner>) {
        let tracker = self.tracker.lock().take();
        if let Some(tracker) = tracker {
            tracker.stop();
        }

        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = queue.pending.len();
            queue.pending.clear();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "discarding revisions not yet pulled");
            inner.async_task_finished(dropped);
        }
        self.backlog_drained.notify_waiters();
    }

    pub(crate) async fn flush_downloads(&self) {
        self.downloads.flush().await;
    }

    pub(crate) fn close(&self) {
        let tracker = self.tracker.lock().take();
        if let Some(tracker) = tracker {
            tracker.stop();
        }
        self.downloads.close();
    }

    async fn received_change(&self, inner: &Arc<ReplicatorInner>, change: ChangeEntry) {
        let doc_id = match change.id {
            Some(id) if is_valid_document_id(&id) => id,
            other => {
                warn!(doc_id = ?other, seq = %change.seq, "ignoring change with an invalid document id");
                return;
            }
        };
        if change.revs.is_empty() {
            return;
        }

        inner.add_to_total(change.revs.len() as u64);
        for rev_id in change.revs {
            inner.add_to_inbox(Revision::pulled(
                doc_id.as_str(),
                rev_id,
                change.deleted,
                change.seq.as_str(),
            ));
        }
        self.wait_for_backlog(inner).await;
    }

    /// Holds the change feed while too many revisions are waiting.
    async fn wait_for_backlog(&self, inner: &ReplicatorInner) {
        let limit = inner.config.pull_backlog_limit;
        let mut throttled = false;
        loop {
            let drained = self.backlog_drained.notified();
            let backlog = inner.inbox.count() + self.pending_count();
            if backlog <= limit || !inner.state().is_running() || inner.stop_requested() {
                if throttled {
                    debug!(backlog, "pull backlog drained");
                }
                return;
            }
            if !throttled {
                debug!(backlog, limit, "pull backlog full, pausing change feed");
                throttled = true;
            }
            tokio::select! {
                _ = drained => {}
                _ = tokio::time::sleep(BACKLOG_RECHECK) => {}
            }
        }
    }

    fn tracker_stopped(&self, inner: &Arc<ReplicatorInner>, error: Option<ReplicationError>) {
        self.tracker.lock().take();
        if let Some(error) = error {
            inner.record_error(error);
        }
        if inner.is_continuous() && inner.state().is_running() {
            info!("change tracker stopped in continuous mode, stopping replicator");
            inner.stop();
        }
        inner.async_task_finished(1);
    }

    pub(crate) async fn process_inbox(&self, inner: &Arc<ReplicatorInner>, inbox: Vec<Revision>) {
        let last_inbox_sequence = inbox.last().and_then(|rev| rev.remote_sequence.clone());
        let missing = match inner.store.find_missing_revisions(&inbox) {
            Ok(missing) => missing,
            Err(err) => {
                inner.record_error(err.into());
                self.backlog_drained.notify_waiters();
                return;
            }
        };

        let known = inbox.len().saturating_sub(missing.len());
        if known > 0 {
            inner.remove_from_total(known as u64);
        }

        if missing.is_empty() {
            let checkpoint = {
                let mut sequences = self.sequences.lock();
                if let Some(token) = last_inbox_sequence {
                    let sequence = sequences.add_value(token);
                    sequences.remove_sequence(sequence);
                }
                sequences.checkpointed_value().map(str::to_string)
            };
            inner.set_last_sequence(checkpoint);
            self.backlog_drained.notify_waiters();
            return;
        }

        debug!(count = missing.len(), known, "queueing revisions to pull");
        {
            let mut sequences = self.sequences.lock();
            let mut queue = self.queue.lock();
            for mut revision in missing {
                revision.sequence =
                    sequences.add_value(revision.remote_sequence.clone().unwrap_or_default());
                inner.async_task_started();
                queue.pending.push_back(revision);
            }
        }
        self.pull_remote_revisions(inner);
    }

    /// Starts GETs for queued revisions while connections are available.
    fn pull_remote_revisions(&self, inner: &Arc<ReplicatorInner>) {
        let work: Vec<Revision> = {
            let mut queue = self.queue.lock();
            let available = inner
                .config
                .max_open_connections
                .saturating_sub(queue.open)
                .min(queue.pending.len());
            queue.open += available;
            queue.pending.drain(..available).collect()
        };
        if work.is_empty() {
            return;
        }
        self.backlog_drained.notify_waiters();
        for revision in work {
            inner
                .runtime
                .spawn(pull_remote_revision(Arc::clone(inner), revision));
        }
    }
}

async fn pull_remote_revision(inner: Arc<ReplicatorInner>, revision: Revision) {
    let Some(puller) = inner.puller() else {
        return;
    };

    let known = inner.store.known_revision_ids(&revision.doc_id);
    let atts_since = if known.is_empty() {
        None
    } else {
        serde_json::to_string(&known).ok()
    };
    let mut query = vec![
        ("rev", revision.rev_id.as_str()),
        ("revs", "true"),
        ("attachments", "true"),
    ];
    if let Some(atts_since) = &atts_since {
        query.push(("atts_since", atts_since.as_str()));
    }

    let fetched = inner
        .remote
        .get(&[revision.doc_id.as_str()], &query)
        .await
        .and_then(|response| response.json::<Body>());

    match fetched {
        Ok(properties) => match parse_revision_history(&properties) {
            Some(history) => {
                let deleted = properties
                    .get("_deleted")
                    .and_then(Value::as_bool)
                    .unwrap_or(revision.deleted);
                let mut pulled = revision;
                pulled.deleted = deleted;
                pulled.body = Some(properties);
                // released by the downloads processor
                inner.async_task_started();
                puller.downloads.queue_object(Download {
                    revision: pulled,
                    history,
                });
            }
            None => {
                warn!(
                    doc_id = %revision.doc_id,
                    rev_id = %revision.rev_id,
                    "fetched revision has no _revisions"
                );
                inner.record_error(ReplicationError::Protocol(format!(
                    "missing _revisions for {} {}",
                    revision.doc_id, revision.rev_id
                )));
                inner.add_processed(1);
            }
        },
        Err(err) => {
            warn!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, error = %err, "failed to fetch revision");
            inner.record_error(err);
            inner.add_processed(1);
        }
    }

    {
        let mut queue = puller.queue.lock();
        queue.open = queue.open.saturating_sub(1);
    }
    puller.pull_remote_revisions(&inner);
    inner.async_task_finished(1);
}

/// Force-inserts a batch of fetched revisions in sequence order.
///
/// Validation rejections are skipped, other failures are recorded. The
/// transaction commits if at least one revision went in.
fn insert_downloads(inner: &Arc<ReplicatorInner>, mut downloads: Vec<Download>) {
    let Some(puller) = inner.puller() else {
        return;
    };
    let count = downloads.len();
    downloads.sort_by_key(|download| download.revision.sequence);

    let source = inner.remote.url().to_string();
    let store = Arc::clone(&inner.store);
    let mut inserted = 0usize;
    let mut failure: Option<StoreError> = None;
    let committed = store.transaction(&mut || {
        inserted = 0;
        failure = None;
        for download in &downloads {
            let revision = &download.revision;
            match store.force_insert(revision, &download.history, Some(&source)) {
                Ok(()) => inserted += 1,
                Err(StoreError::Forbidden(reason)) => {
                    info!(
                        doc_id = %revision.doc_id,
                        rev_id = %revision.rev_id,
                        reason = %reason,
                        "pulled revision rejected by validation"
                    );
                }
                Err(err) => {
                    warn!(
                        doc_id = %revision.doc_id,
                        rev_id = %revision.rev_id,
                        error = %err,
                        "failed to insert pulled revision"
                    );
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }
        inserted > 0
    });

    inner.add_processed(count as u64);
    if let Err(err) = committed {
        // nothing retired: the checkpoint must not pass these revisions
        inner.record_error(err.into());
        return;
    }
    if let Some(err) = failure {
        inner.record_error(err.into());
    }
    debug!(inserted, count, "inserted pulled revisions");

    let checkpoint = {
        let mut sequences = puller.sequences.lock();
        for download in &downloads {
            sequences.remove_sequence(download.revision.sequence);
        }
        sequences.checkpointed_value().map(str::to_string)
    };
    inner.set_last_sequence(checkpoint);
}
