//! Reader of the remote `_changes` feed.

use crate::error::{ReplicationError, ReplicationResult};
use crate::http::Url;
use crate::remote::RemoteDatabase;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use revsync_protocol::{
    classify_line, parse_changes_response, ChangeEntry, ChangesFeedMode, FeedLine,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest reconnect delay.
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Receives what the tracker reads.
#[async_trait]
pub trait ChangeTrackerClient: Send + Sync {
    /// Called for every change entry that carries a `seq`.
    ///
    /// The tracker waits for this to return before reading further, so a
    /// client can apply backpressure by not returning.
    async fn received_change(&self, change: ChangeEntry);

    /// Called once when the tracker stops, with the error that stopped it.
    fn tracker_stopped(&self, error: Option<ReplicationError>);
}

/// Settings for one change tracker.
#[derive(Debug, Clone)]
pub struct ChangeTrackerConfig {
    /// Feed mode.
    pub mode: ChangesFeedMode,
    /// Sequence to resume after.
    pub since: Option<String>,
    /// Server-side filter name.
    pub filter_name: Option<String>,
    /// Server-side filter parameters.
    pub filter_params: BTreeMap<String, String>,
    /// Heartbeat the server should send while idle.
    pub heartbeat: Duration,
}

impl ChangeTrackerConfig {
    /// Creates a config for `mode` with the default five minute heartbeat.
    pub fn new(mode: ChangesFeedMode) -> Self {
        Self {
            mode,
            since: None,
            filter_name: None,
            filter_params: BTreeMap::new(),
            heartbeat: Duration::from_millis(300_000),
        }
    }
}

/// Reconnect delay schedule: `100ms * ((n^2 - 1) / 2)`, capped at five minutes.
#[derive(Debug, Clone, Default)]
pub struct ChangeTrackerBackoff {
    attempts: u32,
}

impl ChangeTrackerBackoff {
    /// Creates a backoff with no failed attempts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the delay before the next attempt and counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        let n = u64::from(self.attempts);
        let millis = 100 * (n.saturating_mul(n).saturating_sub(1) / 2);
        let delay = Duration::from_millis(millis).min(MAX_BACKOFF);
        if delay < MAX_BACKOFF {
            self.attempts += 1;
        }
        delay
    }

    /// Forgets previous failures.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Number of counted attempts.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Reads the remote change feed on its own task.
///
/// Clones share the same read loop.
#[derive(Clone)]
pub struct ChangeTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    remote: Arc<RemoteDatabase>,
    config: ChangeTrackerConfig,
    client: Mutex<Option<Arc<dyn ChangeTrackerClient>>>,
    last_sequence: Mutex<Option<String>>,
    error: Mutex<Option<ReplicationError>>,
    backoff: Mutex<ChangeTrackerBackoff>,
    running: AtomicBool,
    cancel: CancellationToken,
}

enum PollOutcome {
    Again,
    Done,
}

impl ChangeTracker {
    /// Creates a tracker reporting to `client`.
    pub fn new(
        remote: Arc<RemoteDatabase>,
        config: ChangeTrackerConfig,
        client: Arc<dyn ChangeTrackerClient>,
    ) -> Self {
        let last_sequence = config.since.clone();
        Self {
            inner: Arc::new(TrackerInner {
                remote,
                config,
                client: Mutex::new(Some(client)),
                last_sequence: Mutex::new(last_sequence),
                error: Mutex::new(None),
                backoff: Mutex::new(ChangeTrackerBackoff::new()),
                running: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Starts reading on `runtime`. Returns false if already started or stopped.
    pub fn start(&self, runtime: &Handle) -> bool {
        if self.inner.cancel.is_cancelled() || self.inner.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let inner = Arc::clone(&self.inner);
        runtime.spawn(inner.run());
        true
    }

    /// Stops reading, aborts the in-flight request and notifies the client.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Returns true while the read loop is active.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Sequence of the last change delivered to the client.
    pub fn last_sequence(&self) -> Option<String> {
        self.inner.last_sequence.lock().clone()
    }

    /// Error that stopped the tracker, if any.
    pub fn error(&self) -> Option<ReplicationError> {
        self.inner.error.lock().clone()
    }

    /// URL of the next feed request.
    pub fn changes_url(&self) -> Url {
        self.inner.changes_url()
    }
}

impl TrackerInner {
    fn changes_url(&self) -> Url {
        let mut query: Vec<(String, String)> = self
            .config
            .mode
            .query_pairs()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        query.push((
            "heartbeat".into(),
            self.config.heartbeat.as_millis().to_string(),
        ));
        if let Some(since) = self.last_sequence.lock().clone() {
            query.push(("since".into(), since));
        }
        if let Some(filter) = &self.config.filter_name {
            query.push(("filter".into(), filter.clone()));
            query.extend(
                self.config
                    .filter_params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }

        let query: Vec<(&str, &str)> = query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.remote.endpoint(&["_changes"], &query)
    }

    async fn run(self: Arc<Self>) {
        info!(remote = %self.remote, mode = ?self.config.mode, "change tracker started");

        while self.running.load(Ordering::SeqCst) {
            let url = self.changes_url();
            debug!(url = %url, "reading changes");

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.poll(url) => outcome,
            };

            match outcome {
                Ok(PollOutcome::Again) => {}
                Ok(PollOutcome::Done) => break,
                Err(err @ ReplicationError::Transport { .. })
                    if self.config.mode != ChangesFeedMode::OneShot =>
                {
                    let delay = self.backoff.lock().next_delay();
                    warn!(error = %err, "change feed connection failed, retrying in {:?}", delay);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, "change tracker stopping on error");
                    *self.error.lock() = Some(err);
                    break;
                }
            }
        }

        self.stop();
    }

    async fn poll(&self, url: Url) -> ReplicationResult<PollOutcome> {
        let response = self.remote.open_stream(url).await?;
        if !response.is_success() {
            let status = response.status;
            let body = response.collect().await.unwrap_or_default();
            return Err(ReplicationError::http(
                status,
                String::from_utf8_lossy(&body).trim(),
            ));
        }
        self.backoff.lock().reset();

        // normal and longpoll bodies are one JSON object, however the server lays it out
        if self.config.mode != ChangesFeedMode::Continuous {
            let body = response.collect().await?;
            let (results, _) = parse_changes_response(&body)?;
            for change in &results {
                if !self.received_change(change).await {
                    return Err(ReplicationError::Protocol(
                        "change feed entry without a sequence".into(),
                    ));
                }
            }
            return Ok(match self.config.mode {
                ChangesFeedMode::OneShot => PollOutcome::Done,
                _ => PollOutcome::Again,
            });
        }

        let mut body = response.body;
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                self.received_line(&line).await;
            }
        }
        if !buffer.is_empty() {
            self.received_line(&buffer).await;
        }
        Ok(PollOutcome::Again)
    }

    /// Handles one line of a continuous feed.
    async fn received_line(&self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            warn!("ignoring non-UTF-8 change feed line");
            return;
        };
        match classify_line(line) {
            FeedLine::Blank | FeedLine::Envelope => {}
            FeedLine::LastSeq => debug!("change feed reported its last sequence"),
            FeedLine::Change(json) => match serde_json::from_str::<Value>(json) {
                Ok(change) => {
                    self.received_change(&change).await;
                }
                Err(err) => warn!(error = %err, "ignoring unparseable change feed line"),
            },
        }
    }

    /// Forwards a change to the client. Returns false if it has no `seq`.
    async fn received_change(&self, change: &Value) -> bool {
        let entry = match ChangeEntry::from_value(change) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "ignoring change feed entry");
                return false;
            }
        };
        let sequence = entry.seq.clone();
        let client = self.client.lock().clone();
        if let Some(client) = client {
            client.received_change(entry).await;
        }
        *self.last_sequence.lock() = Some(sequence);
        true
    }

    fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.cancel.cancel();
        let client = self.client.lock().take();
        if let Some(client) = client {
            if was_running {
                info!(remote = %self.remote, "change tracker stopped");
            }
            let error = self.error.lock().clone();
            client.tracker_stopped(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::http::{HttpClient, HttpRequest, HttpResponse, StreamingResponse};
    use bytes::Bytes;
    use futures::stream;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    enum Scripted {
        Body(u16, Vec<&'static str>),
        Fail,
    }

    /// Serves scripted `_changes` responses; once exhausted, hangs like an idle long-poll.
    #[derive(Default)]
    struct FeedClient {
        responses: Mutex<VecDeque<Scripted>>,
        urls: Mutex<Vec<Url>>,
    }

    impl FeedClient {
        fn new(responses: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                urls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpClient for FeedClient {
        async fn execute(&self, _request: HttpRequest) -> ReplicationResult<HttpResponse> {
            Err(ReplicationError::transport_fatal("not supported"))
        }

        async fn execute_streaming(
            &self,
            request: HttpRequest,
        ) -> ReplicationResult<StreamingResponse> {
            self.urls.lock().push(request.url);
            let next = self.responses.lock().pop_front();
            match next {
                Some(Scripted::Body(status, chunks)) => {
                    let chunks: Vec<ReplicationResult<Bytes>> = chunks
                        .into_iter()
                        .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                        .collect();
                    Ok(StreamingResponse {
                        status,
                        body: stream::iter(chunks).boxed(),
                    })
                }
                Some(Scripted::Fail) => Err(ReplicationError::transport_retryable("refused")),
                None => futures::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<ChangeEntry>>,
        stops: Mutex<Vec<Option<ReplicationError>>>,
        stopped: Notify,
    }

    #[async_trait]
    impl ChangeTrackerClient for Recorder {
        async fn received_change(&self, change: ChangeEntry) {
            self.changes.lock().push(change);
        }

        fn tracker_stopped(&self, error: Option<ReplicationError>) {
            self.stops.lock().push(error);
            self.stopped.notify_one();
        }
    }

    fn new_tracker(
        client: Arc<FeedClient>,
        config: ChangeTrackerConfig,
    ) -> (ChangeTracker, Arc<Recorder>) {
        let remote = Arc::new(
            RemoteDatabase::new("http://example.com/db", client, RetryConfig::no_retry()).unwrap(),
        );
        let recorder = Arc::new(Recorder::default());
        let tracker = ChangeTracker::new(remote, config, recorder.clone());
        (tracker, recorder)
    }

    #[test]
    fn backoff_schedule() {
        let mut backoff = ChangeTrackerBackoff::new();
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![0, 0, 100, 400, 700]);
        assert_eq!(backoff.attempts(), 5);

        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), MAX_BACKOFF);
        let capped = backoff.attempts();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), capped);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn changes_url_parameters() {
        let mut config = ChangeTrackerConfig::new(ChangesFeedMode::LongPoll);
        config.since = Some("42".into());
        config.filter_name = Some("app/mine".into());
        config.filter_params.insert("owner".into(), "bob smith".into());
        let (tracker, _) = new_tracker(FeedClient::new(vec![]), config);

        assert_eq!(
            tracker.changes_url().as_str(),
            "http://example.com/db/_changes?feed=longpoll&limit=50&heartbeat=300000&since=42\
             &filter=app%2Fmine&owner=bob+smith"
        );

        let (tracker, _) = tracker_one_shot();
        assert_eq!(
            tracker.changes_url().as_str(),
            "http://example.com/db/_changes?feed=normal&heartbeat=300000"
        );
    }

    fn tracker_one_shot() -> (ChangeTracker, Arc<Recorder>) {
        new_tracker(
            FeedClient::new(vec![]),
            ChangeTrackerConfig::new(ChangesFeedMode::OneShot),
        )
    }

    #[tokio::test]
    async fn one_shot_reads_normal_feed() {
        let client = FeedClient::new(vec![Scripted::Body(
            200,
            vec![
                "{\"results\":[\n{\"seq\":1,\"id\":\"a\",\"changes\":[{\"rev\":\"1-a\"}]},\n{\"seq\"",
                ":2,\"id\":\"b\",\"deleted\":true,\"changes\":[{\"rev\":\"2-b\"}]}\n],\n",
                "\"last_seq\":2}\n",
            ],
        )]);
        let (tracker, recorder) =
            new_tracker(client.clone(), ChangeTrackerConfig::new(ChangesFeedMode::OneShot));

        assert!(tracker.start(&Handle::current()));
        recorder.stopped.notified().await;

        let changes = recorder.changes.lock().clone();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].id.as_deref(), Some("a"));
        assert!(changes[1].deleted);
        assert_eq!(tracker.last_sequence().as_deref(), Some("2"));
        assert_eq!(*recorder.stops.lock(), vec![None]);
        assert!(!tracker.is_running());
        assert_eq!(client.urls.lock().len(), 1);
    }

    #[tokio::test]
    async fn one_shot_reads_compact_normal_feed() {
        let client = FeedClient::new(vec![Scripted::Body(
            200,
            vec![r#"{"results":[{"seq":1,"id":"a","changes":[{"rev":"1-a"}]},{"seq":2,"id":"b","changes":[{"rev":"1-b"}]}],"last_seq":2}"#, "\n"],
        )]);
        let (tracker, recorder) =
            new_tracker(client.clone(), ChangeTrackerConfig::new(ChangesFeedMode::OneShot));

        tracker.start(&Handle::current());
        recorder.stopped.notified().await;

        let changes = recorder.changes.lock().clone();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].revs, vec!["1-b".to_string()]);
        assert_eq!(tracker.last_sequence().as_deref(), Some("2"));
        assert_eq!(*recorder.stops.lock(), vec![None]);
        assert_eq!(client.urls.lock().len(), 1);
    }

    #[tokio::test]
    async fn one_shot_malformed_body_stops_with_error() {
        let client = FeedClient::new(vec![Scripted::Body(200, vec!["{\"results\":[\n", "not json\n"])]);
        let (tracker, recorder) =
            new_tracker(client, ChangeTrackerConfig::new(ChangesFeedMode::OneShot));

        tracker.start(&Handle::current());
        recorder.stopped.notified().await;

        assert!(recorder.changes.lock().is_empty());
        assert!(recorder.stops.lock()[0].is_some());
    }

    #[tokio::test]
    async fn continuous_skips_bad_lines() {
        let client = FeedClient::new(vec![Scripted::Body(
            200,
            vec![
                "{\"id\":\"a\",\"changes\":[{\"rev\":\"1-a\"}]}\n",
                "\n",
                "not json\n",
                "{\"seq\":3,\"id\":\"b\",\"changes\":[{\"rev\":\"1-b\"}]}\n",
                "{\"last_seq\":3}\n",
            ],
        )]);
        let (tracker, recorder) =
            new_tracker(client.clone(), ChangeTrackerConfig::new(ChangesFeedMode::Continuous));

        tracker.start(&Handle::current());
        while client.urls.lock().len() < 2 {
            tokio::task::yield_now().await;
        }

        let changes = recorder.changes.lock().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].seq, "3");
        assert!(tracker.is_running());
        assert!(client.urls.lock()[1].as_str().contains("since=3"));

        tracker.stop();
        assert_eq!(*recorder.stops.lock(), vec![None]);
    }

    #[tokio::test]
    async fn long_poll_repeats_until_error_status() {
        let client = FeedClient::new(vec![
            Scripted::Body(
                200,
                vec![r#"{"results":[{"seq":4,"id":"a","changes":[{"rev":"1-a"}]},{"seq":5,"id":"b","changes":[{"rev":"1-b"}]}],"last_seq":5}"#],
            ),
            Scripted::Body(401, vec![r#"{"error":"unauthorized"}"#]),
        ]);
        let (tracker, recorder) =
            new_tracker(client.clone(), ChangeTrackerConfig::new(ChangesFeedMode::LongPoll));

        tracker.start(&Handle::current());
        recorder.stopped.notified().await;

        assert_eq!(recorder.changes.lock().len(), 2);
        let stops = recorder.stops.lock().clone();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].as_ref().and_then(ReplicationError::status), Some(401));
        assert_eq!(tracker.error().and_then(|e| e.status()), Some(401));

        let urls = client.urls.lock();
        assert_eq!(urls.len(), 2);
        assert!(urls[1].as_str().contains("since=5"));
    }

    #[tokio::test]
    async fn long_poll_entry_without_seq_stops_tracker() {
        let client = FeedClient::new(vec![Scripted::Body(
            200,
            vec![r#"{"results":[{"id":"a","changes":[{"rev":"1-a"}]}],"last_seq":1}"#],
        )]);
        let (tracker, recorder) =
            new_tracker(client, ChangeTrackerConfig::new(ChangesFeedMode::LongPoll));

        tracker.start(&Handle::current());
        recorder.stopped.notified().await;

        assert!(recorder.changes.lock().is_empty());
        assert!(matches!(
            recorder.stops.lock()[0],
            Some(ReplicationError::Protocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_reconnects_after_transport_failure() {
        let client = FeedClient::new(vec![
            Scripted::Fail,
            Scripted::Fail,
            Scripted::Fail,
            Scripted::Body(
                200,
                vec![r#"{"results":[{"seq":9,"id":"a","changes":[{"rev":"1-a"}]}],"last_seq":9}"#],
            ),
        ]);
        let (tracker, recorder) =
            new_tracker(client.clone(), ChangeTrackerConfig::new(ChangesFeedMode::LongPoll));

        tracker.start(&Handle::current());
        while recorder.changes.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(tracker.inner.backoff.lock().attempts(), 0);
        assert_eq!(tracker.last_sequence().as_deref(), Some("9"));

        tracker.stop();
        assert_eq!(*recorder.stops.lock(), vec![None]);
    }

    #[tokio::test]
    async fn stop_notifies_client_once() {
        let client = FeedClient::new(vec![]);
        let (tracker, recorder) =
            new_tracker(client, ChangeTrackerConfig::new(ChangesFeedMode::LongPoll));

        tracker.start(&Handle::current());
        tokio::task::yield_now().await;
        assert!(tracker.is_running());

        tracker.stop();
        assert!(!tracker.is_running());
        assert_eq!(recorder.stops.lock().len(), 1);

        tracker.stop();
        tokio::task::yield_now().await;
        assert_eq!(recorder.stops.lock().len(), 1);
        assert!(!tracker.start(&Handle::current()));
    }
}
