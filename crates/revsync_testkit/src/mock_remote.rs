//! In-memory CouchDB-style remote implementing [`HttpClient`].
//!
//! Serves the endpoints the replicator talks to (`_local`, `_changes`,
//! `_revs_diff`, `_bulk_docs`, document GETs and database creation) for a
//! single database at [`MockRemote::URL`]. Every request is recorded, and
//! faults or latency can be injected per path.

use crate::rev_tree::RevTree;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use revsync_engine::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, ReplicationError, ReplicationResult,
    StreamingResponse,
};
use revsync_protocol::{parse_revision_history, Body, RevisionHistory};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Server-side `_changes` filter: `(doc_id, body, params)`.
pub type ChangesFilter = Arc<dyn Fn(&str, &Body, &BTreeMap<String, String>) -> bool + Send + Sync>;

const RESERVED_CHANGES_PARAMS: &[&str] = &[
    "feed",
    "since",
    "limit",
    "heartbeat",
    "filter",
    "style",
    "include_docs",
];

/// A request seen by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// Method.
    pub method: HttpMethod,
    /// Decoded path below the database, segments joined by `/`; empty for the root.
    pub path: String,
    /// Decoded query pairs.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
    /// `Authorization` header.
    pub authorization: Option<String>,
}

impl RecordedRequest {
    /// First value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// What an injected fault does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Answer with this status.
    Status(u16),
    /// Fail with a retryable transport error.
    Transport,
}

struct Fault {
    method: Option<HttpMethod>,
    path: String,
    kind: FaultKind,
    remaining: usize,
}

struct Reply {
    status: u16,
    chunks: Vec<Bytes>,
}

impl Reply {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            chunks: vec![Bytes::from(body.to_string())],
        }
    }

    fn error(status: u16, error: &str, reason: &str) -> Self {
        Self::json(status, json!({"error": error, "reason": reason}))
    }
}

struct RemoteState {
    exists: bool,
    docs: BTreeMap<String, RevTree>,
    last_sequence: u64,
    local_docs: BTreeMap<String, Body>,
    filters: HashMap<String, ChangesFilter>,
    rejected: HashSet<String>,
    faults: Vec<Fault>,
    latency: Vec<(String, Duration)>,
    requests: Vec<RecordedRequest>,
    longpoll_timeout: Duration,
    open_document_requests: usize,
    peak_document_requests: usize,
}

/// An in-memory remote database.
pub struct MockRemote {
    state: Mutex<RemoteState>,
    changed: Notify,
}

impl MockRemote {
    /// URL of the mock database.
    pub const URL: &'static str = "http://mock.test/db";

    /// Creates an existing, empty database.
    pub fn new() -> Arc<Self> {
        Self::with_existing(true)
    }

    /// Creates a mock whose database does not exist yet.
    pub fn missing() -> Arc<Self> {
        Self::with_existing(false)
    }

    fn with_existing(exists: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RemoteState {
                exists,
                docs: BTreeMap::new(),
                last_sequence: 0,
                local_docs: BTreeMap::new(),
                filters: HashMap::new(),
                rejected: HashSet::new(),
                faults: Vec::new(),
                latency: Vec::new(),
                requests: Vec::new(),
                longpoll_timeout: Duration::from_millis(100),
                open_document_requests: 0,
                peak_document_requests: 0,
            }),
            changed: Notify::new(),
        })
    }

    /// Stores an edit on top of the current revision of `doc_id`.
    pub fn put_document(&self, doc_id: &str, rev_id: &str, body: Value) -> u64 {
        self.edit(doc_id, rev_id, false, body)
    }

    /// Stores a deletion on top of the current revision of `doc_id`.
    pub fn delete_document(&self, doc_id: &str, rev_id: &str) -> u64 {
        self.edit(doc_id, rev_id, true, json!({}))
    }

    fn edit(&self, doc_id: &str, rev_id: &str, deleted: bool, body: Value) -> u64 {
        let sequence = {
            let mut state = self.state.lock();
            state.last_sequence += 1;
            let sequence = state.last_sequence;
            let tree = state.docs.entry(doc_id.to_string()).or_default();
            let mut history = vec![rev_id.to_string()];
            if let Some(parent) = tree.winning() {
                history.extend(tree.history(&parent.rev_id));
            }
            let body = match body {
                Value::Object(body) => body,
                _ => Body::new(),
            };
            tree.insert_history(&history, deleted, body, sequence);
            sequence
        };
        self.changed.notify_waiters();
        sequence
    }

    /// Registers a `_changes` filter under `name` (e.g. `app/mine`).
    pub fn add_filter(&self, name: &str, filter: ChangesFilter) {
        self.state.lock().filters.insert(name.to_string(), filter);
    }

    /// Makes `_bulk_docs` reject every revision of `doc_id`.
    pub fn reject_document(&self, doc_id: &str) {
        self.state.lock().rejected.insert(doc_id.to_string());
    }

    /// Injects a fault for the next `times` requests whose path starts with `path`.
    pub fn fail(&self, method: Option<HttpMethod>, path: &str, kind: FaultKind, times: usize) {
        self.state.lock().faults.push(Fault {
            method,
            path: path.to_string(),
            kind,
            remaining: times,
        });
    }

    /// Delays every request whose path starts with `path`.
    pub fn set_latency(&self, path: &str, latency: Duration) {
        self.state.lock().latency.push((path.to_string(), latency));
    }

    /// How long a `feed=longpoll` request waits for a change.
    pub fn set_longpoll_timeout(&self, timeout: Duration) {
        self.state.lock().longpoll_timeout = timeout;
    }

    /// Seeds a `_local` document.
    pub fn put_local(&self, id: &str, body: Value) {
        let mut body = match body {
            Value::Object(body) => body,
            _ => Body::new(),
        };
        body.insert("_id".into(), json!(format!("_local/{}", id)));
        body.insert("_rev".into(), json!("0-1"));
        self.state.lock().local_docs.insert(id.to_string(), body);
    }

    /// Reads a `_local` document.
    pub fn local_document(&self, id: &str) -> Option<Body> {
        self.state.lock().local_docs.get(id).cloned()
    }

    /// Current revision of a document with `_id` and `_rev`.
    pub fn document(&self, doc_id: &str) -> Option<Body> {
        let state = self.state.lock();
        let tree = state.docs.get(doc_id)?;
        let winner = tree.winning()?;
        let mut body = winner.body.clone().unwrap_or_default();
        body.insert("_id".into(), json!(doc_id));
        body.insert("_rev".into(), json!(winner.rev_id));
        if winner.deleted {
            body.insert("_deleted".into(), json!(true));
        }
        Some(body)
    }

    /// Returns true if the remote knows the revision.
    pub fn has_revision(&self, doc_id: &str, rev_id: &str) -> bool {
        self.state
            .lock()
            .docs
            .get(doc_id)
            .is_some_and(|tree| tree.contains(rev_id))
    }

    /// History of a revision, newest first.
    pub fn revision_history(&self, doc_id: &str, rev_id: &str) -> Vec<String> {
        self.state
            .lock()
            .docs
            .get(doc_id)
            .map(|tree| tree.history(rev_id))
            .unwrap_or_default()
    }

    /// Returns true once the database exists.
    pub fn exists(&self) -> bool {
        self.state.lock().exists
    }

    /// Latest update sequence.
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().last_sequence
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests with `method` whose path starts with `path`.
    pub fn requests_to(&self, method: HttpMethod, path: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|request| request.method == method && request.path.starts_with(path))
            .cloned()
            .collect()
    }

    /// Most document requests (paths not starting with `_`) ever open at once.
    pub fn peak_document_requests(&self) -> usize {
        self.state.lock().peak_document_requests
    }

    async fn dispatch(&self, request: &HttpRequest) -> ReplicationResult<Reply> {
        let mut segments: Vec<String> = request
            .url
            .path_segments()
            .map(|segments| segments.map(percent_decode).collect())
            .unwrap_or_default();
        if !segments.is_empty() {
            segments.remove(0);
        }
        segments.retain(|segment| !segment.is_empty());
        let path = segments.join("/");
        let query: Vec<(String, String)> = request
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let body: Option<Value> = request
            .body
            .as_ref()
            .and_then(|body| serde_json::from_slice(body).ok());

        let document = !path.is_empty() && !path.starts_with('_');
        trace!(method = ?request.method, path = %path, "mock remote request");

        let (fault, latency) = {
            let mut state = self.state.lock();
            if document {
                state.open_document_requests += 1;
                state.peak_document_requests = state
                    .peak_document_requests
                    .max(state.open_document_requests);
            }
            state.requests.push(RecordedRequest {
                method: request.method,
                path: path.clone(),
                query: query.clone(),
                body: body.clone(),
                authorization: request.header("Authorization").map(str::to_string),
            });
            let fault = state
                .faults
                .iter_mut()
                .find(|fault| {
                    fault.remaining > 0
                        && fault.method.map_or(true, |m| m == request.method)
                        && path.starts_with(&fault.path)
                })
                .map(|fault| {
                    fault.remaining -= 1;
                    fault.kind
                });
            let latency = state
                .latency
                .iter()
                .find(|(prefix, _)| path.starts_with(prefix.as_str()))
                .map(|(_, latency)| *latency);
            (fault, latency)
        };

        let reply = self
            .respond(request.method, &path, &segments, &query, body, fault, latency)
            .await;
        if document {
            self.state.lock().open_document_requests -= 1;
        }
        reply
    }

    #[allow(clippy::too_many_arguments)]
    async fn respond(
        &self,
        method: HttpMethod,
        path: &str,
        segments: &[String],
        query: &[(String, String)],
        body: Option<Value>,
        fault: Option<FaultKind>,
        latency: Option<Duration>,
    ) -> ReplicationResult<Reply> {
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(FaultKind::Transport) => {
                debug!(path = %path, "injecting transport failure");
                return Err(ReplicationError::transport_retryable("connection reset"));
            }
            Some(FaultKind::Status(status)) => {
                debug!(path = %path, status, "injecting error status");
                return Ok(Reply::error(status, "injected", "injected fault"));
            }
            None => {}
        }

        if path == "_changes" && self.exists() {
            return Ok(self.changes(query).await);
        }
        Ok(self.route(method, segments, query, body))
    }

    fn route(
        &self,
        method: HttpMethod,
        segments: &[String],
        query: &[(String, String)],
        body: Option<Value>,
    ) -> Reply {
        let mut state = self.state.lock();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        if segments.is_empty() {
            return match method {
                HttpMethod::Put if state.exists => {
                    Reply::error(412, "file_exists", "The database could not be created")
                }
                HttpMethod::Put => {
                    state.exists = true;
                    Reply::json(201, json!({"ok": true}))
                }
                _ if state.exists => Reply::json(
                    200,
                    json!({"db_name": "db", "update_seq": state.last_sequence}),
                ),
                _ => Reply::error(404, "not_found", "Database does not exist."),
            };
        }
        if !state.exists {
            return Reply::error(404, "not_found", "Database does not exist.");
        }

        let body = match body {
            Some(Value::Object(body)) => Some(body),
            _ => None,
        };
        let reply = match (method, segments.as_slice()) {
            (HttpMethod::Get, ["_local", id]) => match state.local_docs.get(*id) {
                Some(doc) => Reply::json(200, Value::Object(doc.clone())),
                None => Reply::error(404, "not_found", "missing"),
            },
            (HttpMethod::Put, ["_local", id]) => put_local(&mut state, id, body),
            (HttpMethod::Post, ["_revs_diff"]) => revs_diff(&state, body),
            (HttpMethod::Post, ["_bulk_docs"]) => bulk_docs(&mut state, body),
            (HttpMethod::Get, [doc_id]) => get_document(&state, doc_id, query),
            _ => Reply::error(405, "method_not_allowed", "Unsupported request"),
        };
        drop(state);
        if method != HttpMethod::Get {
            self.changed.notify_waiters();
        }
        reply
    }

    async fn changes(&self, query: &[(String, String)]) -> Reply {
        let param = |key: &str| {
            query
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let feed = param("feed").unwrap_or("normal");
        let since = param("since").and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        let limit = param("limit").and_then(|s| s.parse::<usize>().ok());
        let filter = param("filter").map(str::to_string);
        let params: BTreeMap<String, String> = query
            .iter()
            .filter(|(k, _)| !RESERVED_CHANGES_PARAMS.contains(&k.as_str()))
            .cloned()
            .collect();

        if feed == "longpoll" {
            let notified = self.changed.notified();
            let timeout = self.state.lock().longpoll_timeout;
            let mut rows = match self.change_rows(since, limit, filter.as_deref(), &params) {
                Ok(rows) => rows,
                Err(reply) => return reply,
            };
            if rows.is_empty() {
                let _ = tokio::time::timeout(timeout, notified).await;
                rows = match self.change_rows(since, limit, filter.as_deref(), &params) {
                    Ok(rows) => rows,
                    Err(reply) => return reply,
                };
            }
            let last_seq = rows.last().map_or(json!(since), |row| row["seq"].clone());
            return Reply::json(200, json!({"results": rows, "last_seq": last_seq}));
        }

        let rows = match self.change_rows(since, limit, filter.as_deref(), &params) {
            Ok(rows) => rows,
            Err(reply) => return reply,
        };
        let last_seq = rows.last().map_or(json!(since), |row| row["seq"].clone());
        let mut chunks = Vec::new();
        if feed == "continuous" {
            for row in &rows {
                chunks.push(Bytes::from(format!("{}\n", row)));
            }
            chunks.push(Bytes::from(format!("{}\n", json!({"last_seq": last_seq}))));
        } else {
            chunks.push(Bytes::from_static(b"{\"results\":[\n"));
            let count = rows.len();
            for (i, row) in rows.iter().enumerate() {
                let separator = if i + 1 < count { "," } else { "" };
                chunks.push(Bytes::from(format!("{}{}\n", row, separator)));
            }
            chunks.push(Bytes::from(format!("],\n\"last_seq\":{}}}\n", last_seq)));
        }
        Reply {
            status: 200,
            chunks,
        }
    }

    fn change_rows(
        &self,
        since: u64,
        limit: Option<usize>,
        filter: Option<&str>,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>, Reply> {
        let state = self.state.lock();
        let filter = match filter {
            Some(name) => match state.filters.get(name) {
                Some(filter) => Some(Arc::clone(filter)),
                None => return Err(Reply::error(404, "not_found", "missing filter")),
            },
            None => None,
        };

        let mut docs: Vec<(&String, &RevTree)> = state
            .docs
            .iter()
            .filter(|(_, tree)| tree.sequence() > since)
            .collect();
        docs.sort_by_key(|(_, tree)| tree.sequence());

        let mut rows = Vec::new();
        for (doc_id, tree) in docs {
            let Some(winner) = tree.winning() else {
                continue;
            };
            if let Some(filter) = &filter {
                let body = winner.body.clone().unwrap_or_default();
                if !filter(doc_id.as_str(), &body, params) {
                    continue;
                }
            }
            let changes: Vec<Value> = tree
                .leaves()
                .iter()
                .map(|leaf| json!({"rev": leaf.rev_id}))
                .collect();
            let mut row = json!({"seq": tree.sequence(), "id": doc_id, "changes": changes});
            if winner.deleted {
                row["deleted"] = json!(true);
            }
            rows.push(row);
            if limit.is_some_and(|limit| rows.len() >= limit) {
                break;
            }
        }
        Ok(rows)
    }
}

fn put_local(state: &mut RemoteState, id: &str, body: Option<Body>) -> Reply {
    let Some(mut body) = body else {
        return Reply::error(400, "bad_request", "Document must be a JSON object");
    };
    let current = state
        .local_docs
        .get(id)
        .and_then(|doc| doc.get("_rev"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let given = body.get("_rev").and_then(Value::as_str).map(str::to_string);
    if current != given {
        return Reply::error(409, "conflict", "Document update conflict.");
    }

    let generation = current
        .as_deref()
        .and_then(|rev| rev.strip_prefix("0-"))
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    let rev = format!("0-{}", generation + 1);
    let doc_id = format!("_local/{}", id);
    body.insert("_id".into(), json!(doc_id));
    body.insert("_rev".into(), json!(rev));
    state.local_docs.insert(id.to_string(), body);
    Reply::json(201, json!({"ok": true, "id": doc_id, "rev": rev}))
}

fn revs_diff(state: &RemoteState, body: Option<Body>) -> Reply {
    let Some(body) = body else {
        return Reply::error(400, "bad_request", "Request body must be a JSON object");
    };
    let mut response = serde_json::Map::new();
    for (doc_id, revs) in body {
        let missing: Vec<Value> = revs
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter(|rev| {
                !state
                    .docs
                    .get(&doc_id)
                    .is_some_and(|tree| tree.contains(rev))
            })
            .map(|rev| json!(rev))
            .collect();
        if !missing.is_empty() {
            response.insert(doc_id, json!({"missing": missing}));
        }
    }
    Reply::json(200, Value::Object(response))
}

fn bulk_docs(state: &mut RemoteState, body: Option<Body>) -> Reply {
    let Some(body) = body else {
        return Reply::error(400, "bad_request", "Request body must be a JSON object");
    };
    let docs = body
        .get("docs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut results = Vec::new();
    for doc in docs {
        let Value::Object(doc) = doc else {
            continue;
        };
        let id = doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
        let rev = doc.get("_rev").and_then(Value::as_str).unwrap_or_default().to_string();
        if state.rejected.contains(&id) {
            results.push(json!({"id": id, "error": "forbidden", "reason": "rejected"}));
            continue;
        }

        let history = parse_revision_history(&doc).unwrap_or_else(|| vec![rev.clone()]);
        let deleted = doc.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        let mut stored = doc;
        stored.retain(|key, _| !key.starts_with('_'));

        let sequence = state.last_sequence + 1;
        let tree = state.docs.entry(id.clone()).or_default();
        if tree.insert_history(&history, deleted, stored, sequence) {
            state.last_sequence = sequence;
        }
        results.push(json!({"id": id, "rev": rev}));
    }
    Reply::json(201, Value::Array(results))
}

fn get_document(state: &RemoteState, doc_id: &str, query: &[(String, String)]) -> Reply {
    let param = |key: &str| {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    let Some(tree) = state.docs.get(doc_id) else {
        return Reply::error(404, "not_found", "missing");
    };
    let stored = match param("rev") {
        Some(rev) => tree.get(rev),
        None => tree.winning(),
    };
    let Some(stored) = stored else {
        return Reply::error(404, "not_found", "missing");
    };
    let Some(mut body) = stored.body.clone() else {
        return Reply::error(404, "not_found", "missing");
    };

    body.insert("_id".into(), json!(doc_id));
    body.insert("_rev".into(), json!(stored.rev_id));
    if stored.deleted {
        body.insert("_deleted".into(), json!(true));
    }
    if param("revs") == Some("true") {
        let history = tree.history(&stored.rev_id);
        body.insert(
            "_revisions".into(),
            RevisionHistory::from_rev_ids(&history).to_value(),
        );
    }
    Reply::json(200, Value::Object(body))
}

/// Decodes `%XX` escapes in a URL path segment.
fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            let escaped = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = escaped {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

#[async_trait]
impl HttpClient for MockRemote {
    async fn execute(&self, request: HttpRequest) -> ReplicationResult<HttpResponse> {
        let reply = self.dispatch(&request).await?;
        Ok(HttpResponse::new(reply.status, reply.chunks.concat()))
    }

    async fn execute_streaming(&self, request: HttpRequest) -> ReplicationResult<StreamingResponse> {
        let reply = self.dispatch(&request).await?;
        Ok(StreamingResponse {
            status: reply.status,
            body: futures::stream::iter(reply.chunks.into_iter().map(Ok)).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revsync_engine::Url;

    fn request(method: HttpMethod, path: &str) -> HttpRequest {
        let url = Url::parse(&format!("{}/{}", MockRemote::URL, path)).unwrap();
        HttpRequest::new(method, url)
    }

    fn with_json(request: HttpRequest, body: Value) -> HttpRequest {
        request.with_body(Bytes::from(body.to_string()))
    }

    #[test]
    fn decodes_path_segments() {
        assert_eq!(percent_decode("a%20doc"), "a doc");
        assert_eq!(percent_decode("50%"), "50%");
        assert_eq!(percent_decode("%2"), "%2");
    }

    #[tokio::test]
    async fn local_documents_track_revisions() {
        let remote = MockRemote::new();
        let put = with_json(request(HttpMethod::Put, "_local/cp"), json!({"lastSequence": "3"}));
        let response = remote.execute(put).await.unwrap();
        assert_eq!(response.status, 201);
        let saved: Value = response.json().unwrap();
        assert_eq!(saved["rev"], "0-1");

        let stale = with_json(request(HttpMethod::Put, "_local/cp"), json!({"lastSequence": "4"}));
        assert_eq!(remote.execute(stale).await.unwrap().status, 409);

        let update = with_json(
            request(HttpMethod::Put, "_local/cp"),
            json!({"lastSequence": "4", "_rev": "0-1"}),
        );
        assert_eq!(remote.execute(update).await.unwrap().status, 201);
        assert_eq!(remote.local_document("cp").unwrap()["lastSequence"], "4");
    }

    #[tokio::test]
    async fn normal_changes_feed() {
        let remote = MockRemote::new();
        remote.put_document("a", "1-a", json!({}));
        remote.put_document("b", "1-b", json!({}));
        remote.delete_document("a", "2-a");

        let response = remote
            .execute_streaming(request(HttpMethod::Get, "_changes?feed=normal&since=1"))
            .await
            .unwrap();
        let body = response.collect().await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            parsed,
            json!({
                "results": [
                    {"seq": 2, "id": "b", "changes": [{"rev": "1-b"}]},
                    {"seq": 3, "id": "a", "changes": [{"rev": "2-a"}], "deleted": true},
                ],
                "last_seq": 3,
            })
        );
    }

    #[tokio::test]
    async fn bulk_docs_keeps_history() {
        let remote = MockRemote::new();
        let upload = with_json(
            request(HttpMethod::Post, "_bulk_docs"),
            json!({
                "new_edits": false,
                "docs": [{"_id": "d", "_rev": "2-b", "_revisions": {"start": 2, "ids": ["b", "a"]}, "x": 1}],
            }),
        );
        assert_eq!(remote.execute(upload).await.unwrap().status, 201);
        assert_eq!(remote.revision_history("d", "2-b"), vec!["2-b", "1-a"]);
        assert_eq!(remote.document("d").unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn injected_faults_run_out() {
        let remote = MockRemote::new();
        remote.fail(None, "_revs_diff", FaultKind::Status(503), 1);
        let diff = || with_json(request(HttpMethod::Post, "_revs_diff"), json!({}));
        assert_eq!(remote.execute(diff()).await.unwrap().status, 503);
        assert_eq!(remote.execute(diff()).await.unwrap().status, 200);
        assert_eq!(remote.requests_to(HttpMethod::Post, "_revs_diff").len(), 2);
    }
}
