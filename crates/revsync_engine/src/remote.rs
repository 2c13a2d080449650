//! Requests against the remote database.

use crate::config::RetryConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, StreamingResponse, Url};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// The remote database a replicator talks to.
///
/// Credentials in the configured URL are removed from request URLs and sent
/// pre-emptively as a Basic `Authorization` header instead.
pub struct RemoteDatabase {
    url: Url,
    authorization: Option<String>,
    has_credentials: bool,
    client: Arc<dyn HttpClient>,
    retry: RetryConfig,
}

impl RemoteDatabase {
    /// Creates a handle for `remote_url`.
    pub fn new(
        remote_url: &str,
        client: Arc<dyn HttpClient>,
        retry: RetryConfig,
    ) -> ReplicationResult<Self> {
        let mut url = Url::parse(remote_url)
            .map_err(|e| ReplicationError::InvalidUrl(format!("{}: {}", remote_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
            return Err(ReplicationError::InvalidUrl(format!(
                "{}: expected an http(s) URL",
                remote_url
            )));
        }

        let username = url.username().to_string();
        let password = url.password().map(str::to_string);
        let has_credentials = !username.is_empty() || password.is_some();
        let authorization = has_credentials.then(|| {
            let credentials = format!("{}:{}", username, password.unwrap_or_default());
            format!("Basic {}", STANDARD.encode(credentials))
        });
        if has_credentials {
            // Both only fail for URLs that cannot be a base, ruled out above.
            let _ = url.set_username("");
            let _ = url.set_password(None);
        }
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            url,
            authorization,
            has_credentials,
            client,
            retry,
        })
    }

    /// Returns the database URL without credentials.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the URL with any credentials shown as `---:---`, for logging.
    pub fn masked_url(&self) -> String {
        if !self.has_credentials {
            return self.url.to_string();
        }
        let mut masked = self.url.clone();
        let _ = masked.set_username("---");
        let _ = masked.set_password(Some("---"));
        masked.to_string()
    }

    /// Builds the URL of a path below the database, percent-encoding each segment.
    pub fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Url {
        let mut url = self.url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    /// Creates a request carrying the JSON and auth headers.
    pub fn request(&self, method: HttpMethod, url: Url) -> HttpRequest {
        let mut request =
            HttpRequest::new(method, url).with_header("Accept", "application/json");
        if let Some(auth) = &self.authorization {
            request = request.with_header("Authorization", auth.clone());
        }
        request
    }

    /// Sends a request, retrying transient failures.
    ///
    /// Non-2xx responses become [`ReplicationError::Http`].
    pub async fn send(&self, mut request: HttpRequest) -> ReplicationResult<HttpResponse> {
        if request.body.is_some() {
            request = request.with_header("Content-Type", "application/json");
        }

        let mut attempt = 0;
        loop {
            let result = self
                .client
                .execute(request.clone())
                .await
                .and_then(HttpResponse::error_for_status);

            match result {
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        method = %request.method,
                        path = request.url.path(),
                        attempt,
                        error = %err,
                        "retrying remote request in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => {
                    debug!(
                        method = %request.method,
                        path = request.url.path(),
                        status = response.status,
                        "remote request finished"
                    );
                    return Ok(response);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// GETs a path and returns the response.
    pub async fn get(&self, segments: &[&str], query: &[(&str, &str)]) -> ReplicationResult<HttpResponse> {
        let url = self.endpoint(segments, query);
        self.send(self.request(HttpMethod::Get, url)).await
    }

    /// Sends a JSON body with `method` to a path.
    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: HttpMethod,
        segments: &[&str],
        body: &B,
    ) -> ReplicationResult<HttpResponse> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        let url = self.endpoint(segments, &[]);
        self.send(self.request(method, url).with_body(body)).await
    }

    /// Opens a streaming GET. Not retried; the caller owns reconnection.
    pub async fn open_stream(&self, url: Url) -> ReplicationResult<StreamingResponse> {
        self.client
            .execute_streaming(self.request(HttpMethod::Get, url))
            .await
    }
}

impl fmt::Display for RemoteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked_url())
    }
}

impl fmt::Debug for RemoteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDatabase")
            .field("url", &self.masked_url())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
