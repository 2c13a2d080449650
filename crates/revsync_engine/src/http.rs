//! HTTP transport abstraction.
//!
//! The replicator talks to the remote through [`HttpClient`], so tests can
//! route requests to an in-memory server and applications can bring their
//! own client. [`ReqwestClient`] is the production implementation.

use crate::error::{ReplicationError, ReplicationResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use std::fmt;

pub use reqwest::Url;

/// HTTP method used by the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// PUT
    Put,
    /// POST
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
        })
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL, without userinfo.
    pub url: Url,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> ReplicationResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Converts a non-2xx response into an error.
    pub fn error_for_status(self) -> ReplicationResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            let message = String::from_utf8_lossy(&self.body).trim().to_string();
            Err(ReplicationError::http(self.status, message))
        }
    }
}

/// A response whose body is read incrementally.
pub struct StreamingResponse {
    /// Status code.
    pub status: u16,
    /// Body chunks.
    pub body: BoxStream<'static, ReplicationResult<Bytes>>,
}

impl StreamingResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Reads the whole body.
    pub async fn collect(mut self) -> ReplicationResult<Bytes> {
        let mut buffer = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buffer))
    }
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// HTTP client abstraction.
///
/// Implementations return any status as a response; only failures to get a
/// response at all are errors.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and reads the whole response.
    async fn execute(&self, request: HttpRequest) -> ReplicationResult<HttpResponse>;

    /// Sends a request and returns the body as a stream.
    async fn execute_streaming(&self, request: HttpRequest)
        -> ReplicationResult<StreamingResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing `reqwest` client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, request: HttpRequest) -> ReplicationResult<reqwest::Response> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut builder = self.client.request(method, request.url);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder.send().await.map_err(transport_error)
    }
}

fn transport_error(err: reqwest::Error) -> ReplicationError {
    let retryable = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
    ReplicationError::Transport {
        message: err.to_string(),
        retryable,
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: HttpRequest) -> ReplicationResult<HttpResponse> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(transport_error)?;
        Ok(HttpResponse { status, body })
    }

    async fn execute_streaming(
        &self,
        request: HttpRequest,
    ) -> ReplicationResult<StreamingResponse> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error))
            .boxed();
        Ok(StreamingResponse { status, body })
    }
}
