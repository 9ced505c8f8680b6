//! HTTP client abstraction for testability

use super::result::Validators;
use crate::error::TransportError;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::header::{
    HeaderName, CONTENT_ENCODING, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("worldtiles/", env!("CARGO_PKG_VERSION"));

/// Raw HTTP response as seen by retrievers.
///
/// Non-success statuses are returned as responses, not errors; the body is
/// only read for 2xx answers.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for HTTP client operations.
///
/// This abstraction allows for dependency injection and easier testing
/// by enabling mock HTTP clients in tests.
pub trait HttpClient: Send + Sync {
    /// Performs a GET request, conditional when `validators` are given.
    ///
    /// Implementations should stop reading the body and return
    /// [`TransportError::Aborted`] once `cancel` is triggered.
    fn get<'a>(
        &'a self,
        url: &'a str,
        validators: Option<&'a Validators>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>>;
}

impl<T: HttpClient + ?Sized> HttpClient for Arc<T> {
    fn get<'a>(
        &'a self,
        url: &'a str,
        validators: Option<&'a Validators>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        (**self).get(url, validators, cancel)
    }
}

/// Real HTTP client implementation using reqwest.
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with default timeouts.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_USER_AGENT)
    }

    /// Creates a client with custom timeouts and user agent.
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Http {
                url: String::new(),
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }

    async fn execute(
        &self,
        url: &str,
        validators: Option<&Validators>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self.client.get(url);
        if let Some(v) = validators {
            if let Some(etag) = &v.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(modified) = v.last_modified {
                request = request.header(IF_MODIFIED_SINCE, format_http_date(modified));
            }
        }

        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Aborted(url.to_string())),
            sent = request.send() => sent.map_err(|e| map_reqwest_error(url, e))?,
        };

        let headers = response.headers();
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let mut out = HttpResponse {
            status: response.status().as_u16(),
            content_type: header(CONTENT_TYPE),
            content_encoding: header(CONTENT_ENCODING),
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED).and_then(|s| parse_http_date(&s)),
            body: Bytes::new(),
        };

        if !out.is_success() {
            return Ok(out);
        }

        let mut body = BytesMut::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Aborted(url.to_string())),
                chunk = response.chunk() => chunk.map_err(|e| map_reqwest_error(url, e))?,
            };
            match chunk {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }
        trace!(url = %url, bytes = body.len(), "HTTP body received");

        out.body = body.freeze();
        Ok(out)
    }
}

impl HttpClient for ReqwestClient {
    fn get<'a>(
        &'a self,
        url: &'a str,
        validators: Option<&'a Validators>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(self.execute(url, validators, cancel))
    }
}

fn map_reqwest_error(url: &str, e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(url.to_string())
    } else {
        TransportError::Http {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

/// Formats a timestamp as an RFC 7231 HTTP date.
pub fn format_http_date(time: SystemTime) -> String {
    let dt: DateTime<Utc> = time.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an RFC 7231 HTTP date.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc).into())
}
