//! Retrievers: the transports that turn a locator into bytes.
//!
//! Each transport implements [`Retriever`]; [`RetrieverRouter`] picks one by
//! locator scheme:
//!
//! | scheme                    | retriever                    |
//! |---------------------------|------------------------------|
//! | `http`, `https`           | [`HttpRetriever`]            |
//! | `file`, bare path         | [`FileRetriever`]            |
//! | `zip+http`, `zip+https`   | [`PassThroughZipRetriever`]  |
//!
//! Retrievers never fail out-of-band: every error is reported inside the
//! returned [`RetrievalResult`].

use super::http::{HttpClient, HttpResponse};
use super::result::{FetchRequest, FetchedBytes, RetrievalResult, Validators};
use crate::compression::{self, Compression};
use crate::error::TransportError;
use bytes::BytesMut;
use futures::future::BoxFuture;
use regex::Regex;
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const FILE_CHUNK_SIZE: usize = 64 * 1024;
const ZIP_SCHEME_PREFIX: &str = "zip+";

/// A transport able to fetch a locator.
pub trait Retriever: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Fetches `request.locator`, aborting early when `cancel` fires.
    fn fetch<'a>(
        &'a self,
        request: &'a FetchRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RetrievalResult>;
}

// =============================================================================
// URL rewriting
// =============================================================================

/// Rewrites locators before they are sent over the network.
pub trait UrlRewriter: Send + Sync {
    fn rewrite<'a>(&self, url: &'a str) -> Cow<'a, str>;
}

/// Leaves URLs untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRewriter;

impl UrlRewriter for IdentityRewriter {
    fn rewrite<'a>(&self, url: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(url)
    }
}

/// Applies regex substitution rules in order.
#[derive(Debug, Clone, Default)]
pub struct RegexRewriter {
    rules: Vec<(Regex, String)>,
}

impl RegexRewriter {
    /// Compiles `(pattern, replacement)` pairs. Replacements may use `$1`
    /// style capture references.
    pub fn new<'a, I>(rules: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let rules = rules
            .into_iter()
            .map(|(pattern, replacement)| Ok((Regex::new(pattern)?, replacement.to_string())))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl UrlRewriter for RegexRewriter {
    fn rewrite<'a>(&self, url: &'a str) -> Cow<'a, str> {
        let mut current = Cow::Borrowed(url);
        for (pattern, replacement) in &self.rules {
            if pattern.is_match(&current) {
                current = Cow::Owned(pattern.replace_all(&current, replacement.as_str()).into_owned());
            }
        }
        current
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// Fetches over HTTP(S), inflating gzip/zip bodies.
pub struct HttpRetriever<C> {
    client: C,
    rewriter: Arc<dyn UrlRewriter>,
}

impl<C: HttpClient> HttpRetriever<C> {
    pub fn new(client: C) -> Self {
        Self::with_rewriter(client, Arc::new(IdentityRewriter))
    }

    pub fn with_rewriter(client: C, rewriter: Arc<dyn UrlRewriter>) -> Self {
        Self { client, rewriter }
    }
}

impl<C: HttpClient> Retriever for HttpRetriever<C> {
    fn name(&self) -> &'static str {
        "http"
    }

    fn fetch<'a>(
        &'a self,
        request: &'a FetchRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RetrievalResult> {
        Box::pin(async move {
            let url = self.rewriter.rewrite(&request.locator);
            match http_fetch(&self.client, &url, request, cancel).await {
                Ok(response) => {
                    let fetched = inflate_response(response);
                    RetrievalResult::fetched(request.locator.clone(), fetched)
                }
                Err(result) => result,
            }
        })
    }
}

/// Fetches `zip+http(s)` locators and stores the compressed body verbatim.
pub struct PassThroughZipRetriever<C> {
    client: C,
    rewriter: Arc<dyn UrlRewriter>,
}

impl<C: HttpClient> PassThroughZipRetriever<C> {
    pub fn new(client: C) -> Self {
        Self::with_rewriter(client, Arc::new(IdentityRewriter))
    }

    pub fn with_rewriter(client: C, rewriter: Arc<dyn UrlRewriter>) -> Self {
        Self { client, rewriter }
    }
}

impl<C: HttpClient> Retriever for PassThroughZipRetriever<C> {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn fetch<'a>(
        &'a self,
        request: &'a FetchRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RetrievalResult> {
        Box::pin(async move {
            let stripped = request
                .locator
                .strip_prefix(ZIP_SCHEME_PREFIX)
                .unwrap_or(&request.locator);
            let url = self.rewriter.rewrite(stripped);
            match http_fetch(&self.client, &url, request, cancel).await {
                Ok(response) => RetrievalResult::fetched(
                    request.locator.clone(),
                    FetchedBytes {
                        bytes: response.body,
                        content_type: response.content_type,
                        validators: Validators {
                            etag: response.etag,
                            last_modified: response.last_modified,
                        },
                        compressed: true,
                    },
                ),
                Err(result) => result,
            }
        })
    }
}

/// Runs the GET and maps non-success answers to a finished result.
async fn http_fetch<C: HttpClient>(
    client: &C,
    url: &str,
    request: &FetchRequest,
    cancel: &CancellationToken,
) -> Result<HttpResponse, RetrievalResult> {
    let locator = request.locator.clone();
    let response = match client.get(url, request.validators.as_ref(), cancel).await {
        Ok(response) => response,
        Err(_) if cancel.is_cancelled() => return Err(RetrievalResult::cancelled(locator)),
        Err(e) => {
            debug!(url = %url, error = %e, "HTTP request failed");
            return Err(RetrievalResult::failed(locator, e));
        }
    };

    if cancel.is_cancelled() {
        return Err(RetrievalResult::cancelled(locator));
    }

    match response.status {
        304 => Err(RetrievalResult::not_modified(locator)),
        404 => Err(RetrievalResult::failed(
            locator,
            TransportError::NotFound(url.to_string()),
        )),
        code if !response.is_success() => Err(RetrievalResult::failed(
            locator,
            TransportError::Status {
                url: url.to_string(),
                code,
            },
        )),
        _ => Ok(response),
    }
}

/// Inflates an HTTP body flagged as gzip/zip by its headers.
///
/// Bodies are never sniffed here; the decoder knows the dataset's content
/// kind and decides whether magic bytes are meaningful.
///
/// A body that fails to inflate is passed on still flagged as compressed, so
/// the decoder reports the failure against the tile.
fn inflate_response(response: HttpResponse) -> FetchedBytes {
    let header_hint = response
        .content_encoding
        .as_deref()
        .or(response.content_type.as_deref())
        .map(Compression::from_header)
        .unwrap_or(Compression::None);

    let validators = Validators {
        etag: response.etag,
        last_modified: response.last_modified,
    };

    if header_hint == Compression::None {
        return FetchedBytes {
            bytes: response.body,
            content_type: response.content_type,
            validators,
            compressed: false,
        };
    }

    match compression::decompress(&response.body) {
        Ok(bytes) => FetchedBytes {
            bytes,
            content_type: response.content_type,
            validators,
            compressed: false,
        },
        Err(e) => {
            warn!(error = %e, "Failed to inflate HTTP body, passing through compressed");
            FetchedBytes {
                bytes: response.body,
                content_type: response.content_type,
                validators,
                compressed: true,
            }
        }
    }
}

// =============================================================================
// File
// =============================================================================

/// Reads `file://` locators and bare paths from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileRetriever;

impl FileRetriever {
    pub fn new() -> Self {
        Self
    }

    async fn read(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> RetrievalResult {
        let locator = request.locator.clone();
        let path = Path::new(file_path(&request.locator));
        let io_error = |e: std::io::Error| TransportError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return RetrievalResult::failed(
                    locator,
                    TransportError::NotFound(path.display().to_string()),
                );
            }
            Err(e) => return RetrievalResult::failed(locator, io_error(e)),
        };
        let modified = metadata.modified().ok();

        if let (Some(since), Some(mtime)) = (
            request.validators.as_ref().and_then(|v| v.last_modified),
            modified,
        ) {
            if mtime <= since {
                return RetrievalResult::not_modified(locator);
            }
        }

        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) => return RetrievalResult::failed(locator, io_error(e)),
        };

        let mut body = BytesMut::with_capacity(metadata.len() as usize);
        let mut chunk = vec![0u8; FILE_CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return RetrievalResult::cancelled(locator);
            }
            match file.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(e) => return RetrievalResult::failed(locator, io_error(e)),
            }
        }

        let bytes = body.freeze();
        let compressed = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("zip"));
        RetrievalResult::fetched(
            locator,
            FetchedBytes {
                bytes,
                content_type: None,
                validators: Validators {
                    etag: None,
                    last_modified: modified,
                },
                compressed,
            },
        )
    }
}

impl Retriever for FileRetriever {
    fn name(&self) -> &'static str {
        "file"
    }

    fn fetch<'a>(
        &'a self,
        request: &'a FetchRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RetrievalResult> {
        Box::pin(self.read(request, cancel))
    }
}

fn file_path(locator: &str) -> &str {
    locator.strip_prefix("file://").unwrap_or(locator)
}

// =============================================================================
// Router
// =============================================================================

/// Transport chosen for a locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    File,
    PassThroughZip,
}

impl Scheme {
    /// Classifies a locator by its scheme prefix.
    pub fn of(locator: &str) -> Result<Self, TransportError> {
        let Some((scheme, _)) = locator.split_once("://") else {
            return Ok(Scheme::File);
        };
        match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(Scheme::Http),
            "file" => Ok(Scheme::File),
            "zip+http" | "zip+https" => Ok(Scheme::PassThroughZip),
            other => Err(TransportError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Dispatches requests to the retriever registered for their scheme.
pub struct RetrieverRouter {
    http: Arc<dyn Retriever>,
    file: Arc<dyn Retriever>,
    zip: Arc<dyn Retriever>,
}

impl RetrieverRouter {
    /// Builds the standard set of retrievers over one HTTP client.
    pub fn new<C>(client: C, rewriter: Arc<dyn UrlRewriter>) -> Self
    where
        C: HttpClient + Clone + 'static,
    {
        Self {
            http: Arc::new(HttpRetriever::with_rewriter(client.clone(), rewriter.clone())),
            file: Arc::new(FileRetriever::new()),
            zip: Arc::new(PassThroughZipRetriever::with_rewriter(client, rewriter)),
        }
    }

    /// Builds a router from explicit retrievers.
    pub fn with_retrievers(
        http: Arc<dyn Retriever>,
        file: Arc<dyn Retriever>,
        zip: Arc<dyn Retriever>,
    ) -> Self {
        Self { http, file, zip }
    }

    fn route(&self, scheme: Scheme) -> &dyn Retriever {
        match scheme {
            Scheme::Http => self.http.as_ref(),
            Scheme::File => self.file.as_ref(),
            Scheme::PassThroughZip => self.zip.as_ref(),
        }
    }
}

impl Retriever for RetrieverRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    fn fetch<'a>(
        &'a self,
        request: &'a FetchRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, RetrievalResult> {
        match Scheme::of(&request.locator) {
            Ok(scheme) => self.route(scheme).fetch(request, cancel),
            Err(e) => {
                let result = RetrievalResult::failed(request.locator.clone(), e);
                Box::pin(async move { result })
            }
        }
    }
}
