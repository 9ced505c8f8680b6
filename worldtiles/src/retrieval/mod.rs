//! Tile retrieval: transports, the worker pool and retry policy.
//!
//! # Architecture
//!
//! ```text
//! submit(request, priority, callback)
//!        │
//!        ▼
//! ┌──────────────────┐   dedup by locator   ┌─────────────────┐
//! │ RetrievalService │ ───────────────────▶ │ PriorityQueue   │
//! └──────────────────┘                      └────────┬────────┘
//!                                                    │ workers
//!                                                    ▼
//!                                           ┌─────────────────┐
//!                                           │ RetrieverRouter │
//!                                           └─┬──────┬──────┬─┘
//!                                        http │ file │ zip+ │
//!                                             ▼      ▼      ▼
//!                                          RetrievalResult → callbacks
//! ```

pub mod http;
pub mod policy;
pub mod queue;
pub mod result;
pub mod retriever;
pub mod service;

pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use policy::RetryPolicy;
pub use result::{FetchRequest, FetchedBytes, RetrievalOutcome, RetrievalResult, Validators};
pub use retriever::{
    FileRetriever, HttpRetriever, IdentityRewriter, PassThroughZipRetriever, RegexRewriter,
    Retriever, RetrieverRouter, Scheme, UrlRewriter,
};
pub use service::{
    CompletionCallback, RetrievalConfig, RetrievalService, ServiceStats, TaskHandle, TaskId,
    TaskState,
};
