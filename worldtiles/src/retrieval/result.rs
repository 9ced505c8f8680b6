//! Requests and outcomes exchanged with retrievers.

use crate::error::TransportError;
use bytes::Bytes;
use std::time::SystemTime;

/// Cache validators used for conditional fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// A single retrieval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub locator: String,
    /// When set, the retriever may answer [`RetrievalOutcome::NotModified`].
    pub validators: Option<Validators>,
}

impl FetchRequest {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            validators: None,
        }
    }

    pub fn conditional(locator: impl Into<String>, validators: Validators) -> Self {
        Self {
            locator: locator.into(),
            validators: if validators.is_empty() {
                None
            } else {
                Some(validators)
            },
        }
    }
}

/// Bytes delivered by a retriever.
#[derive(Debug, Clone)]
pub struct FetchedBytes {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub validators: Validators,
    /// Bytes are still zip/gzip-compressed and must be inflated on use.
    pub compressed: bool,
}

impl FetchedBytes {
    pub fn plain(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
            validators: Validators::default(),
            compressed: false,
        }
    }
}

/// How a retrieval ended.
#[derive(Debug, Clone)]
pub enum RetrievalOutcome {
    Fetched(FetchedBytes),
    /// The validators matched; the caller's copy is still current.
    NotModified,
    Failed(TransportError),
    Cancelled,
}

/// Outcome of retrieving one locator. Cloning shares the byte buffer.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub locator: String,
    pub outcome: RetrievalOutcome,
}

impl RetrievalResult {
    pub fn fetched(locator: impl Into<String>, bytes: FetchedBytes) -> Self {
        Self {
            locator: locator.into(),
            outcome: RetrievalOutcome::Fetched(bytes),
        }
    }

    pub fn not_modified(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            outcome: RetrievalOutcome::NotModified,
        }
    }

    pub fn failed(locator: impl Into<String>, error: TransportError) -> Self {
        Self {
            locator: locator.into(),
            outcome: RetrievalOutcome::Failed(error),
        }
    }

    pub fn cancelled(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            outcome: RetrievalOutcome::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            RetrievalOutcome::Fetched(_) | RetrievalOutcome::NotModified
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_with_empty_validators_is_plain() {
        let req = FetchRequest::conditional("http://a", Validators::default());
        assert!(req.validators.is_none());

        let req = FetchRequest::conditional(
            "http://a",
            Validators {
                etag: Some("\"abc\"".into()),
                last_modified: None,
            },
        );
        assert!(req.validators.is_some());
    }

    #[test]
    fn test_clone_shares_bytes() {
        let result = RetrievalResult::fetched("x", FetchedBytes::plain(vec![1u8, 2, 3]));
        let copy = result.clone();
        match (&result.outcome, &copy.outcome) {
            (RetrievalOutcome::Fetched(a), RetrievalOutcome::Fetched(b)) => {
                assert_eq!(a.bytes.as_ptr(), b.bytes.as_ptr());
            }
            _ => panic!("expected fetched"),
        }
    }

    #[test]
    fn test_success_classification() {
        assert!(RetrievalResult::not_modified("x").is_success());
        assert!(!RetrievalResult::cancelled("x").is_success());
        assert!(!RetrievalResult::failed("x", TransportError::NotFound("x".into())).is_success());
    }
}
