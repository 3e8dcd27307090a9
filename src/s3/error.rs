//! Error taxonomy for the storage client
//!
//! Every operation returns [`StorageError`]. Provider-side failures keep the
//! full S3 error document in [`ProviderError`] so callers can assert on the
//! exact code, status and request id.

use hyper::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Detail key under which providers report the bucket's real region.
pub const REGION_DETAIL: &str = "Region";

/// A well-formed error response from the storage endpoint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status} {code}: {message}")]
pub struct ProviderError {
    /// HTTP status of the response
    pub status: StatusCode,
    /// Provider error code (`NoSuchKey`, `AuthorizationHeaderMalformed`, ...)
    pub code: String,
    /// Human readable message
    pub message: String,
    /// `x-amz-request-id` or `<RequestId>`
    pub request_id: Option<String>,
    /// Every other leaf element of the error document (e.g. `Region`, `BucketName`)
    pub details: BTreeMap<String, String>,
}

impl ProviderError {
    /// Build an error with no detail map
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            request_id: None,
            details: BTreeMap::new(),
        }
    }

    /// The region the provider says the bucket actually lives in, if any.
    ///
    /// A provider error carrying this detail is a region mismatch.
    pub fn corrected_region(&self) -> Option<&str> {
        self.details
            .get(REGION_DETAIL)
            .map(String::as_str)
            .filter(|r| !r.is_empty())
    }

    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

/// One key the provider refused to delete inside a multi-object delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub version_id: Option<String>,
    pub code: String,
    pub message: String,
}

/// Storage client errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("{} of {} keys failed to delete", failed.len(), deleted + failed.len())]
    PartialDelete {
        deleted: usize,
        failed: Vec<DeleteFailure>,
    },

    #[error("Deleted {deleted} objects before failing: {source}")]
    DeleteInterrupted {
        deleted: usize,
        source: Box<StorageError>,
    },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// The provider error behind this failure, if it came from the endpoint
    pub fn provider(&self) -> Option<&ProviderError> {
        match self {
            StorageError::Provider(e) => Some(e),
            StorageError::DeleteInterrupted { source, .. } => source.provider(),
            _ => None,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        StorageError::Validation(msg.into())
    }
}

impl From<quick_xml::Error> for StorageError {
    fn from(err: quick_xml::Error) -> Self {
        StorageError::XmlParse(err.to_string())
    }
}

impl From<quick_xml::escape::EscapeError> for StorageError {
    fn from(err: quick_xml::escape::EscapeError) -> Self {
        StorageError::XmlParse(err.to_string())
    }
}

impl From<hyper::http::Error> for StorageError {
    fn from(err: hyper::http::Error) -> Self {
        StorageError::Transport(format!("Request build error: {}", err))
    }
}

impl From<hyper::Error> for StorageError {
    fn from(err: hyper::Error) -> Self {
        StorageError::Transport(format!("Body error: {}", err))
    }
}

impl From<hyper_util::client::legacy::Error> for StorageError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        StorageError::Transport(format!("Request failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
