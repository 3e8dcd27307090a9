//! S3-compatible storage client with AWS SigV4 signing
//!
//! This module provides:
//! - [`StorageClient`], the façade over every supported operation
//! - [`Transport`], the signed-HTTP seam, and its hyper implementation
//! - listing pagination, bulk deletes, region resolution and presigning
//! - the XML wire codecs and the error taxonomy

pub mod client;
pub mod delete;
pub mod error;
pub mod listing;
pub mod presign;
pub mod region;
pub mod signer;
pub mod transport;
pub mod types;
pub mod xml;

// Re-export main types for convenience
pub use client::StorageClient;
pub use delete::MAX_DELETE_BATCH;
pub use error::{DeleteFailure, ProviderError, Result, StorageError, REGION_DETAIL};
pub use listing::{Cursor, ListingKind, ListingPage};
pub use region::{normalize_region, DEFAULT_REGION};
pub use signer::S3SignerV4;
pub use transport::{HttpRequest, HttpResponse, HyperTransport, Transport, TransportOptions};
pub use types::{
    ByteRange, BytesSource, ContentSource, ContentStream, CopyOutcome, DeleteSpec, FileSource,
    ListOptions, ObjectContent, ObjectLocator, ObjectMetadata, ObjectSummary, PresignedUrlSpec,
    ProviderMetadata, UserMetadata, VersionSummary, WriteOptions, WriteOutcome, WriteRequest,
    DEFAULT_PRESIGN_LIFETIME,
};
