//! s3compat - S3-compatible storage client with verified writes, paginated
//! listings, batched deletes, region self-correction and presigned URLs

pub mod cli;
pub mod config;
pub mod core;
pub mod perf;
pub mod s3;

pub use config::Config;
pub use core::Core;
pub use s3::{StorageClient, StorageError};
