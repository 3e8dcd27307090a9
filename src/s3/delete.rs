//! Bulk deletes
//!
//! Multi-object delete takes at most [`MAX_DELETE_BATCH`] keys per request.
//! Per-key failures inside a batch do not stop the remaining batches; they
//! are collected and reported together with the number of keys deleted.

use crate::perf::Operation;
use crate::s3::client::StorageClient;
use crate::s3::error::{DeleteFailure, Result, StorageError};
use crate::s3::types::{DeleteSpec, ListOptions, ObjectLocator};
use crate::s3::xml;
use base64::Engine;
use bytes::Bytes;
use hyper::Method;

/// Provider cap on keys per multi-object delete
pub const MAX_DELETE_BATCH: usize = 1000;

impl StorageClient {
    /// Delete every spec, [`MAX_DELETE_BATCH`] keys per request.
    ///
    /// Returns the number of keys deleted. When any key is refused, every
    /// batch still runs and the result is [`StorageError::PartialDelete`].
    /// A batch whose request fails outright stops the run with
    /// [`StorageError::DeleteInterrupted`] carrying the count deleted by the
    /// batches before it. An empty slice returns 0 without a request.
    pub async fn delete_objects(&self, bucket: &str, specs: &[DeleteSpec]) -> Result<usize> {
        if specs.is_empty() {
            return Ok(0);
        }
        let mut timer = self.timer(Operation::DeleteObjects, bucket, None);

        let mut deleted = 0usize;
        let mut failed: Vec<DeleteFailure> = Vec::new();
        for (index, batch) in specs.chunks(MAX_DELETE_BATCH).enumerate() {
            let result = match self.delete_batch(bucket, batch).await {
                Ok(result) => result,
                Err(source) => {
                    tracing::warn!(
                        bucket = %bucket,
                        batch = index,
                        deleted,
                        refused = failed.len(),
                        error = %source,
                        "bulk delete interrupted"
                    );
                    return Err(StorageError::DeleteInterrupted {
                        deleted,
                        source: Box::new(source),
                    });
                }
            };
            tracing::debug!(
                bucket = %bucket,
                batch = index,
                requested = batch.len(),
                deleted = result.deleted.len(),
                failed = result.errors.len(),
                "delete batch"
            );
            deleted += result.deleted.len();
            failed.extend(result.errors);
        }

        if !failed.is_empty() {
            tracing::warn!(
                bucket = %bucket,
                deleted,
                failed = failed.len(),
                first_code = %failed[0].code,
                "bulk delete partially failed"
            );
            return Err(StorageError::PartialDelete { deleted, failed });
        }

        timer.succeeded(Some(deleted as u64));
        Ok(deleted)
    }

    async fn delete_batch(&self, bucket: &str, batch: &[DeleteSpec]) -> Result<xml::DeleteResult> {
        let body = xml::build_delete_request(batch).into_bytes();

        let md5_hash = md5::compute(&body);
        let md5_base64 = base64::engine::general_purpose::STANDARD.encode(&md5_hash[..]);

        // "?delete=" so the canonical query string is "delete="
        let request = self
            .request(Method::POST, bucket)
            .query("delete", "")
            .header("content-type", "application/xml")
            .header("content-md5", md5_base64)
            .body(Bytes::from(body));

        let response = self.send(request).await?;
        xml::parse_delete_result(&response.body)
    }

    /// Delete everything under `prefix`, one object at a time.
    ///
    /// Not atomic. A failure part way through returns
    /// [`StorageError::DeleteInterrupted`] with the count deleted so far.
    pub async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize> {
        let objects = self
            .list_objects_v2(bucket, prefix, &ListOptions::default())
            .await?;

        let mut deleted = 0usize;
        for object in objects {
            let locator = ObjectLocator::new(bucket, object.key);
            if let Err(source) = self.delete_object(&locator).await {
                tracing::warn!(bucket = %bucket, key = %locator.key, deleted, "prefix delete interrupted");
                return Err(StorageError::DeleteInterrupted {
                    deleted,
                    source: Box::new(source),
                });
            }
            deleted += 1;
        }

        tracing::debug!(bucket = %bucket, prefix = %prefix, deleted, "prefix deleted");
        Ok(deleted)
    }
}
