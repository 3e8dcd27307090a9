//! Presigned URLs
//!
//! Issuing a URL is offline: the transport signs a request description with
//! an expiry and the endpoint enforces it when the URL is used.

use crate::perf::Operation;
use crate::s3::client::StorageClient;
use crate::s3::error::{Result, StorageError};
use crate::s3::types::PresignedUrlSpec;
use chrono::{DateTime, Utc};

impl StorageClient {
    /// Presign `spec` as of now
    pub fn generate_presigned_url(&self, spec: &PresignedUrlSpec) -> Result<String> {
        self.generate_presigned_url_at(spec, Utc::now())
    }

    /// Presign `spec` as if issued at `issued_at`; the URL expires at
    /// `issued_at + lifetime`
    pub fn generate_presigned_url_at(
        &self,
        spec: &PresignedUrlSpec,
        issued_at: DateTime<Utc>,
    ) -> Result<String> {
        if spec.key.trim().is_empty() {
            return Err(StorageError::validation("object key may not be blank"));
        }
        let mut timer = self.timer(Operation::GeneratePresignedUrl, &spec.bucket, Some(&spec.key));

        let mut request = self
            .request(spec.method.clone(), &spec.bucket)
            .key(spec.key.clone());
        if let Some(content_type) = &spec.content_type {
            request = request.header("content-type", content_type.clone());
        }
        if let Some(encoding) = &spec.response_content_encoding {
            request = request.query("response-content-encoding", encoding.clone());
        }

        let lifetime = spec.effective_lifetime();
        let url = self.transport().presign(&request, issued_at, lifetime)?;
        tracing::debug!(
            bucket = %spec.bucket,
            key = %spec.key,
            method = %spec.method,
            lifetime_secs = lifetime.as_secs(),
            "presigned url issued"
        );
        timer.succeeded(None);
        Ok(url)
    }
}
