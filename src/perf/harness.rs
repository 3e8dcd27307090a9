//! Performance harness
//!
//! Runs selected storage operations N times against a measured client. Any
//! objects an operation needs are written first through an unmeasured
//! client sharing the same transport, so only the operation under test is
//! timed. Everything under the run prefix is removed afterwards, including
//! old versions, whether or not the run succeeded.

use crate::perf::Operation;
use crate::s3::{
    DeleteSpec, ListOptions, ObjectLocator, PresignedUrlSpec, Result, StorageClient,
    WriteOptions, WriteRequest,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

/// What to run
#[derive(Debug, Clone)]
pub struct PerfOptions {
    pub bucket: String,
    /// Every object the run creates lives under this prefix
    pub prefix: String,
    /// Repetitions per operation
    pub times: u32,
    /// Operations to run, in order; empty runs all of them
    pub operations: Vec<Operation>,
    /// Size of the generated fixture objects
    pub object_size: usize,
}

impl PerfOptions {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>, times: u32) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
            times,
            operations: Vec::new(),
            object_size: 1024,
        }
    }
}

type Step = for<'h> fn(&'h PerfHarness, u32) -> BoxFuture<'h, Result<()>>;

/// Operation name to runner
const STEPS: &[(Operation, Step)] = &[
    (Operation::GetBucketLocation, PerfHarness::step_get_bucket_location),
    (Operation::GetObject, PerfHarness::step_get_object),
    (Operation::GetObjectMetadata, PerfHarness::step_get_object_metadata),
    (Operation::PutObject, PerfHarness::step_put_object),
    (Operation::CopyObject, PerfHarness::step_copy_object),
    (Operation::ListObjects, PerfHarness::step_list_objects),
    (Operation::ListObjectsV2, PerfHarness::step_list_objects_v2),
    (Operation::ListVersions, PerfHarness::step_list_versions),
    (Operation::DeleteObject, PerfHarness::step_delete_object),
    (Operation::DeleteObjects, PerfHarness::step_delete_objects),
    (Operation::SetRegion, PerfHarness::step_set_region),
    (Operation::GeneratePresignedUrl, PerfHarness::step_generate_presigned_url),
];

/// Times storage operations against one bucket
pub struct PerfHarness {
    measured: Arc<StorageClient>,
    setup: StorageClient,
    options: PerfOptions,
    payload: Bytes,
    fixture: Option<ObjectLocator>,
}

impl PerfHarness {
    pub fn new(measured: Arc<StorageClient>, options: PerfOptions) -> Self {
        let setup = measured.unmeasured();
        let payload = Bytes::from(
            (0..options.object_size)
                .map(|i| b'a' + (i % 26) as u8)
                .collect::<Vec<u8>>(),
        );
        Self {
            measured,
            setup,
            options,
            payload,
            fixture: None,
        }
    }

    /// Write fixtures, run every selected operation, then tear down.
    ///
    /// The first failing operation stops the run; teardown still happens.
    pub async fn run(&mut self) -> Result<()> {
        let outcome = self.run_steps().await;
        self.tear_down().await;
        outcome
    }

    async fn run_steps(&mut self) -> Result<()> {
        let fixture_key = format!("{}/fixture_1", self.options.prefix);
        let fixture = self.put_unmeasured(&fixture_key).await?;
        self.fixture = Some(fixture);

        let selected: Vec<Operation> = if self.options.operations.is_empty() {
            STEPS.iter().map(|(op, _)| *op).collect()
        } else {
            self.options.operations.clone()
        };

        for operation in selected {
            let step = STEPS
                .iter()
                .find(|(op, _)| *op == operation)
                .map(|(_, step)| *step);
            let Some(step) = step else {
                continue;
            };
            tracing::info!(operation = %operation, times = self.options.times, "measuring");
            step(self, self.options.times).await?;
        }
        Ok(())
    }

    /// Remove every version of everything under the prefix
    async fn tear_down(&self) {
        let versions = match self
            .setup
            .list_versions(
                &self.options.bucket,
                &self.options.prefix,
                &ListOptions::default().url_encoded(),
            )
            .await
        {
            Ok(versions) => versions,
            Err(e) => {
                tracing::warn!(error = %e, prefix = %self.options.prefix, "perf cleanup listing failed");
                return;
            }
        };

        let specs: Vec<DeleteSpec> = versions
            .into_iter()
            .filter_map(|v| {
                let version = Some(v.version_id).filter(|id| !id.is_empty() && id != "null");
                DeleteSpec::new(v.key, version).ok()
            })
            .collect();

        match self.setup.delete_objects(&self.options.bucket, &specs).await {
            Ok(deleted) => tracing::info!(deleted, prefix = %self.options.prefix, "perf cleanup done"),
            Err(e) => tracing::warn!(error = %e, prefix = %self.options.prefix, "perf cleanup failed"),
        }
    }

    fn fixture(&self) -> ObjectLocator {
        self.fixture
            .clone()
            .unwrap_or_else(|| ObjectLocator::new(&self.options.bucket, format!("{}/fixture_1", self.options.prefix)))
    }

    fn write_request(&self, key: &str) -> Result<WriteRequest> {
        WriteRequest::from_bytes(
            self.options.bucket.clone(),
            key,
            self.payload.clone(),
            WriteOptions::default(),
        )
    }

    async fn put_unmeasured(&self, key: &str) -> Result<ObjectLocator> {
        let outcome = self.setup.write_object(&self.write_request(key)?).await?;
        let mut locator = ObjectLocator::new(&self.options.bucket, key);
        if let Some(version) = outcome.version_id {
            locator = locator.with_version(version);
        }
        Ok(locator)
    }

    async fn put_many_unmeasured(&self, dir: &str, count: u32) -> Result<Vec<ObjectLocator>> {
        let mut written = Vec::with_capacity(count as usize);
        for i in 0..count {
            let key = format!("{}/{}/tempfile_{}", self.options.prefix, dir, i);
            written.push(self.put_unmeasured(&key).await?);
        }
        Ok(written)
    }

    fn step_get_bucket_location(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            for _ in 0..times {
                self.measured.resolve_region(&self.options.bucket).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn step_get_object(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let fixture = self.fixture();
            for _ in 0..times {
                self.measured.read_object(&fixture, None, None).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn step_get_object_metadata(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let fixture = self.fixture();
            for _ in 0..times {
                self.measured.read_object_metadata(&fixture).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn step_put_object(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            for i in 0..times {
                let key = format!("{}/putObject/tempfile_{}", self.options.prefix, i);
                self.measured.write_object(&self.write_request(&key)?).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn step_copy_object(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let fixture = self.fixture();
            for i in 0..times {
                let dest = ObjectLocator::new(
                    &self.options.bucket,
                    format!("{}/copyObject/dst_{}", self.options.prefix, i),
                );
                self.measured.copy_object(&fixture, &dest).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn step_list_objects(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let dir = format!("{}/listObjects", self.options.prefix);
            self.put_many_unmeasured("listObjects", times).await?;
            for _ in 0..times {
                self.measured
                    .list_objects(&self.options.bucket, &dir, &ListOptions::default())
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn step_list_objects_v2(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let dir = format!("{}/listObjectsV2", self.options.prefix);
            self.put_many_unmeasured("listObjectsV2", times).await?;
            for _ in 0..times {
                self.measured
                    .list_objects_v2(&self.options.bucket, &dir, &ListOptions::default())
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn step_list_versions(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let fixture = self.fixture();
            for _ in 0..times {
                self.measured
                    .list_versions(&self.options.bucket, &fixture.key, &ListOptions::default())
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn step_delete_object(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let written = self.put_many_unmeasured("deleteObject", times).await?;
            for locator in written {
                // Latest version only; teardown removes the rest
                let locator = ObjectLocator::new(locator.bucket, locator.key);
                self.measured.delete_object(&locator).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn step_delete_objects(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let written = self.put_many_unmeasured("deleteObjects", times).await?;
            let specs = written
                .into_iter()
                .map(|l| DeleteSpec::new(l.key, l.version_id))
                .collect::<Result<Vec<_>>>()?;
            self.measured
                .delete_objects(&self.options.bucket, &specs)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn step_set_region(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let region = self.measured.region();
            for _ in 0..times {
                self.measured.set_region(&region);
            }
            Ok(())
        }
        .boxed()
    }

    fn step_generate_presigned_url(&self, times: u32) -> BoxFuture<'_, Result<()>> {
        async move {
            let fixture = self.fixture();
            for _ in 0..times {
                self.measured
                    .generate_presigned_url(&PresignedUrlSpec::get(&fixture.bucket, &fixture.key))?;
            }
            Ok(())
        }
        .boxed()
    }
}
