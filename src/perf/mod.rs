//! Operation timing
//!
//! A [`StatTimer`] is started around one storage call and records an
//! [`OperationStat`] into a [`StatSink`] when it goes out of scope, on
//! success and failure paths alike. Sinks are owned by the client instance
//! they are attached to; nothing here is process-global.

pub mod harness;

pub use harness::{PerfHarness, PerfOptions};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Storage operations that can be timed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    GetBucketLocation,
    GetObject,
    GetObjectMetadata,
    PutObject,
    ListObjects,
    ListObjectsV2,
    ListVersions,
    DeleteObject,
    DeleteObjects,
    CopyObject,
    SetRegion,
    GeneratePresignedUrl,
}

impl Operation {
    pub const ALL: [Operation; 12] = [
        Operation::GetBucketLocation,
        Operation::GetObject,
        Operation::GetObjectMetadata,
        Operation::PutObject,
        Operation::ListObjects,
        Operation::ListObjectsV2,
        Operation::ListVersions,
        Operation::DeleteObject,
        Operation::DeleteObjects,
        Operation::CopyObject,
        Operation::SetRegion,
        Operation::GeneratePresignedUrl,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetBucketLocation => "getBucketLocation",
            Operation::GetObject => "getObject",
            Operation::GetObjectMetadata => "getObjectMetadata",
            Operation::PutObject => "putObject",
            Operation::ListObjects => "listObjects",
            Operation::ListObjectsV2 => "listObjectsV2",
            Operation::ListVersions => "listVersions",
            Operation::DeleteObject => "deleteObject",
            Operation::DeleteObjects => "deleteObjects",
            Operation::CopyObject => "copyObject",
            Operation::SetRegion => "setRegion",
            Operation::GeneratePresignedUrl => "generatePresignedUrl",
        }
    }

    /// Case-insensitive lookup by [`name`](Operation::name)
    pub fn lookup(name: &str) -> Option<Operation> {
        let name = name.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.name().eq_ignore_ascii_case(name))
    }

    pub fn supported_names() -> String {
        Self::ALL
            .iter()
            .map(|op| op.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One timed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStat {
    pub operation: Operation,
    pub bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Content length for object calls, item count for listings and deletes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub elapsed_ms: u64,
    pub succeeded: bool,
}

/// Destination for finished stats
pub trait StatSink: Send + Sync {
    fn record(&self, stat: OperationStat);
}

/// Appends one JSON document per line to a file
pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl StatSink for JsonLinesSink {
    fn record(&self, stat: OperationStat) {
        let line = match serde_json::to_string(&stat) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize operation stat");
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!(error = %e, "failed to write operation stat");
        }
    }
}

/// Summary of every stat recorded for one operation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSummary {
    pub operation: Operation,
    /// Number of timed calls
    pub count: usize,
    /// Calls that returned an error
    pub failures: usize,
    pub min_ms: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

/// Keeps stats in memory
#[derive(Default)]
pub struct StatCollector {
    stats: Mutex<Vec<OperationStat>>,
}

impl StatCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Vec<OperationStat> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Per-operation min/avg/max, ordered by operation
    pub fn summary(&self) -> Vec<OperationSummary> {
        let stats = self.stats();
        let mut by_op: BTreeMap<Operation, Vec<&OperationStat>> = BTreeMap::new();
        for stat in &stats {
            by_op.entry(stat.operation).or_default().push(stat);
        }
        by_op
            .into_iter()
            .map(|(operation, stats)| {
                let total: u64 = stats.iter().map(|s| s.elapsed_ms).sum();
                OperationSummary {
                    operation,
                    count: stats.len(),
                    failures: stats.iter().filter(|s| !s.succeeded).count(),
                    min_ms: stats.iter().map(|s| s.elapsed_ms).min().unwrap_or(0),
                    avg_ms: total as f64 / stats.len() as f64,
                    max_ms: stats.iter().map(|s| s.elapsed_ms).max().unwrap_or(0),
                }
            })
            .collect()
    }
}

impl StatSink for StatCollector {
    fn record(&self, stat: OperationStat) {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(stat);
    }
}

/// Forwards every stat to several sinks
pub struct FanOutSink(pub Vec<Arc<dyn StatSink>>);

impl StatSink for FanOutSink {
    fn record(&self, stat: OperationStat) {
        for sink in &self.0 {
            sink.record(stat.clone());
        }
    }
}

/// Scoped timer; records on drop.
///
/// A timer that is dropped without [`succeeded`](StatTimer::succeeded) being
/// called records a failed call.
pub struct StatTimer {
    sink: Option<Arc<dyn StatSink>>,
    operation: Operation,
    bucket: String,
    key: Option<String>,
    size: Option<u64>,
    succeeded: bool,
    started: Instant,
}

impl StatTimer {
    pub fn start(
        sink: Option<Arc<dyn StatSink>>,
        operation: Operation,
        bucket: &str,
        key: Option<&str>,
    ) -> Self {
        Self {
            // Skip the allocations when nothing listens
            bucket: if sink.is_some() { bucket.to_string() } else { String::new() },
            key: sink.as_ref().and(key.map(str::to_string)),
            sink,
            operation,
            size: None,
            succeeded: false,
            started: Instant::now(),
        }
    }

    /// Mark the call successful, with its content length or item count
    pub fn succeeded(&mut self, size: Option<u64>) {
        self.succeeded = true;
        self.size = size;
    }
}

impl Drop for StatTimer {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.record(OperationStat {
                operation: self.operation,
                bucket: std::mem::take(&mut self.bucket),
                key: self.key.take(),
                size: self.size,
                elapsed_ms: self.started.elapsed().as_millis() as u64,
                succeeded: self.succeeded,
            });
        }
    }
}
