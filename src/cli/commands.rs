use anyhow::{Context, Result};
use std::fmt::Write as FmtWrite;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::Core;
use crate::perf::{
    FanOutSink, JsonLinesSink, Operation, OperationSummary, PerfHarness, PerfOptions,
    StatCollector, StatSink,
};
use crate::s3::{
    ByteRange, ListOptions, ObjectLocator, ObjectMetadata, PresignedUrlSpec, UserMetadata,
    WriteOptions, WriteRequest,
};

/// Which listing API `ls` walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    V1,
    V2,
    Versions,
}

// ============================================================================
// Formatting helpers
// ============================================================================

/// Format bytes in compact form (0B, 1.0KiB, 10MiB, etc.)
pub fn format_bytes_compact(bytes: u64) -> String {
    let mut buf = String::with_capacity(8);
    write_bytes_compact(&mut buf, bytes);
    buf
}

fn write_bytes_compact(w: &mut dyn std::fmt::Write, bytes: u64) {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes == 0 {
        let _ = w.write_str("0B");
        return;
    }

    let bytes_f64 = bytes as f64;
    let exponent = (bytes_f64.ln() / 1024_f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes_f64 / 1024_f64.powi(exponent as i32);

    if exponent == 0 {
        let _ = write!(w, "{}B", bytes);
    } else if value >= 10.0 {
        let _ = write!(w, "{:.0}{}", value, UNITS[exponent]);
    } else {
        let _ = write!(w, "{:.1}{}", value, UNITS[exponent]);
    }
}

/// Listing timestamps (`2026-01-22T20:44:33.219Z`) as `2026-01-22 20:44:33 UTC`
pub fn format_s3_date(date_str: Option<&str>) -> String {
    match date_str {
        Some(s) => match s.split_once('T') {
            Some((date, rest)) => {
                let time = rest.get(..8).unwrap_or_else(|| rest.trim_end_matches('Z'));
                format!("{} {} UTC", date, time)
            }
            None => s.to_string(),
        },
        // blank placeholder matching width
        None => " ".repeat(23),
    }
}

fn print_metadata(locator: &ObjectLocator, metadata: &ObjectMetadata) {
    println!("Object: {}", locator);
    println!(
        "Size: {} ({})",
        format_bytes_compact(metadata.content_length),
        metadata.content_length
    );
    println!("ETag: {}", metadata.etag);
    if let Some(version) = &metadata.version_id {
        println!("Version: {}", version);
    }
    if let Some(modified) = &metadata.last_modified {
        println!("Last Modified: {}", modified.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    for (name, value) in metadata.user_metadata.iter() {
        println!("Meta {}: {}", name, value);
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Resolve and print the bucket's region
pub async fn cmd_location(core: &Core, bucket: &str) -> Result<()> {
    let region = core
        .client()
        .resolve_region(bucket)
        .await
        .context(format!("Failed to resolve location of bucket {}", bucket))?;
    println!("{}", region);
    Ok(())
}

/// Object metadata command
pub async fn cmd_head(core: &Core, bucket: &str, key: &str, version_id: Option<&str>) -> Result<()> {
    core.ensure_region(bucket).await?;
    let mut locator = ObjectLocator::new(bucket, key);
    if let Some(version) = version_id {
        locator = locator.with_version(version);
    }
    let metadata = core.client().read_object_metadata(&locator).await?;
    print_metadata(&locator, &metadata);
    Ok(())
}

/// Download an object (or a range of it) to a file or stdout
pub async fn cmd_get(
    core: &Core,
    bucket: &str,
    key: &str,
    range: Option<ByteRange>,
    output: Option<&Path>,
) -> Result<()> {
    core.ensure_region(bucket).await?;
    let locator = ObjectLocator::new(bucket, key);
    let content = core.client().read_object(&locator, range, None).await?;

    match output {
        Some(path) => {
            tokio::fs::write(path, &content.body)
                .await
                .context(format!("Failed to write {}", path.display()))?;
            println!(
                "{} -> {} ({})",
                locator,
                path.display(),
                format_bytes_compact(content.body.len() as u64)
            );
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            out.write_all(&content.body)?;
            out.flush()?;
        }
    }
    Ok(())
}

/// Upload a local file and verify it landed
pub async fn cmd_put(
    core: &Core,
    bucket: &str,
    key: &str,
    file: &Path,
    metadata: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<()> {
    core.ensure_region(bucket).await?;

    let mut user_metadata = UserMetadata::new();
    for (name, value) in metadata {
        user_metadata.insert(name, value.clone());
    }
    let write = WriteRequest::from_file(
        bucket,
        key,
        file,
        WriteOptions {
            timeout,
            user_metadata,
        },
    )
    .context(format!("Failed to prepare upload of {}", file.display()))?;

    let outcome = core.client().write_object(&write).await?;
    println!(
        "{} -> s3://{}/{} ({})",
        file.display(),
        bucket,
        key,
        format_bytes_compact(write.content_length())
    );
    if let Some(version) = outcome.version_id {
        println!("  version {}", version);
    }
    Ok(())
}

/// List everything under a prefix
pub async fn cmd_ls(
    core: &Core,
    bucket: &str,
    prefix: &str,
    mode: ListMode,
    options: &ListOptions,
) -> Result<()> {
    core.ensure_region(bucket).await?;
    let client = core.client();

    let mut lines = Vec::new();
    let mut line = String::with_capacity(256);
    match mode {
        ListMode::V1 | ListMode::V2 => {
            let objects = if mode == ListMode::V1 {
                client.list_objects(bucket, prefix, options).await?
            } else {
                client.list_objects_v2(bucket, prefix, options).await?
            };
            for obj in &objects {
                line.clear();
                let _ = write!(line, "[{}] ", format_s3_date(obj.last_modified.as_deref()));
                let _ = write!(line, "{:>7} ", format_bytes_compact(obj.size));
                line.push_str(&obj.key);
                lines.push(line.clone());
            }
        }
        ListMode::Versions => {
            let versions = client.list_versions(bucket, prefix, options).await?;
            for v in &versions {
                line.clear();
                let _ = write!(line, "[{}] ", format_s3_date(v.last_modified.as_deref()));
                if v.is_delete_marker {
                    let _ = write!(line, "{:>7} ", "DEL");
                } else {
                    let _ = write!(line, "{:>7} ", format_bytes_compact(v.size));
                }
                let _ = write!(line, "{} {}", v.key, v.version_id);
                if v.is_latest {
                    line.push_str(" (latest)");
                }
                lines.push(line.clone());
            }
        }
    }
    let count = lines.len();

    // Buffer stdout to avoid per-line flush syscalls
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::with_capacity(64 * 1024, stdout.lock());
    for line in &lines {
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    drop(out);

    if count == 0 {
        println!("No objects found");
    }
    Ok(())
}

/// Delete one object or one version
pub async fn cmd_rm(core: &Core, bucket: &str, key: &str, version_id: Option<&str>) -> Result<()> {
    core.ensure_region(bucket).await?;
    let mut locator = ObjectLocator::new(bucket, key);
    if let Some(version) = version_id {
        locator = locator.with_version(version);
    }
    core.client().delete_object(&locator).await?;
    println!("Deleted: {}", locator);
    Ok(())
}

/// Delete every object under a prefix, one at a time
pub async fn cmd_rm_prefix(core: &Core, bucket: &str, prefix: &str) -> Result<()> {
    core.ensure_region(bucket).await?;
    println!("Deleting objects with prefix: {}", prefix);
    let deleted = core.client().delete_prefix(bucket, prefix).await?;
    println!("Total deleted: {} objects", deleted);
    Ok(())
}

/// Server-side copy
pub async fn cmd_cp(
    core: &Core,
    bucket: &str,
    source_key: &str,
    source_version: Option<&str>,
    dest_bucket: Option<&str>,
    dest_key: &str,
) -> Result<()> {
    core.ensure_region(bucket).await?;
    let mut source = ObjectLocator::new(bucket, source_key);
    if let Some(version) = source_version {
        source = source.with_version(version);
    }
    let dest = ObjectLocator::new(dest_bucket.unwrap_or(bucket), dest_key);

    let outcome = core.client().copy_object(&source, &dest).await?;
    println!("{} -> {}", source, dest);
    if let Some(version) = outcome.version_id {
        println!("  version {}", version);
    }
    Ok(())
}

/// Print a presigned URL
pub async fn cmd_presign(
    core: &Core,
    bucket: &str,
    key: &str,
    put: bool,
    lifetime: Option<u64>,
    content_type: Option<String>,
    response_content_encoding: Option<String>,
) -> Result<()> {
    core.ensure_region(bucket).await?;
    let mut spec = PresignedUrlSpec::get(bucket, key);
    if put {
        spec.method = hyper::Method::PUT;
    }
    spec.lifetime = lifetime.map(Duration::from_secs);
    spec.content_type = content_type;
    spec.response_content_encoding = response_content_encoding;

    let url = core.client().generate_presigned_url(&spec)?;
    println!("{}", url);
    Ok(())
}

/// Sinks for a perf run: always in memory, plus a JSON-lines file when asked
pub fn perf_sinks(stats_file: Option<&str>) -> Result<(Arc<StatCollector>, Arc<dyn StatSink>)> {
    let collector = Arc::new(StatCollector::new());
    let sink: Arc<dyn StatSink> = match stats_file {
        Some(path) => {
            let file = JsonLinesSink::open(path)
                .context(format!("Failed to open stats file {}", path))?;
            let sinks: Vec<Arc<dyn StatSink>> = vec![collector.clone(), Arc::new(file)];
            Arc::new(FanOutSink(sinks))
        }
        None => collector.clone(),
    };
    Ok((collector, sink))
}

/// Run the performance harness and print per-operation timings
pub async fn cmd_perf(
    core: &Core,
    collector: &StatCollector,
    bucket: &str,
    operations: Vec<Operation>,
    times: Option<u32>,
) -> Result<()> {
    core.ensure_region(bucket).await?;

    let perf = &core.config.perf;
    let mut options = PerfOptions::new(bucket, perf.prefix.clone(), times.unwrap_or(perf.times));
    options.operations = operations;

    println!(
        "Measuring {} time(s) each under s3://{}/{}",
        options.times, bucket, options.prefix
    );
    let mut harness = PerfHarness::new(core.client().clone(), options);
    let outcome = harness.run().await;

    print_summary(&collector.summary());
    outcome.context("Performance run failed")?;
    Ok(())
}

fn print_summary(summary: &[OperationSummary]) {
    println!();
    println!(
        "{:<22} {:>6} {:>6} {:>10} {:>10} {:>10}",
        "operation", "calls", "failed", "min ms", "avg ms", "max ms"
    );
    for row in summary {
        println!(
            "{:<22} {:>6} {:>6} {:>10} {:>10.1} {:>10}",
            row.operation.name(),
            row.count,
            row.failures,
            row.min_ms,
            row.avg_ms,
            row.max_ms
        );
    }
}
