use crate::perf::Operation;
use crate::s3::ByteRange;

/// Parse a byte range argument.
///
/// `0-8` is the first nine bytes, `100-` is everything from offset 100.
pub fn parse_range(value: &str) -> anyhow::Result<ByteRange> {
    let value = value.trim();
    let value = value.strip_prefix("bytes=").unwrap_or(value);

    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("Invalid range {:?}. Expected: start-end or start-", value))?;

    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid range start in {:?}", value))?;

    if end.trim().is_empty() {
        return Ok(ByteRange::from(start));
    }
    let end: u64 = end
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid range end in {:?}", value))?;

    Ok(ByteRange::closed(start, end)?)
}

/// Parse a `name=value` user metadata pair
pub fn parse_metadata(value: &str) -> anyhow::Result<(String, String)> {
    match value.split_once('=') {
        Some((name, v)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), v.to_string()))
        }
        _ => anyhow::bail!("Invalid metadata {:?}. Expected: name=value", value),
    }
}

/// Parse a comma-separated list of operation names
pub fn parse_operations(value: &str) -> anyhow::Result<Vec<Operation>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            Operation::lookup(name).ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown operation {:?}. Supported: {}",
                    name,
                    Operation::supported_names()
                )
            })
        })
        .collect()
}
