//! Listing paginator
//!
//! Flat (marker), list-v2 (continuation token) and version (key/version-id
//! marker) listings share one loop: fetch a page, decode keys if the page was
//! url-encoded, append, follow the cursor until the provider stops
//! truncating. Round trips are strictly sequential since every request
//! carries the cursor of the previous response.

use crate::s3::error::{Result, StorageError};
use crate::s3::types::{ListOptions, ObjectSummary, VersionSummary};
use crate::s3::xml::decode_key;
use std::collections::HashSet;
use std::future::Future;

/// Which listing protocol a paginated call speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingKind {
    /// ListObjects (v1), `marker` / `NextMarker`
    Objects,
    /// ListObjectsV2, `continuation-token` / `NextContinuationToken`
    ObjectsV2,
    /// ListObjectVersions, `key-marker` + `version-id-marker`
    Versions,
}

impl ListingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingKind::Objects => "list_objects",
            ListingKind::ObjectsV2 => "list_objects_v2",
            ListingKind::Versions => "list_versions",
        }
    }
}

/// Where the next page starts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cursor {
    Marker(String),
    /// Provider-opaque; always resubmitted byte-for-byte
    ContinuationToken(String),
    KeyVersion {
        key_marker: String,
        version_id_marker: Option<String>,
    },
}

/// One round trip's worth of listing
#[derive(Debug, Clone)]
pub struct ListingPage<T> {
    pub items: Vec<T>,
    pub is_truncated: bool,
    pub next: Option<Cursor>,
    pub encoding_was_url: bool,
}

/// A listing row carrying an object key
pub trait ListItem {
    fn key(&self) -> &str;
    fn set_key(&mut self, key: String);
}

impl ListItem for ObjectSummary {
    fn key(&self) -> &str {
        &self.key
    }

    fn set_key(&mut self, key: String) {
        self.key = key;
    }
}

impl ListItem for VersionSummary {
    fn key(&self) -> &str {
        &self.key
    }

    fn set_key(&mut self, key: String) {
        self.key = key;
    }
}

/// Reject options no provider can honour
pub fn validate_options(options: &ListOptions) -> Result<()> {
    if options.page_size == Some(0) {
        return Err(StorageError::validation("page size must be positive"));
    }
    Ok(())
}

/// Query parameters for one page request
pub fn list_query(
    kind: ListingKind,
    prefix: &str,
    options: &ListOptions,
    cursor: Option<&Cursor>,
) -> Vec<(String, String)> {
    let mut query = Vec::with_capacity(6);
    match kind {
        ListingKind::ObjectsV2 => query.push(("list-type".to_string(), "2".to_string())),
        ListingKind::Versions => query.push(("versions".to_string(), String::new())),
        ListingKind::Objects => {}
    }
    if !prefix.is_empty() {
        query.push(("prefix".to_string(), prefix.to_string()));
    }
    if let Some(size) = options.page_size {
        query.push(("max-keys".to_string(), size.to_string()));
    }
    if options.url_encoding {
        query.push(("encoding-type".to_string(), "url".to_string()));
    }
    match cursor {
        Some(Cursor::Marker(marker)) => query.push(("marker".to_string(), marker.clone())),
        Some(Cursor::ContinuationToken(token)) => {
            query.push(("continuation-token".to_string(), token.clone()))
        }
        Some(Cursor::KeyVersion {
            key_marker,
            version_id_marker,
        }) => {
            query.push(("key-marker".to_string(), key_marker.clone()));
            if let Some(v) = version_id_marker {
                query.push(("version-id-marker".to_string(), v.clone()));
            }
        }
        None => {}
    }
    query
}

/// Work out the cursor for the page after `page`.
///
/// Marker-style cursors echo an object key, so they come back url-encoded
/// when the page did and must be decoded before resubmission. Continuation
/// tokens are never touched. A truncated v1 page without `NextMarker`
/// continues after its last key.
fn next_cursor<T: ListItem>(kind: ListingKind, page: &ListingPage<T>) -> Result<Option<Cursor>> {
    if !page.is_truncated {
        return Ok(None);
    }
    let next = match (&page.next, kind) {
        (Some(Cursor::ContinuationToken(token)), _) => Some(Cursor::ContinuationToken(token.clone())),
        (Some(Cursor::Marker(marker)), _) if page.encoding_was_url => {
            Some(Cursor::Marker(decode_key(marker)?))
        }
        (
            Some(Cursor::KeyVersion {
                key_marker,
                version_id_marker,
            }),
            _,
        ) if page.encoding_was_url => Some(Cursor::KeyVersion {
            key_marker: decode_key(key_marker)?,
            version_id_marker: version_id_marker.clone(),
        }),
        (Some(other), _) => Some(other.clone()),
        // Items are decoded by now, so the last key is already plain
        (None, ListingKind::Objects) => page
            .items
            .last()
            .map(|item| Cursor::Marker(item.key().to_string())),
        (None, _) => None,
    };
    Ok(next)
}

/// Drive a listing to exhaustion.
///
/// `fetch` issues one page request for the given cursor (`None` for the
/// first page). Items come back in provider order, across all pages.
pub async fn paginate<T, F, Fut>(kind: ListingKind, mut fetch: F) -> Result<Vec<T>>
where
    T: ListItem,
    F: FnMut(Option<Cursor>) -> Fut,
    Fut: Future<Output = Result<ListingPage<T>>>,
{
    let mut all = Vec::new();
    let mut cursor: Option<Cursor> = None;
    let mut seen: HashSet<Cursor> = HashSet::new();
    let mut pages = 0usize;

    loop {
        let mut page = fetch(cursor.clone()).await?;
        pages += 1;

        if page.encoding_was_url {
            for item in page.items.iter_mut() {
                let decoded = decode_key(item.key())?;
                item.set_key(decoded);
            }
        }

        let next = next_cursor(kind, &page)?;
        tracing::trace!(
            listing = kind.as_str(),
            page = pages,
            items = page.items.len(),
            truncated = page.is_truncated,
            "listing page"
        );
        all.append(&mut page.items);

        match next {
            Some(next) => {
                // A cursor handed out twice means the provider is cycling
                if !seen.insert(next.clone()) {
                    return Err(StorageError::InvalidResponse(format!(
                        "{} cursor did not advance: {:?}",
                        kind.as_str(),
                        next
                    )));
                }
                cursor = Some(next);
            }
            None => break,
        }
    }

    tracing::debug!(listing = kind.as_str(), pages, items = all.len(), "listing complete");
    Ok(all)
}
