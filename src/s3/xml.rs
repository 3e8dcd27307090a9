//! S3 XML wire format
//!
//! Parsers use byte-slice tag matching on `local_name()` and move text out
//! with `std::mem::take`. Text is not trimmed: object keys may legitimately
//! start or end with whitespace.

use crate::s3::error::{DeleteFailure, Result, StorageError};
use crate::s3::listing::{Cursor, ListingPage};
use crate::s3::types::{DeleteSpec, ObjectSummary, VersionSummary};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;

/// Element boundaries reported by [`walk`]
enum Node<'a> {
    Open(&'a [u8]),
    /// Closing tag with the text accumulated since the last boundary
    Close(&'a [u8], String),
}

/// Drive a reader over `xml`, reporting every element open/close.
///
/// Self-closing elements are reported as an open immediately followed by a
/// close with empty text.
fn walk(xml: &[u8], mut visit: impl FnMut(Node<'_>)) -> Result<()> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut current_text = String::with_capacity(256);
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                current_text.clear();
                visit(Node::Open(e.local_name().as_ref()));
            }
            Event::Empty(e) => {
                current_text.clear();
                let name = e.local_name();
                visit(Node::Open(name.as_ref()));
                visit(Node::Close(name.as_ref(), String::new()));
            }
            Event::Text(e) => current_text.push_str(&e.unescape()?),
            Event::CData(e) => current_text.push_str(&String::from_utf8_lossy(&e.into_inner())),
            Event::End(e) => {
                visit(Node::Close(e.local_name().as_ref(), std::mem::take(&mut current_text)));
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(())
}

/// Undo `encoding-type=url` on a key or marker: `+` is a space, then percent-decoding
pub fn decode_key(raw: &str) -> Result<String> {
    let plus_decoded = raw.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(|s| s.into_owned())
        .map_err(|e| StorageError::InvalidResponse(format!("undecodable key {:?}: {}", raw, e)))
}

fn check_encoding_type(encoding: &Option<String>) -> Result<bool> {
    match encoding.as_deref() {
        None | Some("") => Ok(false),
        Some(e) if e.eq_ignore_ascii_case("url") => Ok(true),
        Some(other) => Err(StorageError::InvalidResponse(format!(
            "unsupported EncodingType {:?}",
            other
        ))),
    }
}

fn parse_bool(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("true")
}

fn trim_etag(text: &str) -> String {
    text.trim().trim_matches('"').to_string()
}

/// Parse a ListObjects (v1) page.
///
/// Keys are still raw; the paginator decodes them when `encoding_was_url`.
pub fn parse_list_v1(xml: &[u8]) -> Result<ListingPage<ObjectSummary>> {
    parse_object_listing(xml, false)
}

/// Parse a ListObjectsV2 page
pub fn parse_list_v2(xml: &[u8]) -> Result<ListingPage<ObjectSummary>> {
    parse_object_listing(xml, true)
}

fn parse_object_listing(xml: &[u8], v2: bool) -> Result<ListingPage<ObjectSummary>> {
    let mut items = Vec::with_capacity(1000);
    let mut current: Option<ObjectSummary> = None;
    let mut is_truncated = false;
    let mut next_marker: Option<String> = None;
    let mut next_token: Option<String> = None;
    let mut encoding: Option<String> = None;

    walk(xml, |node| match node {
        Node::Open(b"Contents") => current = Some(ObjectSummary::new(String::new(), 0)),
        Node::Open(_) => {}
        Node::Close(name, text) => match (name, current.as_mut()) {
            (b"Key", Some(obj)) => obj.key = text,
            (b"Size", Some(obj)) => obj.size = text.trim().parse().unwrap_or(0),
            (b"ETag", Some(obj)) => obj.etag = trim_etag(&text),
            (b"LastModified", Some(obj)) => obj.last_modified = Some(text),
            (b"StorageClass", Some(obj)) => obj.storage_class = Some(text),
            (b"Contents", Some(_)) => {
                if let Some(obj) = current.take() {
                    items.push(obj);
                }
            }
            (b"IsTruncated", None) => is_truncated = parse_bool(&text),
            (b"NextMarker", None) => next_marker = Some(text),
            (b"NextContinuationToken", None) => next_token = Some(text),
            (b"EncodingType", None) => encoding = Some(text),
            _ => {}
        },
    })?;

    let encoding_was_url = check_encoding_type(&encoding)?;
    let next = if v2 {
        next_token.filter(|t| !t.is_empty()).map(Cursor::ContinuationToken)
    } else {
        next_marker.filter(|m| !m.is_empty()).map(Cursor::Marker)
    };

    Ok(ListingPage {
        items,
        is_truncated,
        next,
        encoding_was_url,
    })
}

/// Parse a ListObjectVersions page (versions and delete markers, in document order)
pub fn parse_list_versions(xml: &[u8]) -> Result<ListingPage<VersionSummary>> {
    let mut items = Vec::with_capacity(1000);
    let mut current: Option<VersionSummary> = None;
    let mut is_truncated = false;
    let mut next_key_marker: Option<String> = None;
    let mut next_version_id_marker: Option<String> = None;
    let mut encoding: Option<String> = None;

    walk(xml, |node| match node {
        Node::Open(b"Version") => current = Some(VersionSummary::new(String::new(), false)),
        Node::Open(b"DeleteMarker") => current = Some(VersionSummary::new(String::new(), true)),
        Node::Open(_) => {}
        Node::Close(name, text) => match (name, current.as_mut()) {
            (b"Key", Some(v)) => v.key = text,
            (b"VersionId", Some(v)) => v.version_id = text,
            (b"Size", Some(v)) => v.size = text.trim().parse().unwrap_or(0),
            (b"ETag", Some(v)) => v.etag = trim_etag(&text),
            (b"LastModified", Some(v)) => v.last_modified = Some(text),
            (b"IsLatest", Some(v)) => v.is_latest = parse_bool(&text),
            (b"Version", Some(_)) | (b"DeleteMarker", Some(_)) => {
                if let Some(v) = current.take() {
                    items.push(v);
                }
            }
            (b"IsTruncated", None) => is_truncated = parse_bool(&text),
            (b"NextKeyMarker", None) => next_key_marker = Some(text),
            (b"NextVersionIdMarker", None) => next_version_id_marker = Some(text),
            (b"EncodingType", None) => encoding = Some(text),
            _ => {}
        },
    })?;

    let encoding_was_url = check_encoding_type(&encoding)?;
    let next = next_key_marker
        .filter(|k| !k.is_empty())
        .map(|key_marker| Cursor::KeyVersion {
            key_marker,
            version_id_marker: next_version_id_marker.filter(|v| !v.is_empty()),
        });

    Ok(ListingPage {
        items,
        is_truncated,
        next,
        encoding_was_url,
    })
}

/// Outcome of one multi-object delete round trip
#[derive(Debug, Default)]
pub struct DeleteResult {
    pub deleted: Vec<(String, Option<String>)>,
    pub errors: Vec<DeleteFailure>,
}

/// Parse a DeleteResult document
pub fn parse_delete_result(xml: &[u8]) -> Result<DeleteResult> {
    let mut result = DeleteResult::default();
    let mut deleted: Option<(String, Option<String>)> = None;
    let mut error: Option<DeleteFailure> = None;

    walk(xml, |node| match node {
        Node::Open(b"Deleted") => deleted = Some((String::new(), None)),
        Node::Open(b"Error") => {
            error = Some(DeleteFailure {
                key: String::new(),
                version_id: None,
                code: String::new(),
                message: String::new(),
            })
        }
        Node::Open(_) => {}
        Node::Close(b"Key", text) => {
            if let Some(d) = deleted.as_mut() {
                d.0 = text;
            } else if let Some(e) = error.as_mut() {
                e.key = text;
            }
        }
        Node::Close(b"VersionId", text) => {
            let version = Some(text).filter(|v| !v.is_empty());
            if let Some(d) = deleted.as_mut() {
                d.1 = version;
            } else if let Some(e) = error.as_mut() {
                e.version_id = version;
            }
        }
        Node::Close(b"Code", text) => {
            if let Some(e) = error.as_mut() {
                e.code = text;
            }
        }
        Node::Close(b"Message", text) => {
            if let Some(e) = error.as_mut() {
                e.message = text;
            }
        }
        Node::Close(b"Deleted", _) => {
            if let Some(d) = deleted.take() {
                result.deleted.push(d);
            }
        }
        Node::Close(b"Error", _) => {
            if let Some(e) = error.take() {
                result.errors.push(e);
            }
        }
        Node::Close(..) => {}
    })?;

    Ok(result)
}

/// Build the body of a multi-object delete request
pub fn build_delete_request(specs: &[DeleteSpec]) -> String {
    let mut xml = String::with_capacity(specs.len() * 80 + 80);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Delete>");
    for spec in specs {
        xml.push_str("<Object><Key>");
        xml_escape_into(&mut xml, spec.key());
        xml.push_str("</Key>");
        if let Some(version) = spec.version_id() {
            xml.push_str("<VersionId>");
            xml_escape_into(&mut xml, version);
            xml.push_str("</VersionId>");
        }
        xml.push_str("</Object>");
    }
    xml.push_str("</Delete>");
    xml
}

/// Escape XML special characters into an existing buffer.
///
/// Control characters go out as numeric character references so they
/// survive attribute-value and line-ending normalization.
fn xml_escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&apos;"),
            c if c.is_control() => {
                buf.push_str("&#");
                buf.push_str(&(c as u32).to_string());
                buf.push(';');
            }
            _ => buf.push(ch),
        }
    }
}

/// A parsed `<Error>` document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorDocument {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
    /// Every other leaf element (`Region`, `BucketName`, `HostId`, ...)
    pub details: BTreeMap<String, String>,
}

/// Parse an S3 error body. Returns `None` when the root element is not `<Error>`.
pub fn parse_error(xml: &[u8]) -> Result<Option<ErrorDocument>> {
    let mut doc = ErrorDocument::default();
    let mut depth = 0usize;
    let mut root_is_error = None;

    walk(xml, |node| match node {
        Node::Open(name) => {
            if depth == 0 && root_is_error.is_none() {
                root_is_error = Some(name == b"Error");
            }
            depth += 1;
        }
        Node::Close(name, text) => {
            depth = depth.saturating_sub(1);
            // Only direct children of <Error>
            if depth != 1 || root_is_error != Some(true) {
                return;
            }
            match name {
                b"Code" => doc.code = text,
                b"Message" => doc.message = text,
                b"RequestId" => doc.request_id = Some(text),
                other => {
                    doc.details
                        .insert(String::from_utf8_lossy(other).into_owned(), text);
                }
            }
        }
    })?;

    Ok(match root_is_error {
        Some(true) => Some(doc),
        _ => None,
    })
}

/// Parse a GetBucketLocation body; an empty constraint is returned as ""
pub fn parse_location(xml: &[u8]) -> Result<String> {
    let mut location = None;
    walk(xml, |node| {
        if let Node::Close(b"LocationConstraint", text) = node {
            location = Some(text.trim().to_string());
        }
    })?;
    location.ok_or_else(|| {
        StorageError::InvalidResponse("missing LocationConstraint element".to_string())
    })
}

/// Parse a CopyObjectResult body, returning the new ETag.
///
/// A copy can answer 200 and still fail; that shows up as an `<Error>` root
/// and is returned as the inner `Err(doc)`.
pub fn parse_copy_result(xml: &[u8]) -> Result<std::result::Result<String, ErrorDocument>> {
    if let Some(doc) = parse_error(xml)? {
        return Ok(Err(doc));
    }
    let mut etag = None;
    walk(xml, |node| {
        if let Node::Close(b"ETag", text) = node {
            etag = Some(trim_etag(&text));
        }
    })?;
    etag.map(Ok).ok_or_else(|| {
        StorageError::InvalidResponse("copy response carries no ETag".to_string())
    })
}
