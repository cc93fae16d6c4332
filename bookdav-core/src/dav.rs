//! WebDAV plumbing: request bodies, multistatus parsing, HTTP dates.

use std::time::SystemTime;

use percent_encoding::percent_decode_str;
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::Method;
use reqwest::header::HeaderMap;
use url::Url;

use crate::error::SyncError;

pub(crate) const DIR_ETAG_PROPFIND: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:getetag/></d:prop></d:propfind>"#;

pub(crate) const LISTING_PROPFIND: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns"><d:prop><d:resourcetype/><oc:checksums/></d:prop></d:propfind>"#;

pub(crate) const LOCK_MTIME_PROPFIND: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:getlastmodified/></d:prop></d:propfind>"#;

pub(crate) fn propfind_method() -> Method {
    Method::from_bytes(b"PROPFIND").expect("valid method")
}

pub(crate) fn mkcol_method() -> Method {
    Method::from_bytes(b"MKCOL").expect("valid method")
}

/// One `<d:response>` of a multistatus document, reduced to the properties
/// this engine asks for.
#[derive(Debug, Default, Clone)]
pub(crate) struct DavEntry {
    pub href: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub sha1: Option<String>,
    pub is_collection: bool,
}

enum Field {
    None,
    Href,
    Etag,
    LastModified,
    Checksum,
}

/// Streaming tag matcher over a multistatus body, keyed on local names so
/// namespace prefixes do not matter. Properties a server omits (or reports
/// under a 404 propstat as empty elements) simply stay `None`.
pub(crate) fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, SyncError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut field = Field::None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"response" => current = Some(DavEntry::default()),
                b"href" => field = Field::Href,
                b"getetag" => field = Field::Etag,
                b"getlastmodified" => field = Field::LastModified,
                b"checksum" => field = Field::Checksum,
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"collection"
                    && let Some(entry) = current.as_mut()
                {
                    entry.is_collection = true;
                }
            }
            Ok(Event::Text(ref t)) => {
                if let Some(entry) = current.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|err| malformed(format!("bad text node: {err}")))?;
                    match field {
                        Field::Href => entry.href = text.into_owned(),
                        Field::Etag => entry.etag = Some(text.trim_matches('"').to_string()),
                        Field::LastModified => entry.last_modified = Some(text.into_owned()),
                        Field::Checksum => {
                            if entry.sha1.is_none() {
                                entry.sha1 = sha1_from_composite(&text);
                            }
                        }
                        Field::None => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                b"href" | b"getetag" | b"getlastmodified" | b"checksum" => field = Field::None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(malformed(err.to_string())),
        }
    }

    Ok(entries)
}

fn malformed(detail: String) -> SyncError {
    SyncError::Unexpected(format!("malformed multistatus: {detail}"))
}

/// Picks the `SHA1:<hex>` half out of a composite checksum value such as
/// `SHA1:abc MD5:def ADLER32:0123`.
fn sha1_from_composite(value: &str) -> Option<String> {
    value.split_whitespace().find_map(|token| {
        let (algo, hex) = token.split_once(':')?;
        if algo.eq_ignore_ascii_case("sha1") && !hex.is_empty() {
            Some(hex.to_ascii_lowercase())
        } else {
            None
        }
    })
}

/// Last path segment of an href, percent-decoded. `None` for the root.
pub(crate) fn file_name_from_href(href: &str) -> Option<String> {
    let segment = href.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() {
        return None;
    }
    let decoded = percent_decode_str(segment).decode_utf8().ok()?;
    Some(decoded.into_owned())
}

/// Parses a `getlastmodified` value. `httpdate` falls back through the
/// legacy HTTP date formats (IMF-fixdate, RFC 850, asctime) before failing.
pub(crate) fn parse_last_modified(value: &str) -> Result<SystemTime, SyncError> {
    httpdate::parse_http_date(value.trim())
        .map_err(|_| SyncError::Unexpected(format!("unparsable lock timestamp: {value}")))
}

/// The server's own clock, taken from the response `Date` header; local
/// clock when the header is missing or unparsable.
pub(crate) fn server_now(headers: &HeaderMap) -> SystemTime {
    headers
        .get(reqwest::header::DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .unwrap_or_else(SystemTime::now)
}

/// Child resource of a collection URL, with the name percent-encoded as one
/// path segment. Collections keep a trailing slash.
pub(crate) fn resource_url(base: &Url, name: &str, collection: bool) -> Result<Url, SyncError> {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| SyncError::Unexpected("base url cannot be a base".to_string()))?;
        segments.pop_if_empty();
        segments.push(name);
        if collection {
            segments.push("");
        }
    }
    Ok(url)
}
