//! PROPFIND multi-status parsing
//!
//! Maps every `DAV:` `<response>` element of a multi-status body to a
//! [`FileEntry`], in document order. Missing properties fall back to their
//! defaults; only malformed XML or a non-numeric content length is an error.

use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use tracing::debug;

use crate::error::{Result, WebDavError};
use crate::models::FileEntry;

const DAV_NAMESPACE: &[u8] = b"DAV:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prop {
    Href,
    ContentLength,
    LastModified,
    CreationDate,
    ContentType,
}

impl Prop {
    fn from_local_name(name: &[u8]) -> Option<Self> {
        match name {
            b"href" => Some(Prop::Href),
            b"getcontentlength" => Some(Prop::ContentLength),
            b"getlastmodified" => Some(Prop::LastModified),
            b"creationdate" => Some(Prop::CreationDate),
            b"getcontenttype" => Some(Prop::ContentType),
            _ => None,
        }
    }
}

/// Properties collected for one `<response>`; the first occurrence of each wins
#[derive(Debug, Default)]
struct PartialEntry {
    href: Option<String>,
    content_length: Option<String>,
    last_modified: Option<String>,
    creation_date: Option<String>,
    content_type: Option<String>,
}

impl PartialEntry {
    fn slot(&mut self, prop: Prop) -> &mut Option<String> {
        match prop {
            Prop::Href => &mut self.href,
            Prop::ContentLength => &mut self.content_length,
            Prop::LastModified => &mut self.last_modified,
            Prop::CreationDate => &mut self.creation_date,
            Prop::ContentType => &mut self.content_type,
        }
    }

    fn finish(self, base_path: &str) -> Result<FileEntry> {
        let size = match self.content_length.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(text) => text.parse::<u64>().map_err(|_| {
                WebDavError::MalformedResponse(format!("invalid getcontentlength '{}'", text))
            })?,
        };

        Ok(FileEntry {
            name: strip_base_path(self.href.as_deref().unwrap_or("").trim(), base_path),
            size,
            modified_at: self.last_modified.unwrap_or_default(),
            created_at: self.creation_date.unwrap_or_default(),
            content_type: self.content_type.unwrap_or_default(),
        })
    }
}

fn is_dav(ns: &ResolveResult) -> bool {
    matches!(ns, ResolveResult::Bound(Namespace(n)) if *n == DAV_NAMESPACE)
}

/// Removes `base_path` from the front of an href.
///
/// Absolute hrefs (`https://host/dav/x`) are reduced to their path first.
pub fn strip_base_path(href: &str, base_path: &str) -> String {
    let path = if href.starts_with("http://") || href.starts_with("https://") {
        match url::Url::parse(href) {
            Ok(url) => url.path().to_string(),
            Err(_) => href.to_string(),
        }
    } else {
        href.to_string()
    };

    let base_path = base_path.trim_end_matches('/');
    if base_path.is_empty() {
        return path;
    }
    match path.strip_prefix(base_path) {
        // Only strip on a segment boundary: "/dav" must not eat "/davfiles"
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.to_string(),
        _ => path,
    }
}

/// Parses a PROPFIND response body into file entries
pub fn parse_propfind_response(xml: &[u8], base_path: &str) -> Result<Vec<FileEntry>> {
    let mut reader = NsReader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut entries = Vec::new();
    let mut buf = Vec::new();

    let mut current: Option<PartialEntry> = None;
    // Element depth below the open <response>
    let mut depth = 0usize;
    let mut active: Option<(Prop, usize)> = None;
    let mut text = String::new();

    loop {
        match reader.read_resolved_event_into(&mut buf)? {
            (ns, Event::Start(e)) => match current.as_mut() {
                None => {
                    if is_dav(&ns) && e.local_name().as_ref() == b"response" {
                        current = Some(PartialEntry::default());
                        depth = 0;
                    }
                }
                Some(entry) => {
                    depth += 1;
                    if active.is_none() && is_dav(&ns) {
                        if let Some(prop) = Prop::from_local_name(e.local_name().as_ref()) {
                            if entry.slot(prop).is_none() {
                                active = Some((prop, depth));
                                text.clear();
                            }
                        }
                    }
                }
            },
            (ns, Event::Empty(e)) if is_dav(&ns) => match current.as_mut() {
                None => {
                    if e.local_name().as_ref() == b"response" {
                        entries.push(PartialEntry::default().finish(base_path)?);
                    }
                }
                Some(entry) => {
                    if active.is_none() {
                        if let Some(prop) = Prop::from_local_name(e.local_name().as_ref()) {
                            let slot = entry.slot(prop);
                            if slot.is_none() {
                                *slot = Some(String::new());
                            }
                        }
                    }
                }
            },
            (_, Event::Text(t)) => {
                if matches!(active, Some((_, d)) if d == depth) {
                    text.push_str(&t.unescape()?);
                }
            }
            (_, Event::CData(c)) => {
                if matches!(active, Some((_, d)) if d == depth) {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            (_, Event::End(_)) => {
                if current.is_some() {
                    if depth == 0 {
                        if let Some(entry) = current.take() {
                            entries.push(entry.finish(base_path)?);
                        }
                    } else {
                        if let (Some((prop, d)), Some(entry)) = (active, current.as_mut()) {
                            if d == depth {
                                *entry.slot(prop) = Some(std::mem::take(&mut text));
                                active = None;
                            }
                        }
                        depth -= 1;
                    }
                }
            }
            (_, Event::Eof) => break,
            _ => {}
        }
        buf.clear();
    }

    if current.is_some() {
        return Err(WebDavError::MalformedResponse(
            "unexpected end of document inside <response>".to_string(),
        ));
    }

    debug!("Parsed {} entries from PROPFIND response", entries.len());
    Ok(entries)
}
