use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// One resource from a PROPFIND multi-status listing.
///
/// Timestamps are kept exactly as the server sent them; use
/// [`modified_datetime`](Self::modified_datetime) and
/// [`created_datetime`](Self::created_datetime) for parsed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// The href with the server's base path stripped
    pub name: String,
    pub size: u64,
    pub modified_at: String,
    pub created_at: String,
    pub content_type: String,
}

impl FileEntry {
    /// Collections are listed with a trailing slash
    pub fn is_collection(&self) -> bool {
        self.name.ends_with('/')
    }

    /// `getlastmodified` is an RFC 1123 date
    pub fn modified_datetime(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc2822(self.modified_at.trim()).ok()
    }

    /// `creationdate` is an RFC 3339 timestamp
    pub fn created_datetime(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(self.created_at.trim()).ok()
    }
}
