use chrono::{DateTime, NaiveDate, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;

/// Remote metadata for one published version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub version: Version,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub release_date: Option<String>,
    pub checksum: String,
    #[serde(default)]
    pub size: Option<u64>,
    pub download_url: String,
}

impl ReleaseRecord {
    pub fn version_string(&self) -> String {
        self.version.to_string()
    }

    pub fn normalized_checksum(&self) -> String {
        self.checksum.trim().to_ascii_lowercase()
    }

    /// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates.
    pub fn release_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.release_date.as_deref()?.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }
}
