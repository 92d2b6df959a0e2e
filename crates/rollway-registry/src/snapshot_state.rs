use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use rollway_core::{Channel, ReleaseRecord};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fs_ops::write_atomic;

const SNAPSHOT_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRelease {
    pub version: String,
    pub known_checksum: String,
    pub declared_checksum: String,
}

/// One complete, validated view of the remote manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSnapshot {
    #[serde(default = "snapshot_file_version")]
    pub version: u32,
    pub source: String,
    pub fetched_at_unix: u64,
    #[serde(default)]
    pub channels: BTreeMap<Channel, Vec<ReleaseRecord>>,
    #[serde(default)]
    pub quarantined: BTreeMap<String, QuarantinedRelease>,
}

impl ManifestSnapshot {
    pub fn releases(&self, channel: Channel) -> &[ReleaseRecord] {
        self.channels
            .get(&channel)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn find(&self, version: &Version) -> Option<&ReleaseRecord> {
        self.channels
            .values()
            .flat_map(|records| records.iter())
            .find(|record| record.version == *version)
    }

    pub fn release_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }
}

fn snapshot_file_version() -> u32 {
    SNAPSHOT_FILE_VERSION
}

pub(crate) fn write_snapshot_file(path: &Path, snapshot: &ManifestSnapshot) -> Result<()> {
    let content = serde_json::to_vec_pretty(snapshot).with_context(|| {
        format!(
            "manifest-cache-failed: failed serializing snapshot {}",
            path.display()
        )
    })?;
    write_atomic(path, &content)
        .with_context(|| format!("manifest-cache-failed: failed writing {}", path.display()))
}

/// Loads the persisted snapshot. An unreadable or corrupt cache is treated as
/// absent so the next fetch can replace it.
pub(crate) fn read_snapshot_file(path: &Path) -> Option<ManifestSnapshot> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "manifest cache unreadable");
            return None;
        }
    };

    match serde_json::from_str::<ManifestSnapshot>(&content) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "manifest cache invalid");
            None
        }
    }
}

pub(crate) fn build_snapshot(
    source: String,
    fetched_at_unix: u64,
    fetched: Vec<(Channel, Vec<ReleaseRecord>)>,
    ledger: &mut crate::ledger::ChecksumLedger,
) -> ManifestSnapshot {
    let mut channels = BTreeMap::new();
    let mut quarantined = BTreeMap::new();

    for (channel, records) in fetched {
        let mut accepted: Vec<ReleaseRecord> = Vec::with_capacity(records.len());
        for mut record in records {
            record.channel = channel;
            record.checksum = record.normalized_checksum();
            let version = record.version_string();
            if quarantined.contains_key(&version) {
                continue;
            }
            if let Err(known) = ledger.observe(&version, &record.checksum) {
                warn!(
                    version = %version,
                    known = %known,
                    declared = %record.checksum,
                    "release checksum changed after publication; quarantining"
                );
                accepted.retain(|existing| existing.version != record.version);
                quarantined.insert(
                    version.clone(),
                    QuarantinedRelease {
                        version,
                        known_checksum: known,
                        declared_checksum: record.checksum,
                    },
                );
                continue;
            }
            if accepted
                .iter()
                .any(|existing| existing.version == record.version)
            {
                continue;
            }
            accepted.push(record);
        }
        accepted.sort_by(|a, b| b.version.cmp(&a.version));
        channels.insert(channel, accepted);
    }

    for records in channels.values_mut() {
        records.retain(|record| !quarantined.contains_key(&record.version_string()));
    }

    ManifestSnapshot {
        version: SNAPSHOT_FILE_VERSION,
        source,
        fetched_at_unix,
        channels,
        quarantined,
    }
}
