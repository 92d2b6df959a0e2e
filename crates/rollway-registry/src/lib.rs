use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Result;
use rollway_core::{Channel, ReleaseRecord, UpdateError};
use semver::Version;
use tracing::{info, warn};

mod fs_ops;
mod http_source;
mod ledger;
mod snapshot_state;
mod source;

pub use http_source::HttpUpdateSource;
pub use snapshot_state::{ManifestSnapshot, QuarantinedRelease};
pub use source::{FilesystemUpdateSource, UpdateSource};

use fs_ops::current_unix_timestamp;
use ledger::ChecksumLedger;
use snapshot_state::{build_snapshot, read_snapshot_file, write_snapshot_file};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// The last reload failed; the cached manifest is still being served.
    Stale { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub channel: Channel,
    pub releases: Vec<ReleaseRecord>,
    pub freshness: Freshness,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub release_count: usize,
    pub quarantined: Vec<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    snapshot: Option<Arc<ManifestSnapshot>>,
    stale_reason: Option<String>,
}

/// Caches the remote manifest and answers version queries from it.
///
/// Readers clone an `Arc` of the current snapshot; `reload` builds a complete
/// replacement before swapping it in, so a partially fetched manifest is
/// never visible.
pub struct ManifestRegistry {
    source: Arc<dyn UpdateSource>,
    state_root: PathBuf,
    state: RwLock<RegistryState>,
    reload_lock: Mutex<()>,
}

impl ManifestRegistry {
    pub fn new(source: Arc<dyn UpdateSource>, state_root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            state_root: state_root.into(),
            state: RwLock::new(RegistryState::default()),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn source(&self) -> Arc<dyn UpdateSource> {
        Arc::clone(&self.source)
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn cache_path(&self) -> PathBuf {
        self.state_root.join("cache.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_root.join("checksums.json")
    }

    pub fn snapshot(&self) -> Option<Arc<ManifestSnapshot>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }

    pub fn reload(&self) -> Result<ReloadReport> {
        let _guard = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let fetched = match fetch_all_channels(self.source.as_ref()) {
            Ok(fetched) => fetched,
            Err(err) => return Err(self.record_fetch_failure(err)),
        };

        let ledger_path = self.ledger_path();
        let mut ledger = ChecksumLedger::load(&ledger_path)?;
        let snapshot = build_snapshot(
            self.source.describe(),
            current_unix_timestamp(),
            fetched,
            &mut ledger,
        );
        ledger.save(&ledger_path)?;
        write_snapshot_file(&self.cache_path(), &snapshot)?;

        let report = ReloadReport {
            release_count: snapshot.release_count(),
            quarantined: snapshot.quarantined.keys().cloned().collect(),
        };
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.snapshot = Some(Arc::new(snapshot));
            state.stale_reason = None;
        }

        info!(
            source = %self.source.describe(),
            releases = report.release_count,
            quarantined = report.quarantined.len(),
            "manifest reloaded"
        );
        Ok(report)
    }

    pub fn resolve(&self, channel: Channel) -> Result<Resolution> {
        let snapshot = self.ensure_loaded()?;
        let freshness = match self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .stale_reason
            .clone()
        {
            Some(reason) => Freshness::Stale { reason },
            None => Freshness::Fresh,
        };

        Ok(Resolution {
            channel,
            releases: snapshot.releases(channel).to_vec(),
            freshness,
        })
    }

    pub fn get(&self, version: &Version) -> Result<ReleaseRecord> {
        let snapshot = self.ensure_loaded()?;
        let key = version.to_string();
        if let Some(quarantined) = snapshot.quarantined.get(&key) {
            return Err(UpdateError::ManifestTampered {
                version: key,
                known: quarantined.known_checksum.clone(),
                declared: quarantined.declared_checksum.clone(),
            }
            .into());
        }
        if let Some(record) = snapshot.find(version) {
            return Ok(record.clone());
        }

        let record = match self.source.package_info(version) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(UpdateError::NotFound { version: key }.into()),
            Err(err) => {
                return Err(UpdateError::SourceUnavailable {
                    reason: format!("{err:#}"),
                }
                .into())
            }
        };
        if record.version != *version {
            anyhow::bail!(
                "update source answered for version {} when asked for {key}",
                record.version
            );
        }

        let _guard = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let ledger_path = self.ledger_path();
        let mut ledger = ChecksumLedger::load(&ledger_path)?;
        let declared = record.normalized_checksum();
        if let Err(known) = ledger.observe(&key, &declared) {
            warn!(version = %key, "package info checksum differs from published checksum");
            return Err(UpdateError::ManifestTampered {
                version: key,
                known,
                declared,
            }
            .into());
        }
        ledger.save(&ledger_path)?;

        Ok(ReleaseRecord {
            checksum: declared,
            ..record
        })
    }

    pub fn latest(&self, channel: Channel) -> Result<Option<ReleaseRecord>> {
        Ok(self.resolve(channel)?.releases.into_iter().next())
    }

    /// Returns the newest release on `channel` strictly newer than `current`.
    pub fn check_for_update(
        &self,
        channel: Channel,
        current: Option<&Version>,
    ) -> Result<Option<ReleaseRecord>> {
        let latest = self.latest(channel)?;
        Ok(latest.filter(|release| current.map_or(true, |current| release.version > *current)))
    }

    pub fn changelog(&self, version: &Version) -> Result<Option<String>> {
        self.source.changelog(version).map_err(|err| {
            anyhow::Error::from(UpdateError::SourceUnavailable {
                reason: format!("{err:#}"),
            })
        })
    }

    fn ensure_loaded(&self) -> Result<Arc<ManifestSnapshot>> {
        if let Some(snapshot) = self.snapshot() {
            return Ok(snapshot);
        }
        if let Some(snapshot) = self.load_cached_snapshot() {
            return Ok(snapshot);
        }

        if let Err(err) = self.reload() {
            if let Some(snapshot) = self.snapshot() {
                return Ok(snapshot);
            }
            return Err(err);
        }
        self.snapshot().ok_or_else(|| {
            anyhow::Error::from(UpdateError::NoManifestAvailable {
                reason: "manifest reload produced no snapshot".to_string(),
            })
        })
    }

    fn load_cached_snapshot(&self) -> Option<Arc<ManifestSnapshot>> {
        let cached = Arc::new(read_snapshot_file(&self.cache_path())?);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = &state.snapshot {
            return Some(Arc::clone(existing));
        }
        state.snapshot = Some(Arc::clone(&cached));
        Some(cached)
    }

    fn record_fetch_failure(&self, err: anyhow::Error) -> anyhow::Error {
        let reason = format!("{err:#}");
        let has_cache = self.snapshot().is_some() || self.load_cached_snapshot().is_some();
        if !has_cache {
            warn!(reason = %reason, "manifest fetch failed with no cache available");
            return UpdateError::NoManifestAvailable { reason }.into();
        }

        warn!(reason = %reason, "manifest fetch failed; serving cached manifest");
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .stale_reason = Some(reason.clone());
        UpdateError::SourceUnavailable { reason }.into()
    }
}

fn fetch_all_channels(source: &dyn UpdateSource) -> Result<Vec<(Channel, Vec<ReleaseRecord>)>> {
    let mut fetched = Vec::with_capacity(Channel::ALL.len());
    for channel in Channel::ALL {
        fetched.push((channel, source.list_versions(channel)?));
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests;
