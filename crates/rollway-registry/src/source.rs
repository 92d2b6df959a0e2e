use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rollway_core::{Channel, ReleaseRecord};
use semver::Version;
use serde::{Deserialize, Serialize};

/// The remote collaborator that publishes versions and their artifacts.
///
/// Absence of a requested version or changelog is `Ok(None)`, never an
/// error; errors mean the source itself could not be reached or read.
pub trait UpdateSource: Send + Sync {
    fn describe(&self) -> String;

    fn list_versions(&self, channel: Channel) -> Result<Vec<ReleaseRecord>>;

    fn package_info(&self, version: &Version) -> Result<Option<ReleaseRecord>>;

    fn changelog(&self, version: &Version) -> Result<Option<String>>;

    /// Writes the artifact for `release` to `destination`, returning the
    /// number of bytes written.
    fn download(&self, release: &ReleaseRecord, destination: &Path) -> Result<u64>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct VersionListResponse {
    #[serde(default)]
    pub(crate) versions: Vec<ReleaseRecord>,
}

/// A local mirror laid out as `versions-<channel>.json`,
/// `package/<version>.json`, `changelog/<version>.txt`, with artifacts at
/// paths named by each record's `download_url`.
#[derive(Debug, Clone)]
pub struct FilesystemUpdateSource {
    root: PathBuf,
}

impl FilesystemUpdateSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_root(&self) -> Result<()> {
        if !self.root.is_dir() {
            anyhow::bail!(
                "update source directory does not exist: {}",
                self.root.display()
            );
        }
        Ok(())
    }

    fn artifact_path(&self, download_url: &str) -> PathBuf {
        let trimmed = download_url
            .strip_prefix("file://")
            .unwrap_or(download_url);
        let candidate = Path::new(trimmed);
        if candidate.is_absolute() && candidate.exists() {
            return candidate.to_path_buf();
        }
        self.root.join(trimmed.trim_start_matches('/'))
    }
}

impl UpdateSource for FilesystemUpdateSource {
    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    fn list_versions(&self, channel: Channel) -> Result<Vec<ReleaseRecord>> {
        self.ensure_root()?;
        let path = self.root.join(format!("versions-{}.json", channel.as_str()));
        let Some(raw) = read_optional(&path)? else {
            return Ok(Vec::new());
        };
        let response: VersionListResponse = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing version list: {}", path.display()))?;
        Ok(response.versions)
    }

    fn package_info(&self, version: &Version) -> Result<Option<ReleaseRecord>> {
        self.ensure_root()?;
        let path = self.root.join("package").join(format!("{version}.json"));
        let Some(raw) = read_optional(&path)? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing package info: {}", path.display()))?;
        Ok(Some(record))
    }

    fn changelog(&self, version: &Version) -> Result<Option<String>> {
        self.ensure_root()?;
        let path = self.root.join("changelog").join(format!("{version}.txt"));
        read_optional(&path)
    }

    fn download(&self, release: &ReleaseRecord, destination: &Path) -> Result<u64> {
        self.ensure_root()?;
        let artifact = self.artifact_path(&release.download_url);
        fs::copy(&artifact, destination).with_context(|| {
            format!(
                "failed copying artifact {} to {}",
                artifact.display(),
                destination.display()
            )
        })
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed reading {}", path.display())),
    }
}
