use std::collections::BTreeMap;
use std::path::{Component, Path};

use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;

pub const PACKAGE_MANIFEST_FILE: &str = "manifest.json";

/// The `manifest.json` shipped at the root of every package archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageManifest {
    pub version: Version,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub build_date: Option<String>,
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl PackageManifest {
    pub fn from_json_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self =
            serde_json::from_str(input).context("failed to parse package manifest")?;
        for (path, digest) in &manifest.checksums {
            validate_relative_path(path)
                .with_context(|| format!("invalid checksum entry path '{path}'"))?;
            if digest.trim().is_empty() {
                return Err(anyhow!("checksum for '{path}' must not be empty"));
            }
        }
        Ok(manifest)
    }
}

fn validate_relative_path(path: &str) -> anyhow::Result<()> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("path must not be empty"));
    }

    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        return Err(anyhow!("path must be relative: {path}"));
    }
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return Err(anyhow!("path must stay inside the package: {path}"));
    }

    Ok(())
}
