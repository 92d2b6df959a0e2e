use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fs_ops::write_atomic;

/// Every (version, checksum) pair the registry has ever accepted. Entries are
/// only added, never rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChecksumLedger {
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

impl ChecksumLedger {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading checksum ledger: {}", path.display()))
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing checksum ledger: {}", path.display()))
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(self).context("failed serializing checksum ledger")?;
        write_atomic(path, &content)
    }

    /// Records `checksum` for `version`, or returns the previously recorded
    /// checksum when it differs.
    pub(crate) fn observe(&mut self, version: &str, checksum: &str) -> Result<(), String> {
        let normalized = checksum.trim().to_ascii_lowercase();
        match self.entries.get(version) {
            Some(known) if *known != normalized => Err(known.clone()),
            Some(_) => Ok(()),
            None => {
                self.entries.insert(version.to_string(), normalized);
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn known(&self, version: &str) -> Option<&str> {
        self.entries.get(version).map(String::as_str)
    }
}
