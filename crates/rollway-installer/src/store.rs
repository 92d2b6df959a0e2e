use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use rollway_core::{PackageManifest, ReleaseRecord, UpdateError, PACKAGE_MANIFEST_FILE};
use rollway_registry::UpdateSource;
use rollway_security::{constant_time_eq_hex, sha256_file_hex};
use semver::Version;
use tracing::{debug, info, warn};

use crate::fs_utils::{
    current_unix_timestamp, remove_dir_if_exists, remove_file_if_exists, unique_suffix,
};
use crate::hooks::{HookEnv, HookName, HookRunner};
use crate::receipts::{read_install_receipt, remove_install_receipt, write_install_receipt};
use crate::{DataLayout, InstallReceipt, CURRENT_POINTER_NAME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledVersion {
    pub version: Version,
    pub path: PathBuf,
    pub receipt: Option<InstallReceipt>,
}

impl InstalledVersion {
    pub fn installed_at_unix(&self) -> u64 {
        self.receipt
            .as_ref()
            .map(|receipt| receipt.installed_at_unix)
            .unwrap_or(0)
    }
}

/// Owns `downloads/` and `versions/`: nothing lands under `versions/<v>`
/// until it has been verified and fully unpacked next to it.
pub struct PackageStore {
    layout: DataLayout,
    source: Arc<dyn UpdateSource>,
    hooks: HookRunner,
}

impl PackageStore {
    pub fn new(layout: DataLayout, source: Arc<dyn UpdateSource>, hooks: HookRunner) -> Self {
        Self {
            layout,
            source,
            hooks,
        }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn fetch(&self, release: &ReleaseRecord) -> Result<PathBuf> {
        let version = release.version_string();
        let downloads = self.layout.downloads_dir();
        fs::create_dir_all(&downloads)
            .with_context(|| format!("failed to create {}", downloads.display()))?;

        let part = self.layout.download_part_path(&version);
        remove_file_if_exists(&part)
            .with_context(|| format!("failed to clear stale download {}", part.display()))?;

        let written = match self.source.download(release, &part) {
            Ok(written) => written,
            Err(err) => {
                let _ = remove_file_if_exists(&part);
                return Err(UpdateError::SourceUnavailable {
                    reason: format!("failed downloading {version}: {err:#}"),
                }
                .into());
            }
        };
        if let Some(expected) = release.size {
            if expected != written {
                warn!(
                    version = %version,
                    expected,
                    written,
                    "downloaded size differs from published size"
                );
            }
        }

        let archive = self.layout.download_path(&version);
        fs::rename(&part, &archive).with_context(|| {
            format!(
                "failed to finalize download {} -> {}",
                part.display(),
                archive.display()
            )
        })?;
        info!(version = %version, bytes = written, "package fetched");
        Ok(archive)
    }

    /// Checks the whole-archive digest. A mismatching archive is deleted.
    pub fn verify(&self, archive: &Path, expected: &str) -> Result<()> {
        let actual = sha256_file_hex(archive)?;
        if constant_time_eq_hex(&actual, expected) {
            debug!(archive = %archive.display(), "archive checksum verified");
            return Ok(());
        }

        warn!(archive = %archive.display(), "archive checksum mismatch; discarding");
        let _ = remove_file_if_exists(archive);
        Err(UpdateError::ChecksumMismatch {
            subject: archive.display().to_string(),
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        }
        .into())
    }

    /// Unpacks `archive` into `versions/<version>` through a staging sibling,
    /// running `pre-install` in staging and `post-install` once in place.
    pub fn extract(
        &self,
        archive: &Path,
        release: &ReleaseRecord,
        env: &HookEnv,
    ) -> Result<PathBuf> {
        let version = release.version_string();
        let final_dir = self.layout.version_dir(&version);
        if final_dir.exists() {
            anyhow::bail!(
                "version directory already exists: {}",
                final_dir.display()
            );
        }

        let staging = self
            .layout
            .staging_version_dir(&version, &unique_suffix());
        let file_count = match self.stage(archive, release, &staging, env) {
            Ok(file_count) => file_count,
            Err(err) => {
                let _ = remove_dir_if_exists(&staging);
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&staging, &final_dir) {
            let _ = remove_dir_if_exists(&staging);
            return Err(err).with_context(|| {
                format!(
                    "failed to move {} into {}",
                    staging.display(),
                    final_dir.display()
                )
            });
        }

        if let Err(err) = self.finish_install(archive, release, &final_dir, file_count, env) {
            let _ = remove_install_receipt(&self.layout, &version);
            let _ = remove_dir_if_exists(&final_dir);
            return Err(err);
        }

        let _ = remove_file_if_exists(archive);
        info!(version = %version, files = file_count, "package installed");
        Ok(final_dir)
    }

    pub fn is_installed(&self, version: &str) -> bool {
        self.layout
            .version_dir(version)
            .join(PACKAGE_MANIFEST_FILE)
            .is_file()
    }

    /// Complete installs, newest version first. Staging directories and the
    /// current pointer are not versions.
    pub fn list_installed(&self) -> Result<Vec<InstalledVersion>> {
        let dir = self.layout.versions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut installed = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read versions directory: {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') || name == CURRENT_POINTER_NAME {
                continue;
            }
            let Ok(version) = Version::parse(name) else {
                continue;
            };
            if !self.is_installed(name) {
                continue;
            }

            let receipt = match read_install_receipt(&self.layout, name) {
                Ok(receipt) => receipt,
                Err(err) => {
                    warn!(version = %name, error = %format!("{err:#}"), "unreadable install receipt");
                    None
                }
            };
            installed.push(InstalledVersion {
                version,
                path: entry.path(),
                receipt,
            });
        }

        installed.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(installed)
    }

    pub fn remove_version(&self, version: &str) -> Result<()> {
        let dir = self.layout.version_dir(version);
        remove_dir_if_exists(&dir)
            .with_context(|| format!("failed to remove version directory: {}", dir.display()))?;
        remove_install_receipt(&self.layout, version)
    }

    fn stage(
        &self,
        archive: &Path,
        release: &ReleaseRecord,
        staging: &Path,
        env: &HookEnv,
    ) -> Result<usize> {
        fs::create_dir_all(staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;
        let entries = unpack_archive(archive, staging)?;
        debug!(staging = %staging.display(), entries, "archive unpacked");

        let manifest = read_package_manifest(staging)?;
        if manifest.version != release.version {
            anyhow::bail!(
                "package-invalid: archive declares version {} but {} was requested",
                manifest.version,
                release.version
            );
        }
        verify_package_files(staging, &manifest)?;

        self.hooks.run(HookName::PreInstall, staging, env)?;
        Ok(manifest.checksums.len())
    }

    fn finish_install(
        &self,
        archive: &Path,
        release: &ReleaseRecord,
        final_dir: &Path,
        file_count: usize,
        env: &HookEnv,
    ) -> Result<()> {
        self.hooks.run(HookName::PostInstall, final_dir, env)?;

        let size = fs::metadata(archive).map(|metadata| metadata.len()).ok();
        write_install_receipt(
            &self.layout,
            &InstallReceipt {
                version: release.version_string(),
                channel: release.channel,
                release_date: release.release_date.clone(),
                checksum: release.normalized_checksum(),
                size: size.or(release.size),
                file_count,
                installed_at_unix: current_unix_timestamp(),
            },
        )?;
        Ok(())
    }
}

fn read_package_manifest(dir: &Path) -> Result<PackageManifest> {
    let path = dir.join(PACKAGE_MANIFEST_FILE);
    if !path.is_file() {
        anyhow::bail!("package-invalid: missing {}", PACKAGE_MANIFEST_FILE);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    PackageManifest::from_json_str(&raw)
        .with_context(|| format!("package-invalid: {}", path.display()))
}

fn verify_package_files(root: &Path, manifest: &PackageManifest) -> Result<()> {
    for (relative, expected) in &manifest.checksums {
        let path = root.join(relative);
        let actual = sha256_file_hex(&path)
            .with_context(|| format!("package-invalid: cannot hash listed file '{relative}'"))?;
        if !constant_time_eq_hex(&actual, expected) {
            return Err(UpdateError::ChecksumMismatch {
                subject: relative.clone(),
                expected: expected.trim().to_ascii_lowercase(),
                actual,
            }
            .into());
        }
    }
    Ok(())
}

/// Unpacks a gzip-compressed tar into `dst`, refusing any entry or link that
/// would land outside it.
pub(crate) fn unpack_archive(archive_path: &Path, dst: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open archive {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut count = 0;

    for entry in archive
        .entries()
        .with_context(|| format!("failed to read archive {}", archive_path.display()))?
    {
        let mut entry = entry
            .with_context(|| format!("corrupt archive entry in {}", archive_path.display()))?;
        let path = entry
            .path()
            .context("archive entry has an invalid path")?
            .into_owned();
        if escapes_root(Path::new(""), &path) {
            anyhow::bail!("archive-unsafe-path: {}", path.display());
        }

        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            if let Some(link) = entry.link_name().context("invalid archive link target")? {
                let base = if kind.is_symlink() {
                    path.parent().unwrap_or(Path::new("")).to_path_buf()
                } else {
                    PathBuf::new()
                };
                if escapes_root(&base, &link) {
                    anyhow::bail!(
                        "archive-unsafe-path: link {} -> {}",
                        path.display(),
                        link.display()
                    );
                }
            }
        }

        let unpacked = entry
            .unpack_in(dst)
            .with_context(|| format!("failed to unpack {}", path.display()))?;
        if !unpacked {
            anyhow::bail!("archive-unsafe-path: {}", path.display());
        }
        count += 1;
    }

    Ok(count)
}

/// Lexically resolves `relative` against `base` (both inside the package
/// root) and reports whether the result would leave the root.
pub(crate) fn escapes_root(base: &Path, relative: &Path) -> bool {
    let mut depth: usize = 0;
    for component in base.components().chain(relative.components()) {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}
