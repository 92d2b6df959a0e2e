//! The `versions/current` indirection naming the serving version.
//!
//! On unix it is a relative symlink replaced by renaming a freshly created
//! sibling link over it, so readers always see either the old or the new
//! target. Elsewhere a one-line pointer file is replaced the same way.

use anyhow::{Context, Result};
use std::fs;
use std::io;

use crate::fs_utils::unique_suffix;
use crate::DataLayout;

pub fn read_current(layout: &DataLayout) -> Result<Option<String>> {
    let path = layout.current_pointer_path();
    let metadata = match fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to stat current pointer: {}", path.display()))
        }
    };

    let raw = if metadata.file_type().is_symlink() {
        let target = fs::read_link(&path)
            .with_context(|| format!("failed to read current pointer: {}", path.display()))?;
        target
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .with_context(|| {
                format!(
                    "current pointer target is not a version directory: {}",
                    target.display()
                )
            })?
    } else {
        fs::read_to_string(&path)
            .with_context(|| format!("failed to read current pointer: {}", path.display()))?
            .trim()
            .to_string()
    };

    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(raw))
}

/// Points `current` at `versions/<version>`. The version directory must
/// already exist.
pub fn set_current(layout: &DataLayout, version: &str) -> Result<()> {
    let target_dir = layout.version_dir(version);
    if !target_dir.is_dir() {
        anyhow::bail!(
            "cannot activate missing version directory: {}",
            target_dir.display()
        );
    }

    let path = layout.current_pointer_path();
    let tmp = layout
        .versions_dir()
        .join(format!(".current-{}", unique_suffix()));
    write_pointer(&tmp, version)?;
    if let Err(err) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| {
            format!(
                "failed to swap current pointer {} -> {}",
                tmp.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub fn clear_current(layout: &DataLayout) -> Result<()> {
    let path = layout.current_pointer_path();
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err)
            .with_context(|| format!("failed to remove current pointer: {}", path.display())),
    }
}

#[cfg(unix)]
fn write_pointer(tmp: &std::path::Path, version: &str) -> Result<()> {
    std::os::unix::fs::symlink(version, tmp)
        .with_context(|| format!("failed to create pointer link: {}", tmp.display()))
}

#[cfg(not(unix))]
fn write_pointer(tmp: &std::path::Path, version: &str) -> Result<()> {
    fs::write(tmp, format!("{version}\n"))
        .with_context(|| format!("failed to write pointer record: {}", tmp.display()))
}
