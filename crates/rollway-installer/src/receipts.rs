use anyhow::{Context, Result};
use rollway_core::{parse_version, Channel};
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::{DataLayout, InstallReceipt};

pub fn write_install_receipt(layout: &DataLayout, receipt: &InstallReceipt) -> Result<PathBuf> {
    let mut payload = String::new();
    payload.push_str(&format!("version={}\n", receipt.version));
    payload.push_str(&format!("channel={}\n", receipt.channel.as_str()));
    if let Some(release_date) = &receipt.release_date {
        payload.push_str(&format!("release_date={}\n", release_date));
    }
    payload.push_str(&format!("checksum={}\n", receipt.checksum));
    if let Some(size) = receipt.size {
        payload.push_str(&format!("size={}\n", size));
    }
    payload.push_str(&format!("file_count={}\n", receipt.file_count));
    payload.push_str(&format!(
        "installed_at_unix={}\n",
        receipt.installed_at_unix
    ));

    let path = layout.receipt_path(&receipt.version);
    write_atomic(&path, payload.as_bytes())
        .with_context(|| format!("failed to write install receipt: {}", path.display()))?;
    Ok(path)
}

pub fn read_install_receipt(layout: &DataLayout, version: &str) -> Result<Option<InstallReceipt>> {
    let path = layout.receipt_path(version);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read install receipt: {}", path.display()))
        }
    };
    let receipt = parse_receipt(&raw)
        .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;
    Ok(Some(receipt))
}

/// All receipts, newest version first.
pub fn read_install_receipts(layout: &DataLayout) -> Result<Vec<InstallReceipt>> {
    let dir = layout.installed_state_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut receipts = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read install state directory: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|v| v.to_str()) != Some("receipt") {
            continue;
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read install receipt: {}", path.display()))?;
        let receipt = parse_receipt(&raw)
            .with_context(|| format!("failed to parse install receipt: {}", path.display()))?;
        receipts.push(receipt);
    }

    receipts.sort_by(|a, b| {
        match (parse_version(&a.version), parse_version(&b.version)) {
            (Ok(left), Ok(right)) => right.cmp(&left),
            _ => b.version.cmp(&a.version),
        }
    });
    Ok(receipts)
}

pub fn remove_install_receipt(layout: &DataLayout, version: &str) -> Result<()> {
    let path = layout.receipt_path(version);
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to remove install receipt: {}", path.display()))
}

pub(crate) fn parse_receipt(raw: &str) -> Result<InstallReceipt> {
    let mut version = None;
    let mut channel = None;
    let mut release_date = None;
    let mut checksum = None;
    let mut size = None;
    let mut file_count = None;
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "version" => version = Some(v.to_string()),
            "channel" => channel = Channel::parse(v),
            "release_date" => release_date = Some(v.to_string()),
            "checksum" => checksum = Some(v.to_string()),
            "size" => size = Some(v.parse().context("size must be u64")?),
            "file_count" => file_count = Some(v.parse().context("file_count must be usize")?),
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(InstallReceipt {
        version: version.context("missing version")?,
        channel: channel.unwrap_or_default(),
        release_date,
        checksum: checksum.context("missing checksum")?,
        size,
        file_count: file_count.unwrap_or(0),
        installed_at_unix: installed_at_unix.context("missing installed_at_unix")?,
    })
}
