use anyhow::{anyhow, Context, Result};
use semver::Version;

/// Parses a release version, tolerating a leading `v` and missing minor or
/// patch components (`"1.4"` becomes `1.4.0`).
pub fn parse_version(input: &str) -> Result<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(anyhow!("version must not be empty"));
    }

    let (core, suffix) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let components = core.split('.').count();
    let padded = match components {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };

    Version::parse(&padded).with_context(|| format!("invalid version '{input}'"))
}

pub fn sort_versions_descending(versions: &mut [Version]) {
    versions.sort_by(|a, b| b.cmp(a));
}
