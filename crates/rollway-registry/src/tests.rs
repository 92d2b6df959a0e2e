use super::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rollway_core::{Channel, UpdateError};

#[test]
fn resolve_sorts_releases_numerically_descending() {
    let root = test_root("sort");
    let mirror = root.join("mirror");
    write_versions(
        &mirror,
        Channel::Stable,
        &[("1.9.0", "aa"), ("1.10.0", "bb"), ("1.2.2", "cc")],
    );
    let registry = test_registry(&root, &mirror);

    let resolution = registry.resolve(Channel::Stable).expect("must resolve");
    let versions = resolution
        .releases
        .iter()
        .map(ReleaseRecord::version_string)
        .collect::<Vec<_>>();
    assert_eq!(versions, vec!["1.10.0", "1.9.0", "1.2.2"]);
    assert_eq!(resolution.freshness, Freshness::Fresh);
    assert!(resolution
        .releases
        .iter()
        .all(|release| release.channel == Channel::Stable));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn resolve_keeps_channels_separate() {
    let root = test_root("channels");
    let mirror = root.join("mirror");
    write_versions(&mirror, Channel::Stable, &[("1.2.2", "aa")]);
    write_versions(&mirror, Channel::Beta, &[("1.3.0-beta.1", "bb")]);
    let registry = test_registry(&root, &mirror);

    let beta = registry.resolve(Channel::Beta).expect("must resolve beta");
    assert_eq!(beta.releases.len(), 1);
    assert_eq!(beta.releases[0].version_string(), "1.3.0-beta.1");
    assert!(registry
        .resolve(Channel::Dev)
        .expect("must resolve dev")
        .releases
        .is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn reload_failure_retains_cache_and_marks_stale() {
    let root = test_root("stale");
    let mirror = root.join("mirror");
    write_versions(&mirror, Channel::Stable, &[("1.2.2", "aa"), ("1.2.3", "bb")]);
    let registry = test_registry(&root, &mirror);
    registry.reload().expect("initial reload must succeed");

    fs::remove_dir_all(&mirror).expect("must remove mirror");
    let err = registry.reload().expect_err("reload must fail without source");
    assert!(matches!(
        err.downcast_ref::<UpdateError>(),
        Some(UpdateError::SourceUnavailable { .. })
    ));

    let resolution = registry
        .resolve(Channel::Stable)
        .expect("cached manifest must still resolve");
    assert_eq!(resolution.releases.len(), 2);
    assert!(matches!(resolution.freshness, Freshness::Stale { .. }));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn resolve_without_cache_and_source_is_no_manifest_available() {
    let root = test_root("nocache");
    let registry = test_registry(&root, &root.join("missing-mirror"));

    let err = registry
        .resolve(Channel::Stable)
        .expect_err("resolution must fail without any manifest");
    assert!(matches!(
        err.downcast_ref::<UpdateError>(),
        Some(UpdateError::NoManifestAvailable { .. })
    ));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn disk_cache_serves_a_fresh_registry_when_source_is_down() {
    let root = test_root("disk-cache");
    let mirror = root.join("mirror");
    write_versions(&mirror, Channel::Stable, &[("2.0.0", "aa")]);
    test_registry(&root, &mirror)
        .reload()
        .expect("initial reload must succeed");
    fs::remove_dir_all(&mirror).expect("must remove mirror");

    let restarted = test_registry(&root, &mirror);
    let resolution = restarted
        .resolve(Channel::Stable)
        .expect("disk cache must resolve");
    assert_eq!(resolution.releases[0].version_string(), "2.0.0");

    let err = restarted.reload().expect_err("source is gone");
    assert!(matches!(
        err.downcast_ref::<UpdateError>(),
        Some(UpdateError::SourceUnavailable { .. })
    ));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn republished_checksum_is_quarantined_as_tampered() {
    let root = test_root("tamper");
    let mirror = root.join("mirror");
    write_versions(&mirror, Channel::Stable, &[("1.2.2", "aa"), ("1.2.3", "bb")]);
    let registry = test_registry(&root, &mirror);
    registry.reload().expect("initial reload must succeed");

    write_versions(&mirror, Channel::Stable, &[("1.2.2", "aa"), ("1.2.3", "ff")]);
    let report = registry.reload().expect("reload must succeed");
    assert_eq!(report.quarantined, vec!["1.2.3".to_string()]);

    let err = registry
        .get(&version("1.2.3"))
        .expect_err("tampered version must be refused");
    match err.downcast_ref::<UpdateError>() {
        Some(UpdateError::ManifestTampered {
            known, declared, ..
        }) => {
            assert_eq!(known, "bb");
            assert_eq!(declared, "ff");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let resolution = registry.resolve(Channel::Stable).expect("must resolve");
    assert_eq!(resolution.releases.len(), 1);
    assert_eq!(resolution.releases[0].version_string(), "1.2.2");

    // restoring the original checksum lifts the quarantine
    write_versions(&mirror, Channel::Stable, &[("1.2.2", "aa"), ("1.2.3", "BB")]);
    let report = registry.reload().expect("reload must succeed");
    assert!(report.quarantined.is_empty());
    assert_eq!(
        registry
            .get(&version("1.2.3"))
            .expect("must resolve again")
            .checksum,
        "bb"
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn get_falls_back_to_package_endpoint() {
    let root = test_root("package-info");
    let mirror = root.join("mirror");
    write_versions(&mirror, Channel::Stable, &[("1.2.2", "aa")]);
    write_package_info(&mirror, "1.0.5", "cc");
    let registry = test_registry(&root, &mirror);

    let record = registry.get(&version("1.0.5")).expect("must find via package info");
    assert_eq!(record.checksum, "cc");

    let err = registry
        .get(&version("9.9.9"))
        .expect_err("unknown version must be not found");
    assert!(matches!(
        err.downcast_ref::<UpdateError>(),
        Some(UpdateError::NotFound { version }) if version == "9.9.9"
    ));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn package_endpoint_cannot_redefine_a_listed_checksum() {
    let root = test_root("package-tamper");
    let mirror = root.join("mirror");
    write_package_info(&mirror, "1.0.5", "cc");
    write_versions(&mirror, Channel::Stable, &[("1.2.2", "aa")]);
    let registry = test_registry(&root, &mirror);
    registry.get(&version("1.0.5")).expect("first lookup records checksum");

    write_package_info(&mirror, "1.0.5", "dd");
    let fresh = test_registry(&root, &mirror);
    let err = fresh
        .get(&version("1.0.5"))
        .expect_err("changed checksum must be refused");
    assert!(matches!(
        err.downcast_ref::<UpdateError>(),
        Some(UpdateError::ManifestTampered { .. })
    ));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn check_for_update_returns_only_newer_releases() {
    let root = test_root("check");
    let mirror = root.join("mirror");
    write_versions(&mirror, Channel::Stable, &[("1.2.2", "aa"), ("1.2.3", "bb")]);
    let registry = test_registry(&root, &mirror);

    let update = registry
        .check_for_update(Channel::Stable, Some(&version("1.2.2")))
        .expect("must check")
        .expect("1.2.3 must be offered");
    assert_eq!(update.version_string(), "1.2.3");

    assert!(registry
        .check_for_update(Channel::Stable, Some(&version("1.2.3")))
        .expect("must check")
        .is_none());
    assert!(registry
        .check_for_update(Channel::Stable, None)
        .expect("must check")
        .is_some());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn changelog_absence_is_not_an_error() {
    let root = test_root("changelog");
    let mirror = root.join("mirror");
    write_versions(&mirror, Channel::Stable, &[("1.2.3", "aa")]);
    fs::create_dir_all(mirror.join("changelog")).expect("must create changelog dir");
    fs::write(mirror.join("changelog/1.2.3.txt"), "- fixed spooler\n")
        .expect("must write changelog");
    let registry = test_registry(&root, &mirror);

    assert_eq!(
        registry
            .changelog(&version("1.2.3"))
            .expect("must read changelog")
            .as_deref(),
        Some("- fixed spooler\n")
    );
    assert!(registry
        .changelog(&version("1.0.0"))
        .expect("missing changelog is fine")
        .is_none());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn concurrent_readers_never_observe_a_partial_manifest() {
    let root = test_root("torn");
    let mirror = root.join("mirror");
    let first = [("1.0.0", "a1"), ("1.1.0", "a2")];
    let second = [("1.0.0", "a1"), ("1.1.0", "a2"), ("1.2.0", "a3"), ("1.3.0", "a4")];
    write_versions(&mirror, Channel::Stable, &first);
    let registry = Arc::new(test_registry(&root, &mirror));
    registry.reload().expect("initial reload must succeed");

    let readers = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let count = registry
                        .resolve(Channel::Stable)
                        .expect("must resolve")
                        .releases
                        .len();
                    assert!(count == 2 || count == 4, "torn manifest with {count} releases");
                }
            })
        })
        .collect::<Vec<_>>();

    for round in 0..20 {
        if round % 2 == 0 {
            write_versions(&mirror, Channel::Stable, &second);
        } else {
            write_versions(&mirror, Channel::Stable, &first);
        }
        registry.reload().expect("reload must succeed");
    }

    for reader in readers {
        reader.join().expect("reader must not panic");
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn ledger_rejects_redefinition_but_accepts_case_changes() {
    let mut ledger = ChecksumLedger::default();
    ledger.observe("1.0.0", "AbC").expect("first observation");
    assert_eq!(ledger.known("1.0.0"), Some("abc"));
    ledger.observe("1.0.0", "abc").expect("same checksum");
    assert_eq!(ledger.observe("1.0.0", "abd"), Err("abc".to_string()));
}

fn test_registry(root: &Path, mirror: &Path) -> ManifestRegistry {
    ManifestRegistry::new(
        Arc::new(FilesystemUpdateSource::new(mirror)),
        root.join("state").join("manifest"),
    )
}

fn write_versions(mirror: &Path, channel: Channel, versions: &[(&str, &str)]) {
    fs::create_dir_all(mirror).expect("must create mirror");
    let records = versions
        .iter()
        .map(|(version, checksum)| {
            serde_json::json!({
                "version": version,
                "release_date": "2024-03-01",
                "checksum": checksum,
                "size": 1024,
                "download_url": format!("/packages/{version}.tar.gz"),
            })
        })
        .collect::<Vec<_>>();
    let body = serde_json::json!({ "versions": records });
    let path = mirror.join(format!("versions-{}.json", channel.as_str()));
    let tmp = mirror.join(format!(".versions-{}.tmp", channel.as_str()));
    fs::write(&tmp, body.to_string()).expect("must write version list");
    fs::rename(&tmp, &path).expect("must replace version list");
}

fn write_package_info(mirror: &Path, version: &str, checksum: &str) {
    let dir = mirror.join("package");
    fs::create_dir_all(&dir).expect("must create package dir");
    let body = serde_json::json!({
        "version": version,
        "checksum": checksum,
        "size": 10,
        "download_url": format!("/packages/{version}.tar.gz"),
    });
    fs::write(dir.join(format!("{version}.json")), body.to_string())
        .expect("must write package info");
}

fn version(raw: &str) -> semver::Version {
    semver::Version::parse(raw).expect("valid version")
}

fn test_root(name: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!("rollway-registry-test-{name}-{nanos}-{seq}"));
    fs::create_dir_all(&root).expect("must create test root");
    root
}
