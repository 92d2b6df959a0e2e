use super::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use clap::error::ErrorKind;
use flate2::write::GzEncoder;
use flate2::Compression;
use rollway_core::UpdateError;
use rollway_installer::{
    read_commit_record, read_current, read_transaction_metadata, set_active_transaction,
    DataLayout, Operation, PruneReport, TransitionFailure, TransitionState,
};
use rollway_security::sha256_hex;

use crate::commands::{build_update_source, resolve_data_dir, run_cli};
use crate::completion::write_completions_script;
use crate::render::{
    format_installed_lines, format_prune_report, format_transition_failure, render_status_line,
    resolve_output_style, OutputStyle,
};
use crate::settings::{load_settings, parse_settings, save_settings, Settings, SettingsUpdate};

#[test]
fn cli_parses_install_with_global_data_dir() {
    let cli = Cli::try_parse_from(["rollway", "install", "1.2.3", "--data-dir", "/srv/rollway"])
        .expect("must parse");
    assert_eq!(cli.data_dir, Some(PathBuf::from("/srv/rollway")));
    match cli.command {
        Commands::Install { version } => assert_eq!(version, "1.2.3"),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_parses_settings_set_flags() {
    let cli = Cli::try_parse_from([
        "rollway",
        "settings",
        "set",
        "--channel",
        "beta",
        "--keep-count",
        "3",
        "--auto-update",
        "true",
    ])
    .expect("must parse");
    match cli.command {
        Commands::Settings {
            command:
                SettingsCommands::Set {
                    channel,
                    keep_count,
                    auto_update,
                    update_server,
                    health_url,
                },
        } => {
            assert_eq!(channel, Some(Channel::Beta));
            assert_eq!(keep_count, Some(3));
            assert_eq!(auto_update, Some(true));
            assert!(update_server.is_none());
            assert!(health_url.is_none());
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_rejects_unknown_channel() {
    let err = Cli::try_parse_from(["rollway", "available", "--channel", "nightly"])
        .expect_err("unknown channel must fail");
    assert_eq!(err.kind(), ErrorKind::ValueValidation);
}

#[test]
fn cli_counts_verbose_flags() {
    let cli = Cli::try_parse_from(["rollway", "-vv", "status"]).expect("must parse");
    assert_eq!(cli.verbose, 2);
}

#[test]
fn data_dir_flag_wins_over_environment() {
    let flag = Path::new("/from/flag");
    assert_eq!(
        resolve_data_dir(Some(flag), Some("/from/env")).expect("must resolve"),
        PathBuf::from("/from/flag")
    );
    assert_eq!(
        resolve_data_dir(None, Some("/from/env")).expect("must resolve"),
        PathBuf::from("/from/env")
    );
}

#[test]
fn settings_defaults_are_valid() {
    let settings = Settings::default();
    settings.validate().expect("defaults must validate");
    assert_eq!(settings.channel, Channel::Stable);
    assert_eq!(settings.keep_count, 2);
    assert!(!settings.auto_update);
}

#[test]
fn partial_settings_file_falls_back_to_defaults() {
    let settings = parse_settings("channel = \"dev\"\nkeep_count = 4\n").expect("must parse");
    assert_eq!(settings.channel, Channel::Dev);
    assert_eq!(settings.keep_count, 4);
    assert_eq!(settings.health_window_secs, 30);
    assert!(settings.restart_command.is_none());

    let legacy = parse_settings("check_interval_hours = 24\nauto_update = true\n")
        .expect("unknown keys from older files must be ignored");
    assert!(legacy.auto_update);
}

#[test]
fn settings_reject_out_of_range_keep_count() {
    let err = parse_settings("keep_count = 0\n").expect_err("zero must be rejected");
    assert!(err.to_string().contains("keep_count"));
    assert!(parse_settings("keep_count = 6\n").is_err());
}

#[test]
fn settings_reject_non_http_health_url() {
    let err = parse_settings("health_url = \"localhost:8000\"\n").expect_err("must fail");
    assert!(err.to_string().contains("health_url"));
}

#[test]
fn settings_update_is_validated_before_applying() {
    let settings = Settings::default();
    let err = settings
        .apply(&SettingsUpdate {
            keep_count: Some(9),
            ..SettingsUpdate::default()
        })
        .expect_err("invalid update must fail");
    assert!(err.to_string().contains("keep_count"));

    let next = settings
        .apply(&SettingsUpdate {
            channel: Some(Channel::Beta),
            update_server: Some("  /srv/mirror  ".to_string()),
            ..SettingsUpdate::default()
        })
        .expect("valid update must apply");
    assert_eq!(next.channel, Channel::Beta);
    assert_eq!(next.update_server, "/srv/mirror");
    assert_eq!(next.keep_count, settings.keep_count);
    assert!(SettingsUpdate::default().is_empty());
}

#[test]
fn settings_round_trip_through_file() {
    let root = test_root("settings");
    let path = root.join("settings.toml");
    assert_eq!(load_settings(&path).expect("missing file"), Settings::default());

    let settings = Settings {
        auto_update: true,
        restart_command: Some("systemctl restart printd".to_string()),
        ..Settings::default()
    };
    save_settings(&path, &settings).expect("must save");
    assert_eq!(load_settings(&path).expect("must load"), settings);
    assert!(!root.join("settings.toml.tmp").exists());

    fs::write(&path, "keep_count = \"many\"\n").expect("must write");
    let err = load_settings(&path).expect_err("invalid file must fail");
    assert!(format!("{err:#}").contains("invalid settings file"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn update_source_kind_follows_server_scheme() {
    let mut settings = Settings::default();
    assert!(build_update_source(&settings)
        .expect("http source")
        .describe()
        .starts_with("http"));

    settings.update_server = "file:///srv/mirror".to_string();
    assert_eq!(
        build_update_source(&settings)
            .expect("filesystem source")
            .describe(),
        "filesystem:/srv/mirror"
    );
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "activated 1.2.3"),
        "activated 1.2.3"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "activated 1.2.3"),
        "[OK] activated 1.2.3"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "manifest refresh failed"),
        "[WARN] manifest refresh failed"
    );
    assert_eq!(resolve_output_style(false), OutputStyle::Plain);
    assert_eq!(resolve_output_style(true), OutputStyle::Rich);
}

#[test]
fn transition_failure_lines_report_disk_state() {
    let failure = TransitionFailure {
        operation: Operation::Install,
        target: "1.2.3".to_string(),
        phase: TransitionState::RollingBack,
        disk_changed: true,
        rolled_back: false,
        error: rollway_core::UpdateError::RollbackFailed {
            reason: "health-check-timeout".to_string(),
        },
    };
    let lines = format_transition_failure(&failure, OutputStyle::Plain);
    assert!(lines[0].starts_with("install of 1.2.3 failed during rolling_back"));
    assert!(lines.contains(&"disk_changed: true".to_string()));
    assert!(lines.iter().any(|line| line.contains("rollway repair")));
}

#[test]
fn installed_lines_report_empty_store() {
    assert_eq!(
        format_installed_lines(&[], None),
        vec!["no versions installed".to_string()]
    );
}

#[test]
fn prune_report_mentions_trimmed_history() {
    let report = PruneReport {
        keep_count: 2,
        kept: vec!["1.2.3".to_string()],
        pruned_transactions: vec!["install-1".to_string(), "install-2".to_string()],
        pruned_hook_logs: 4,
        ..PruneReport::default()
    };
    let lines = format_prune_report(&report, OutputStyle::Plain);
    assert_eq!(lines[0], "nothing to prune");
    assert!(lines.contains(&"trimmed 2 transaction record(s) and 4 hook log(s)".to_string()));
}

#[test]
fn completions_script_names_binary() {
    let mut output = Vec::new();
    write_completions_script(clap_complete::Shell::Bash, &mut output).expect("must generate");
    let script = String::from_utf8(output).expect("utf8 script");
    assert!(script.contains("rollway"));
    assert!(script.contains("rollback"));
}

#[test]
fn settings_set_persists_and_show_reads_back() {
    let root = test_root("settings-cli");
    let data = root.join("data");

    run(&data, &["settings", "set", "--keep-count", "3", "--channel", "beta"])
        .expect("settings set must succeed");
    let saved = load_settings(&data.join("settings.toml")).expect("must load");
    assert_eq!(saved.keep_count, 3);
    assert_eq!(saved.channel, Channel::Beta);

    run(&data, &["settings", "show"]).expect("settings show must succeed");
    assert!(run(&data, &["settings", "set"]).is_err());
    assert!(run(&data, &["settings", "set", "--keep-count", "0"]).is_err());
    assert_eq!(
        load_settings(&data.join("settings.toml"))
            .expect("must load")
            .keep_count,
        3
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn available_and_check_read_filesystem_mirror() {
    let root = test_root("available");
    let data = root.join("data");
    let mirror = root.join("mirror");
    publish(&mirror, "1.9.0");
    publish(&mirror, "1.10.0");
    write_settings(&data, &mirror, "");

    run(&data, &["available"]).expect("available must succeed");
    run(&data, &["check"]).expect("check must succeed");
    run(&data, &["changelog", "1.10.0"]).expect("changelog must succeed");
    run(&data, &["list"]).expect("list must succeed");
    run(&data, &["current"]).expect("current must succeed");
    run(&data, &["status"]).expect("status must succeed");
    run(&data, &["repair"]).expect("repair must succeed");
    run(&data, &["prune", "--keep", "1"]).expect("prune must succeed");
    assert!(data.join("state/manifest/cache.json").is_file());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn auto_update_respects_disabled_setting() {
    let root = test_root("auto-update-off");
    let data = root.join("data");
    let mirror = root.join("mirror");
    publish(&mirror, "2.0.0");
    write_settings(&data, &mirror, "");

    run(&data, &["auto-update"]).expect("disabled auto-update must succeed");
    assert!(!data.join("versions/2.0.0").exists());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn install_with_unreachable_health_endpoint_rolls_back() {
    let root = test_root("install-unhealthy");
    let data = root.join("data");
    let mirror = root.join("mirror");
    publish(&mirror, "1.0.0");
    write_settings(
        &data,
        &mirror,
        "health_url = \"http://127.0.0.1:9/api/v1/health\"\nhealth_interval_secs = 1\nhealth_window_secs = 1\nprobe_timeout_secs = 1\n",
    );

    let err = run(&data, &["install", "1.0.0"]).expect_err("unhealthy install must fail");
    let failure = err
        .downcast_ref::<TransitionFailure>()
        .expect("failure must be a transition failure");
    assert_eq!(failure.phase, TransitionState::HealthChecking);
    assert!(failure.rolled_back);
    assert!(!failure.disk_changed);

    let layout = DataLayout::new(&data);
    assert!(read_current(&layout).expect("must read").is_none());
    assert!(read_commit_record(&layout).expect("must read").is_none());
    let txid = fs::read_dir(layout.transactions_dir())
        .expect("must list transactions")
        .filter_map(Result::ok)
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .map(str::to_string)
        })
        .next()
        .expect("transaction metadata must exist");
    let metadata = read_transaction_metadata(&layout, &txid)
        .expect("must read")
        .expect("metadata must exist");
    assert_eq!(metadata.state, TransitionState::RolledBack);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn install_while_another_transition_runs_touches_nothing() {
    let root = test_root("install-busy");
    let data = root.join("data");
    let mirror = root.join("mirror");
    publish(&mirror, "1.0.0");
    write_settings(&data, &mirror, "auto_update = true\n");
    let layout = DataLayout::new(&data);
    layout.ensure_base_dirs().expect("must create dirs");
    set_active_transaction(&layout, "install-other").expect("must claim marker");
    let before = tree_listing(&data);

    for args in [&["install", "1.0.0"][..], &["auto-update"][..]] {
        let err = run(&data, args).expect_err("busy controller must refuse");
        assert!(matches!(
            UpdateError::classify(err),
            UpdateError::AlreadyInProgress { ref txid, .. } if txid == "install-other"
        ));
    }
    assert_eq!(tree_listing(&data), before);
    assert!(!layout.manifest_state_dir().join("cache.json").exists());

    let _ = fs::remove_dir_all(&root);
}

fn run(data: &Path, args: &[&str]) -> anyhow::Result<()> {
    let data_dir = data.display().to_string();
    let mut argv = vec!["rollway", "--data-dir", data_dir.as_str()];
    argv.extend_from_slice(args);
    run_cli(Cli::try_parse_from(argv).expect("test args must parse"))
}

fn write_settings(data: &Path, mirror: &Path, extra: &str) {
    fs::create_dir_all(data).expect("must create data dir");
    let content = format!("update_server = \"{}\"\n{extra}", mirror.display());
    fs::write(data.join("settings.toml"), content).expect("must write settings");
}

fn publish(mirror: &Path, version: &str) {
    fs::create_dir_all(mirror.join("packages")).expect("must create mirror");
    fs::create_dir_all(mirror.join("changelog")).expect("must create changelog dir");

    let payload = format!("server {version}");
    let manifest = serde_json::json!({
        "version": version,
        "checksums": { "app/server.txt": sha256_hex(payload.as_bytes()) },
    })
    .to_string();
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, content) in [
        ("manifest.json", manifest.as_bytes()),
        ("app/server.txt", payload.as_bytes()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content)
            .expect("must append entry");
    }
    let bytes = builder
        .into_inner()
        .expect("must finish tar")
        .finish()
        .expect("must finish gzip");
    fs::write(mirror.join("packages").join(format!("{version}.tar.gz")), &bytes)
        .expect("must write package");
    fs::write(
        mirror.join("changelog").join(format!("{version}.txt")),
        format!("Changes in {version}\n"),
    )
    .expect("must write changelog");

    let list_path = mirror.join("versions-stable.json");
    let mut versions = fs::read_to_string(&list_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|value| value.get("versions").and_then(|v| v.as_array()).cloned())
        .unwrap_or_default();
    versions.push(serde_json::json!({
        "version": version,
        "checksum": sha256_hex(&bytes),
        "size": bytes.len(),
        "download_url": format!("packages/{version}.tar.gz"),
    }));
    fs::write(
        &list_path,
        serde_json::json!({ "versions": versions }).to_string(),
    )
    .expect("must write version list");
}

fn tree_listing(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).expect("must read dir") {
            let path = entry.expect("must read entry").path();
            let relative = path
                .strip_prefix(root)
                .expect("entry under root")
                .display()
                .to_string();
            let content = if path.is_dir() {
                pending.push(path.clone());
                String::new()
            } else {
                sha256_hex(&fs::read(&path).expect("must read file"))
            };
            out.push(format!("{relative} {content}"));
        }
    }
    out.sort();
    out
}

fn test_root(name: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!("rollway-cli-{name}-{nanos}-{seq}"));
    fs::create_dir_all(&root).expect("must create test root");
    root
}
