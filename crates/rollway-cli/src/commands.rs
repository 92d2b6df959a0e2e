use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rollway_core::{parse_version, UpdateError};
use rollway_installer::{
    default_data_dir, ActivationController, CommandServiceController, ControllerConfig,
    DataLayout, HealthProbe, HttpHealthProbe, NoopServiceController, ServiceController,
    TransitionFailure, TransitionReport,
};
use rollway_registry::{FilesystemUpdateSource, HttpUpdateSource, ManifestRegistry, UpdateSource};
use semver::Version;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::completion::write_completions_script;
use crate::render::{
    current_output_style, format_installed_lines, format_prune_report, format_resolution_lines,
    format_status_lines, format_transition_failure, format_transition_report,
    render_section_header, render_status_line, OutputStyle, TransitionSpinner,
};
use crate::settings::{load_settings, save_settings, Settings, SettingsUpdate};
use crate::{Cli, Commands, SettingsCommands};

pub(crate) const DATA_DIR_ENV: &str = "ROLLWAY_DATA_DIR";

/// `--verbose` wins over `RUST_LOG`; with neither only warnings are shown.
pub(crate) fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub(crate) fn resolve_data_dir(flag: Option<&Path>, env_value: Option<&str>) -> Result<PathBuf> {
    if let Some(flag) = flag {
        return Ok(flag.to_path_buf());
    }
    if let Some(value) = env_value.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(value));
    }
    default_data_dir()
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    let style = current_output_style();
    if let Commands::Completions { shell } = cli.command {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        return write_completions_script(shell, &mut handle);
    }

    let env_value = std::env::var(DATA_DIR_ENV).ok();
    let data_dir = resolve_data_dir(cli.data_dir.as_deref(), env_value.as_deref())?;
    let runtime = Runtime::open(data_dir, style)?;
    debug!(data_dir = %runtime.layout.root().display(), "runtime opened");

    match cli.command {
        Commands::Install { version } => {
            let version = parse_version(&version)?;
            let controller = runtime.controller()?;
            controller.ensure_idle()?;
            runtime.refresh_manifest(controller.registry());
            let outcome = run_transition(style, "install", || controller.install(&version));
            runtime.finish_transition(outcome)
        }
        Commands::Rollback => {
            let controller = runtime.controller()?;
            let outcome = run_transition(style, "rollback", || controller.rollback());
            runtime.finish_transition(outcome)
        }
        Commands::List => {
            let controller = runtime.controller()?;
            let current = controller.current_version()?;
            let installed = controller.installed()?;
            print_lines(&format_installed_lines(&installed, current.as_deref()));
            Ok(())
        }
        Commands::Current => {
            let controller = runtime.controller()?;
            match controller.current_version()? {
                Some(current) => println!("{current}"),
                None => println!("none"),
            }
            Ok(())
        }
        Commands::Available { channel } => {
            let channel = channel.unwrap_or(runtime.settings.channel);
            let registry = runtime.registry()?;
            runtime.refresh_manifest(&registry);
            let resolution = registry.resolve(channel)?;
            if let Some(header) = render_section_header(style, &format!("{channel} releases")) {
                println!("{header}");
            }
            print_lines(&format_resolution_lines(&resolution, style));
            Ok(())
        }
        Commands::Check { channel } => {
            let channel = channel.unwrap_or(runtime.settings.channel);
            let registry = runtime.registry()?;
            runtime.refresh_manifest(&registry);
            let current = current_semver(&runtime.layout)?;
            match registry.check_for_update(channel, current.as_ref())? {
                Some(release) => println!(
                    "{}",
                    render_status_line(
                        style,
                        "step",
                        &format!(
                            "update available: {} -> {} ({channel})",
                            describe_current(current.as_ref()),
                            release.version
                        ),
                    )
                ),
                None => println!(
                    "{}",
                    render_status_line(
                        style,
                        "ok",
                        &format!("up to date ({})", describe_current(current.as_ref())),
                    )
                ),
            }
            Ok(())
        }
        Commands::AutoUpdate => {
            let controller = runtime.controller()?;
            controller.ensure_idle()?;
            runtime.refresh_manifest(controller.registry());
            let current = current_semver(&runtime.layout)?;
            let Some(release) = controller
                .registry()
                .check_for_update(runtime.settings.channel, current.as_ref())?
            else {
                println!(
                    "{}",
                    render_status_line(style, "ok", "no newer version published")
                );
                return Ok(());
            };
            if !runtime.settings.auto_update {
                println!(
                    "{}",
                    render_status_line(
                        style,
                        "warn",
                        &format!(
                            "{} is available but auto_update is disabled",
                            release.version
                        ),
                    )
                );
                return Ok(());
            }
            let outcome = run_transition(style, "install", || controller.install(&release.version));
            runtime.finish_transition(outcome)
        }
        Commands::Changelog { version } => {
            let version = parse_version(&version)?;
            let registry = runtime.registry()?;
            match registry.changelog(&version)? {
                Some(text) => println!("{}", text.trim_end()),
                None => println!("no changelog published for {version}"),
            }
            Ok(())
        }
        Commands::Prune { keep } => {
            let controller = runtime.controller()?;
            let report = controller.prune(keep.unwrap_or(runtime.settings.keep_count))?;
            print_lines(&format_prune_report(&report, style));
            Ok(())
        }
        Commands::Settings { command } => run_settings_command(&runtime, command),
        Commands::Status => {
            let controller = runtime.controller()?;
            print_lines(&format_status_lines(&controller.status()?));
            Ok(())
        }
        Commands::Repair => {
            let controller = runtime.controller()?;
            match controller.repair()? {
                Some(metadata) => println!(
                    "{}",
                    render_status_line(
                        style,
                        "ok",
                        &format!(
                            "cleared {} ({} {}, {})",
                            metadata.txid,
                            metadata.operation,
                            metadata.target_version,
                            metadata.last_error.as_deref().unwrap_or("no error recorded")
                        ),
                    )
                ),
                None => println!(
                    "{}",
                    render_status_line(style, "step", "repair: no action needed")
                ),
            }
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn run_settings_command(runtime: &Runtime, command: SettingsCommands) -> Result<()> {
    match command {
        SettingsCommands::Show => {
            println!("settings: {}", runtime.layout.settings_path().display());
            print_lines(&runtime.settings.summary_lines());
            Ok(())
        }
        SettingsCommands::Set {
            channel,
            keep_count,
            auto_update,
            update_server,
            health_url,
        } => {
            let update = SettingsUpdate {
                channel,
                keep_count,
                auto_update,
                update_server,
                health_url,
            };
            if update.is_empty() {
                anyhow::bail!("settings set needs at least one option");
            }
            let next = runtime.settings.apply(&update)?;
            save_settings(&runtime.layout.settings_path(), &next)?;
            println!(
                "{}",
                render_status_line(runtime.style, "ok", "settings updated")
            );
            print_lines(&next.summary_lines());
            Ok(())
        }
    }
}

struct Runtime {
    layout: DataLayout,
    settings: Settings,
    style: OutputStyle,
}

impl Runtime {
    fn open(data_dir: PathBuf, style: OutputStyle) -> Result<Self> {
        let base = DataLayout::new(&data_dir);
        let settings = load_settings(&base.settings_path())?;
        let layout = match &settings.config_dir {
            Some(config_dir) => base.with_config_dir(config_dir),
            None => base,
        };
        layout.ensure_base_dirs()?;
        Ok(Self {
            layout,
            settings,
            style,
        })
    }

    fn registry(&self) -> Result<Arc<ManifestRegistry>> {
        let source = build_update_source(&self.settings)?;
        Ok(Arc::new(ManifestRegistry::new(
            source,
            self.layout.manifest_state_dir(),
        )))
    }

    fn controller(&self) -> Result<ActivationController> {
        let probe: Arc<dyn HealthProbe> = Arc::new(HttpHealthProbe::new(
            &self.settings.health_url,
            self.settings.probe_timeout(),
        )?);
        let service: Arc<dyn ServiceController> = match &self.settings.restart_command {
            Some(restart) => Arc::new(CommandServiceController::new(
                restart.clone(),
                self.settings.ready_command.clone(),
                self.settings.ready_timeout(),
            )),
            None => Arc::new(NoopServiceController),
        };
        Ok(ActivationController::new(
            self.layout.clone(),
            self.registry()?,
            service,
            probe,
            ControllerConfig {
                hook_timeouts: self.settings.hook_timeouts(),
                verifier: self.settings.verifier(),
                keep_count: self.settings.keep_count,
            },
        ))
    }

    /// A failed refresh is not fatal: the cached manifest keeps serving.
    fn refresh_manifest(&self, registry: &ManifestRegistry) {
        if let Err(err) = registry.reload() {
            match UpdateError::classify(err) {
                UpdateError::NoManifestAvailable { reason } => {
                    warn!(reason = %reason, "no manifest available");
                }
                other => println!(
                    "{}",
                    render_status_line(
                        self.style,
                        "warn",
                        &format!("manifest refresh failed: {other}"),
                    )
                ),
            }
        }
    }

    fn finish_transition(
        &self,
        outcome: std::result::Result<TransitionReport, TransitionFailure>,
    ) -> Result<()> {
        match outcome {
            Ok(report) => {
                print_lines(&format_transition_report(&report, self.style));
                Ok(())
            }
            Err(failure) => {
                for line in format_transition_failure(&failure, self.style) {
                    eprintln!("{line}");
                }
                Err(failure.into())
            }
        }
    }
}

fn run_transition<T>(style: OutputStyle, label: &str, run: impl FnOnce() -> T) -> T {
    let spinner = TransitionSpinner::start(style, label);
    let outcome = run();
    if let Some(line) = spinner.finish() {
        println!("{line}");
    }
    outcome
}

pub(crate) fn build_update_source(settings: &Settings) -> Result<Arc<dyn UpdateSource>> {
    let server = settings.update_server.trim();
    if server.starts_with("http://") || server.starts_with("https://") {
        return Ok(Arc::new(HttpUpdateSource::new(
            server,
            settings.request_timeout(),
        )?));
    }
    let root = server.strip_prefix("file://").unwrap_or(server);
    Ok(Arc::new(FilesystemUpdateSource::new(root)))
}

fn current_semver(layout: &DataLayout) -> Result<Option<Version>> {
    let Some(current) = rollway_installer::read_current(layout)? else {
        return Ok(None);
    };
    parse_version(&current)
        .map(Some)
        .with_context(|| format!("current pointer names an invalid version '{current}'"))
}

fn describe_current(current: Option<&Version>) -> String {
    current
        .map(Version::to_string)
        .unwrap_or_else(|| "nothing installed".to_string())
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}
