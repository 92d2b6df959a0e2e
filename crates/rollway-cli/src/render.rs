use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use rollway_installer::{
    ControllerStatus, InstalledVersion, PruneReport, TransitionFailure, TransitionReport,
};
use rollway_registry::{Freshness, Resolution};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(std::io::stdout().is_terminal())
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

/// Spinner shown while a transition holds the controller. Plain output gets
/// no spinner.
pub(crate) struct TransitionSpinner {
    style: OutputStyle,
    label: String,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TransitionSpinner {
    pub(crate) fn start(style: OutputStyle, label: &str) -> Self {
        let progress_bar = if style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new_spinner();
            if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}")
            {
                progress_bar.set_style(template.tick_chars(spinner_tick_chars(label)));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        Self {
            style,
            label: label.to_string(),
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn finish(mut self) -> Option<String> {
        let progress_bar = self.progress_bar.take()?;
        progress_bar.finish_and_clear();
        Some(render_status_line(
            self.style,
            "step",
            &format!(
                "{} finished in {}",
                self.label,
                format_elapsed(self.started_at.elapsed())
            ),
        ))
    }
}

fn spinner_tick_chars(label: &str) -> &'static str {
    match label {
        "install" => ".oO@* ",
        "rollback" => "<^>v ",
        _ => "|/-\\ ",
    }
}

pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

pub(crate) fn format_transition_report(report: &TransitionReport, style: OutputStyle) -> Vec<String> {
    let verb = match report.operation {
        rollway_installer::Operation::Install => "activated",
        rollway_installer::Operation::Rollback => "rolled back to",
    };
    let mut lines = vec![render_status_line(
        style,
        "ok",
        &format!(
            "{verb} {} (previous: {})",
            report.version,
            report.previous.as_deref().unwrap_or("none")
        ),
    )];
    if report.reused {
        lines.push(render_status_line(
            style,
            "step",
            &format!("reused installed version {}", report.version),
        ));
    }
    if let Some(backup) = &report.backup {
        lines.push(render_status_line(
            style,
            "step",
            &format!("configuration backup: {}", backup.display()),
        ));
    }
    lines.push(render_status_line(
        style,
        "step",
        &format!("healthy after {} probe(s)", report.health_attempts),
    ));
    if let Some(pruned) = &report.pruned {
        if !pruned.removed.is_empty() {
            lines.push(render_status_line(
                style,
                "step",
                &format!("pruned {}", pruned.removed.join(", ")),
            ));
        }
    }
    lines.push(format!("txid: {}", report.txid));
    lines
}

pub(crate) fn format_transition_failure(
    failure: &TransitionFailure,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "err",
        &format!(
            "{} of {} failed during {}: {}",
            failure.operation, failure.target, failure.phase, failure.error
        ),
    )];
    if failure.rolled_back {
        lines.push(render_status_line(
            style,
            "warn",
            "automatic rollback restored the previous version",
        ));
    }
    lines.push(format!("disk_changed: {}", failure.disk_changed));
    if failure.disk_changed {
        lines.push(render_status_line(
            style,
            "warn",
            "inspect the service, then run `rollway repair`",
        ));
    }
    lines
}

pub(crate) fn format_installed_lines(
    installed: &[InstalledVersion],
    current: Option<&str>,
) -> Vec<String> {
    if installed.is_empty() {
        return vec!["no versions installed".to_string()];
    }
    installed
        .iter()
        .map(|entry| {
            let version = entry.version.to_string();
            let marker = if Some(version.as_str()) == current {
                "*"
            } else {
                " "
            };
            match &entry.receipt {
                Some(receipt) => format!(
                    "{marker} {version} channel={} installed_at={} files={}",
                    receipt.channel, receipt.installed_at_unix, receipt.file_count
                ),
                None => format!("{marker} {version}"),
            }
        })
        .collect()
}

pub(crate) fn format_resolution_lines(resolution: &Resolution, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if let Freshness::Stale { reason } = &resolution.freshness {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("update source unavailable, showing cached manifest ({reason})"),
        ));
    }
    if resolution.releases.is_empty() {
        lines.push(format!("no releases on channel {}", resolution.channel));
        return lines;
    }
    for release in &resolution.releases {
        let mut line = release.version.to_string();
        if let Some(date) = &release.release_date {
            line.push_str(&format!(" released={date}"));
        }
        if let Some(size) = release.size {
            line.push_str(&format!(" size={size}"));
        }
        lines.push(line);
    }
    lines
}

pub(crate) fn format_prune_report(report: &PruneReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if report.removed.is_empty() {
        lines.push(render_status_line(style, "step", "nothing to prune"));
    } else {
        lines.push(render_status_line(
            style,
            "ok",
            &format!("removed {}", report.removed.join(", ")),
        ));
    }
    lines.push(format!(
        "kept ({} beyond current): {}",
        report.keep_count,
        report.kept.join(", ")
    ));
    if !report.pruned_transactions.is_empty() || report.pruned_hook_logs > 0 {
        lines.push(render_status_line(
            style,
            "step",
            &format!(
                "trimmed {} transaction record(s) and {} hook log(s)",
                report.pruned_transactions.len(),
                report.pruned_hook_logs
            ),
        ));
    }
    for (version, reason) in &report.failed {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("could not remove {version}: {reason}"),
        ));
    }
    lines
}

pub(crate) fn format_status_lines(status: &ControllerStatus) -> Vec<String> {
    let mut lines = vec![
        format!("state: {}", status.state),
        format!("current: {}", status.current.as_deref().unwrap_or("none")),
    ];
    if let Some(active) = &status.active {
        lines.push(format!(
            "active: {} {} -> {} ({})",
            active.txid, active.operation, active.target_version, active.state
        ));
        if let Some(error) = &active.last_error {
            lines.push(format!("last_error: {error}"));
        }
    }
    if let Some(commit) = &status.last_commit {
        lines.push(format!(
            "last_commit: {} {} (previous: {}) at {}",
            commit.operation,
            commit.current,
            commit.previous.as_deref().unwrap_or("none"),
            commit.committed_at_unix
        ));
    }
    lines
}
