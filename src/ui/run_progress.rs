//! Live run progress UI.
//!
//! Renders [`RunEvent`]s as they arrive. It supports three output modes:
//! - `full`: progress bars and colors
//! - `minimal`: one line per finished stage
//! - `json`: one JSON event per line for machine consumption

use crate::scheduler::{RunEvent, RunSummary, StageStatus};
use crate::ui::icons::{CHECK, CLOCK, CROSS, JOIN, REPAIR, REVIEW, RUNNING, SNAPSHOT, SPARKLE, WARN};
use cascade_common::{RunStatus, ValidationResult};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Progress bars and colors
    #[default]
    Full,
    /// One line per finished stage
    Minimal,
    /// JSON-formatted events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Terminal renderer for one run.
pub struct RunUI {
    mode: UiMode,
    multi: MultiProgress,
    header: ProgressBar,
    /// Spinner per running stage
    stage_bars: Mutex<HashMap<String, ProgressBar>>,
    verbose: bool,
    term: Term,
}

impl RunUI {
    pub fn new(total_stages: usize, mode: UiMode, verbose: bool) -> Self {
        let multi = match mode {
            UiMode::Full => MultiProgress::new(),
            _ => MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        };
        let header = multi.add(ProgressBar::new(total_stages as u64));
        header.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░"),
        );
        header.set_prefix("run");
        header.set_message("starting...");

        Self {
            mode,
            multi,
            header,
            stage_bars: Mutex::new(HashMap::new()),
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    pub fn handle_event(&self, event: &RunEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &RunEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &RunEvent) {
        let line = match event {
            RunEvent::StageCompleted { stage, duration_ms, .. } => {
                format!("✓ {} ({})", stage, format_duration(Duration::from_millis(*duration_ms)))
            }
            RunEvent::StageFailed { stage, error, .. } => format!("✗ {} ({})", stage, error),
            RunEvent::ValidationCompleted { result, .. } => {
                format!("validation: {}", validation_line(result))
            }
            RunEvent::RepairStarted { stage, retry, .. } => format!("repair {}: {}", retry, stage),
            RunEvent::RunFinished { status, summary, .. } => format!(
                "Done: {}/{} {}",
                summary.completed + summary.restored,
                summary.total_stages,
                status
            ),
            _ => return,
        };
        let _ = writeln!(&self.term, "{}", line);
    }

    fn handle_full(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                graph,
                stages,
                resumed_from,
                run_id,
            } => {
                let resumed = resumed_from
                    .map(|id| format!(" (resumed from {})", id.short()))
                    .unwrap_or_default();
                self.println(format!(
                    "{} Run {} of {} with {} stages{}",
                    RUNNING,
                    style(run_id.short()).yellow().bold(),
                    style(graph).cyan(),
                    stages,
                    resumed
                ));
                self.header.set_message(graph.clone());
            }
            RunEvent::StageStarted { stage, attempt, .. } => self.on_stage_started(stage, *attempt),
            RunEvent::StageCompleted {
                stage, duration_ms, ..
            } => {
                self.finish_bar(
                    stage,
                    format!("{} {}", CHECK, format_duration(Duration::from_millis(*duration_ms))),
                );
                self.header.inc(1);
            }
            RunEvent::StageFailed { stage, error, .. } => {
                self.finish_bar(stage, format!("{} {}", CROSS, error));
                self.println(format!(
                    "  {} Stage {} {}: {}",
                    CROSS,
                    style(stage).red().bold(),
                    style("failed").red(),
                    error
                ));
            }
            RunEvent::GroupJoined {
                group,
                completed,
                failed,
                ..
            } => {
                let failed_note = if failed.is_empty() {
                    String::new()
                } else {
                    format!(", {} failed: {}", style(failed.len()).red(), failed.join(", "))
                };
                self.println(format!(
                    "  {} Group {} joined: {} completed{}",
                    JOIN,
                    style(group).cyan().bold(),
                    style(completed.len()).green(),
                    failed_note
                ));
            }
            RunEvent::SnapshotCreated {
                snapshot_id,
                boundary,
                ..
            } => {
                if self.verbose {
                    self.println(format!(
                        "  {} Snapshot {} at {}",
                        SNAPSHOT,
                        style(snapshot_id).dim(),
                        style(boundary).yellow()
                    ));
                }
            }
            RunEvent::ValidationCompleted { attempt, result, .. } => {
                let icon = if result.passed { REVIEW } else { WARN };
                self.println(format!(
                    "  {} Validation #{}: {}",
                    icon,
                    attempt,
                    validation_line(result)
                ));
                if self.verbose {
                    for issue in &result.issues {
                        self.println(format!("      {}", style(issue).dim()));
                    }
                }
            }
            RunEvent::RepairStarted {
                stage,
                retry,
                issues,
                ..
            } => {
                self.println(format!(
                    "  {} Repair {} re-running {} with {} issue(s)",
                    REPAIR,
                    style(retry).yellow().bold(),
                    style(stage).cyan(),
                    issues
                ));
            }
            RunEvent::RunFinished { status, summary, .. } => self.on_run_finished(*status, summary),
        }
    }

    fn on_stage_started(&self, stage: &str, attempt: u32) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner} {prefix:.bold} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_prefix(stage.to_string());
        bar.set_message(if attempt > 1 {
            format!("attempt {}", attempt)
        } else {
            "running".to_string()
        });
        bar.enable_steady_tick(Duration::from_millis(100));

        if let Ok(mut bars) = self.stage_bars.lock()
            && let Some(previous) = bars.insert(stage.to_string(), bar)
        {
            previous.finish_and_clear();
        }
    }

    fn finish_bar(&self, stage: &str, message: String) {
        if let Ok(mut bars) = self.stage_bars.lock()
            && let Some(bar) = bars.remove(stage)
        {
            bar.finish_with_message(message);
        }
    }

    fn on_run_finished(&self, status: RunStatus, summary: &RunSummary) {
        if let Ok(mut bars) = self.stage_bars.lock() {
            for (_, bar) in bars.drain() {
                bar.finish_and_clear();
            }
        }
        self.header.finish_and_clear();

        let rule = style("═".repeat(60)).cyan().to_string();
        self.println(String::new());
        self.println(rule.clone());
        let headline = match status {
            RunStatus::Completed => {
                format!("{} Run {} {}", SPARKLE, style("COMPLETE").green().bold(), SPARKLE)
            }
            RunStatus::CompletedWithWarnings => format!(
                "{} Run {}",
                WARN,
                style("COMPLETED WITH WARNINGS").yellow().bold()
            ),
            RunStatus::Cancelled => format!("{} Run {}", WARN, style("CANCELLED").yellow().bold()),
            _ => format!("{} Run {}", CROSS, style("FAILED").red().bold()),
        };
        self.println(headline);
        self.println(rule);

        self.println(format!(
            "{}  Stages: {}/{} completed ({} restored) in {}",
            CLOCK,
            style(summary.completed + summary.restored).green().bold(),
            summary.total_stages,
            summary.restored,
            format_duration(summary.duration)
        ));
        if summary.failed > 0 {
            self.println(format!("     {} stages failed", style(summary.failed).red().bold()));
        }
        if summary.skipped > 0 {
            self.println(format!("     {} stages skipped", style(summary.skipped).yellow()));
        }
        if self.verbose {
            for record in &summary.stages {
                let label = match &record.status {
                    StageStatus::Completed | StageStatus::Restored => {
                        style(record.status.label()).green()
                    }
                    StageStatus::Failed { .. } => style(record.status.label()).red(),
                    _ => style(record.status.label()).yellow(),
                };
                self.println(format!(
                    "     {:<24} {:<10} x{} {}",
                    record.stage,
                    label,
                    record.invocations,
                    format_duration(record.duration)
                ));
            }
        }
    }

    fn println(&self, line: String) {
        self.multi.println(line).ok();
    }
}

fn validation_line(result: &ValidationResult) -> String {
    let verdict = if result.passed {
        style("passed").green().to_string()
    } else {
        style("failed").red().to_string()
    };
    format!("{} ({})", verdict, result.summary())
}

/// Human-readable duration: `1h 2m 3s`, `4m 5s`, `6s` or `700ms`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_common::RunId;

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!(UiMode::parse("json"), UiMode::Json);
        assert_eq!(UiMode::parse("MINIMAL"), UiMode::Minimal);
        assert_eq!(UiMode::parse("full"), UiMode::Full);
        assert_eq!(UiMode::parse("anything_else"), UiMode::Full);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0ms");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_full_mode_tracks_stage_bars() {
        let ui = RunUI::new(2, UiMode::Full, false);
        let run_id = RunId::new();
        ui.handle_event(&RunEvent::StageStarted {
            run_id,
            stage: "profile".into(),
            attempt: 1,
        });
        assert_eq!(ui.stage_bars.lock().unwrap().len(), 1);

        ui.handle_event(&RunEvent::StageCompleted {
            run_id,
            stage: "profile".into(),
            keys: vec!["profile".into()],
            duration_ms: 12,
        });
        assert!(ui.stage_bars.lock().unwrap().is_empty());
        assert_eq!(ui.header.position(), 1);
    }
}
