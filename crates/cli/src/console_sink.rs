//! Terminal binding of the engine's event sink: a spinner for phases and
//! styled lines for warnings, errors, and the final summary.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use wowsync_core::{ErrorKind, EventSink, SyncPhase, SyncSummary};

use crate::style;

pub struct ConsoleSink {
    spinner: ProgressBar,
}

impl ConsoleSink {
    pub fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self { spinner }
    }

    /// Handle used to suspend the spinner while prompting.
    pub fn progress(&self) -> ProgressBar {
        self.spinner.clone()
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for ConsoleSink {
    fn on_phase(&self, phase: SyncPhase, detail: &str) {
        if phase.is_terminal() {
            return;
        }
        if detail.is_empty() {
            self.spinner.set_message(phase.to_string());
        } else {
            self.spinner.set_message(format!("{}  {}", phase, style::dim(detail)));
        }
    }

    fn on_warning(&self, message: &str, path: Option<&str>) {
        let line = match path {
            Some(path) => format!("{} ({})", message, path),
            None => message.to_string(),
        };
        self.spinner.println(format!("  {}", style::warn(&line)));
    }

    fn on_info(&self, message: &str) {
        self.spinner.println(format!("  {}", style::dim(message)));
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.spinner.finish_and_clear();
        eprintln!("  {}", style::error(&format!("[{}] {}", kind, message)));
    }

    fn on_complete(&self, summary: &SyncSummary) {
        self.spinner.finish_and_clear();
        println!();
        println!("  {}", style::direction(summary.direction));
        if summary.no_changes {
            println!("  {}", style::success("Already up to date"));
        } else {
            println!(
                "  {}",
                style::success(&format!("{} path(s) changed", summary.changed_paths.len()))
            );
        }
        if !summary.conflicted_paths.is_empty() {
            println!(
                "  {}",
                style::warn(&format!(
                    "{} conflict(s) resolved",
                    summary.conflicted_paths.len()
                ))
            );
        }
        if let Some(commit) = &summary.commit {
            let short = &commit[..7.min(commit.len())];
            println!("  Commit     {}", short);
        }
        let elapsed = summary.completed_at - summary.started_at;
        println!(
            "  {}",
            style::dim(&format!("Finished in {}ms", elapsed.num_milliseconds()))
        );
        println!();
    }
}
