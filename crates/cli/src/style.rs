//! Shared styling utilities for the CLI.

use console::Style;

use wowsync_core::SyncDirection;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Direction label: push in blue, pull in green.
pub fn direction(direction: SyncDirection) -> String {
    match direction {
        SyncDirection::Push => Style::new()
            .blue()
            .bold()
            .apply_to("WoW → Remote")
            .to_string(),
        SyncDirection::Pull => Style::new()
            .green()
            .bold()
            .apply_to("Remote → WoW")
            .to_string(),
    }
}

/// Status indicator: a session holds the lock.
pub fn status_running() -> String {
    let style = Style::new().green();
    format!("{} Sync in progress", style.apply_to("●"))
}

pub fn status_idle() -> String {
    let style = Style::new().dim();
    format!("{} Idle", style.apply_to("○"))
}
