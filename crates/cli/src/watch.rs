//! Auto-sync around game sessions.
//!
//! Polls the process list and pulls when the first WoW client starts, then
//! pushes once the last one exits. Sessions go through the same engine
//! wiring as `push` and `pull`; a failed session is reported and watching
//! continues.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use sysinfo::System;
use tracing::{debug, error, info};

use wowsync_core::{SyncConfig, SyncDirection};

use crate::{signals, style};

/// A change in whether any game client is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameTransition {
    /// The first client appeared.
    Launched { pid: u32, name: String },
    /// The last client exited.
    Exited { pids: Vec<u32> },
}

/// Tracks running game clients across polls.
#[derive(Debug)]
pub struct GameTracker {
    patterns: Vec<String>,
    running: BTreeMap<u32, String>,
}

impl GameTracker {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
            running: BTreeMap::new(),
        }
    }

    /// Whether `name` looks like a WoW client. Our own binary never matches.
    pub fn is_game_process(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        if name.contains("wowsync") {
            return false;
        }
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }

    /// Record the current process list and report a transition between
    /// "no client running" and "some client running".
    pub fn observe<'a>(
        &mut self,
        processes: impl IntoIterator<Item = (u32, &'a str)>,
    ) -> Option<GameTransition> {
        let current: BTreeMap<u32, String> = processes
            .into_iter()
            .filter(|(_, name)| self.is_game_process(name))
            .map(|(pid, name)| (pid, name.to_string()))
            .collect();

        for (pid, name) in &current {
            if !self.running.contains_key(pid) {
                info!(pid, name = name.as_str(), "game process started");
            }
        }
        for pid in self.running.keys() {
            if !current.contains_key(pid) {
                info!(pid, "game process stopped");
            }
        }

        let previous = std::mem::replace(&mut self.running, current);
        match (previous.is_empty(), self.running.first_key_value()) {
            (true, Some((pid, name))) => Some(GameTransition::Launched {
                pid: *pid,
                name: name.clone(),
            }),
            (false, None) => Some(GameTransition::Exited {
                pids: previous.into_keys().collect(),
            }),
            _ => None,
        }
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }
}

/// [`GameTracker`] fed from the live process list.
pub struct GameProcesses {
    system: System,
    tracker: GameTracker,
}

impl GameProcesses {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            system: System::new(),
            tracker: GameTracker::new(patterns),
        }
    }

    pub fn poll(&mut self) -> Option<GameTransition> {
        self.system.refresh_processes();
        let processes = self
            .system
            .processes()
            .iter()
            .map(|(pid, process)| (pid.as_u32(), process.name()));
        self.tracker.observe(processes)
    }

    pub fn running(&self) -> usize {
        self.tracker.running()
    }
}

/// Watch for game sessions until interrupted.
pub async fn run_watch(config: SyncConfig, json: bool) -> Result<()> {
    if !config.watch.auto_sync {
        bail!("auto-sync is disabled; set `auto_sync = true` under [watch] to use `wowsync watch`");
    }

    let poll_interval = Duration::from_secs(config.watch.poll_interval_secs);
    let shutdown = Arc::new(AtomicBool::new(false));
    let interrupt = signals::cancel_on_interrupt(shutdown.clone());
    let mut games = GameProcesses::new(&config.watch.process_patterns);

    // Clients already running are tracked without a pull; their exit pushes.
    games.poll();
    info!(
        interval_secs = poll_interval.as_secs(),
        running = games.running(),
        "watching for game processes"
    );
    if !json {
        println!();
        println!("{}", style::header("Watching for World of Warcraft"));
        if games.running() > 0 {
            println!(
                "  {}",
                style::dim("WoW is already running; changes will be pushed when it exits")
            );
        }
        println!("  {}", style::dim("Press Ctrl+C to stop."));
        println!();
    }

    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("shutdown requested, exiting watch loop");
            break;
        }

        if let Some(transition) = games.poll() {
            let direction = match &transition {
                GameTransition::Launched { pid, name } => {
                    info!(pid, name = name.as_str(), "game started, pulling");
                    if !json {
                        println!("  {}", style::dim("WoW started: pulling updates"));
                    }
                    SyncDirection::Pull
                }
                GameTransition::Exited { pids } => {
                    info!(?pids, "game exited, pushing");
                    if !json {
                        println!("  {}", style::dim("WoW closed: pushing changes"));
                    }
                    SyncDirection::Push
                }
            };
            if let Err(e) =
                crate::run_session(config.clone(), direction, None, json, &shutdown).await
            {
                error!(error = %format!("{:#}", e), "auto-sync session failed");
                if !json {
                    eprintln!("  {}", style::error(&format!("{:#}", e)));
                }
            }
        }

        // Sleep with early exit on shutdown
        let step = Duration::from_millis(250).min(poll_interval);
        let mut slept = Duration::ZERO;
        while slept < poll_interval && !shutdown.load(Ordering::SeqCst) {
            tokio::time::sleep(step).await;
            slept += step;
        }
    }

    interrupt.abort();
    debug!("watch stopped");
    Ok(())
}
