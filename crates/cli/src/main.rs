//! WoW Sync command-line tool.
//!
//! Sets up the repository, inspects the WoW installation, and runs push and
//! pull sessions against the configured remote.

mod console_sink;
mod init;
mod prompt;
mod signals;
mod style;
mod watch;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::ProgressBar;
use tokio::task::JoinHandle;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use wowsync_core::events::MultiSink;
use wowsync_core::git::DefaultCredentials;
use wowsync_core::{
    ChannelSink, ConflictStrategy, DatasetMapper, EventSink, SyncConfig, SyncDirection,
    SyncEngine, SyncSummary, TracingSink,
};

use crate::console_sink::ConsoleSink;
use crate::prompt::PromptCredentials;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// WoW Sync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "wowsync",
    version,
    about = "Sync World of Warcraft addons and settings through git"
)]
struct Cli {
    /// Path to the TOML configuration file [default: ~/.wow_sync/config.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print session events as JSON lines instead of a spinner.
    #[arg(long, global = true)]
    json: bool,

    /// Also log to the terminal (RUST_LOG overrides the level).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive setup: pick the WoW folder and remote, create the repository.
    Init {
        /// Directory for the repository, token cache, and logs.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Show what would be synced from the WoW folder.
    Scan,

    /// Upload local addons and settings to the remote.
    Push,

    /// Download the remote state into the WoW folder.
    Pull {
        /// Conflict policy for this run: remote-wins, local-wins, fail-fast.
        #[arg(short, long)]
        strategy: Option<ConflictStrategy>,
    },

    /// Show repository and remote status.
    Status,

    /// Pull when WoW starts and push when it exits, until interrupted.
    Watch,

    /// Inspect the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print a commented configuration template.
    Template,
    /// Print the config file location.
    Path,
    /// Validate the configuration file and print a summary.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(SyncConfig::default_path);

    match cli.command {
        Commands::Init { data_dir } => {
            let _guard = init_logging(None, cli.verbose);
            init::run_init(&config_path, data_dir).await
        }
        Commands::Config { action } => {
            let _guard = init_logging(None, cli.verbose);
            match action {
                ConfigAction::Template => {
                    print!("{}", SyncConfig::default_template());
                    Ok(())
                }
                ConfigAction::Path => {
                    println!("{}", config_path.display());
                    Ok(())
                }
                ConfigAction::Validate => cmd_validate(&config_path),
            }
        }
        command => {
            let config = load_config(&config_path)?;
            let _guard = init_logging(Some(&config), cli.verbose);

            match command {
                Commands::Scan => cmd_scan(&config, cli.json),
                Commands::Push => cmd_sync(config, SyncDirection::Push, None, cli.json).await,
                Commands::Pull { strategy } => {
                    cmd_sync(config, SyncDirection::Pull, strategy, cli.json).await
                }
                Commands::Status => cmd_status(config, cli.json),
                Commands::Watch => watch::run_watch(config, cli.json).await,
                _ => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Terminal logging only with `--verbose`; the daily log file under
/// `<data_dir>/logs` whenever a configuration is loaded. The returned guard
/// flushes the file writer on drop.
fn init_logging(config: Option<&SyncConfig>, verbose: bool) -> Option<WorkerGuard> {
    let console = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
    });

    let (file, guard) = match config {
        Some(config) => {
            let log_dir = config.log_dir();
            if let Err(e) = std::fs::create_dir_all(&log_dir) {
                eprintln!("warning: cannot create log directory {}: {}", log_dir.display(), e);
            }
            let appender = tracing_appender::rolling::daily(&log_dir, "wowsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let filter = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.sync.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info"));
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(console).with(file).init();
    guard
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<SyncConfig> {
    let mut config = SyncConfig::load_from_file(path).with_context(|| {
        format!(
            "failed to load configuration (run `wowsync init` to create {})",
            path.display()
        )
    })?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Engine wiring
// ---------------------------------------------------------------------------

/// The engine plus whatever renders its events.
pub(crate) struct Frontend {
    pub engine: SyncEngine,
    spinner: Option<ProgressBar>,
    printer: Option<JoinHandle<()>>,
}

impl Frontend {
    /// Console spinner, or JSON lines on stdout when `json` is set. Both also
    /// forward events to the log file.
    pub fn new(config: SyncConfig, json: bool) -> Self {
        let fallback = Box::new(DefaultCredentials::from_config(&config));
        let credentials = PromptCredentials::new(fallback, config.token_file_path());

        if json {
            let (sink, mut rx) = ChannelSink::channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!(error = %e, "failed to serialize event"),
                    }
                }
            });
            let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(sink), Arc::new(TracingSink)];
            let engine = SyncEngine::new(config, Arc::new(MultiSink(sinks)))
                .with_credentials(Arc::new(credentials));
            Self {
                engine,
                spinner: None,
                printer: Some(printer),
            }
        } else {
            let console = ConsoleSink::new();
            let spinner = console.progress();
            let credentials = credentials.with_progress(spinner.clone());
            let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(console), Arc::new(TracingSink)];
            let engine = SyncEngine::new(config, Arc::new(MultiSink(sinks)))
                .with_credentials(Arc::new(credentials));
            Self {
                engine,
                spinner: Some(spinner),
                printer: None,
            }
        }
    }

    /// Clear the spinner and wait until every JSON event is printed.
    pub async fn finish(self) {
        if let Some(spinner) = &self.spinner {
            if !spinner.is_finished() {
                spinner.finish_and_clear();
            }
        }
        let Self {
            engine, printer, ..
        } = self;
        drop(engine);
        if let Some(printer) = printer {
            let _ = printer.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_sync(
    config: SyncConfig,
    direction: SyncDirection,
    strategy: Option<ConflictStrategy>,
    json: bool,
) -> Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupt = signals::cancel_on_interrupt(interrupted.clone());
    let result = run_session(config, direction, strategy, json, &interrupted).await;
    interrupt.abort();
    result.map(|_| ())
}

/// Run one session to completion. Setting `interrupted` cancels it at the
/// next phase transition.
pub(crate) async fn run_session(
    config: SyncConfig,
    direction: SyncDirection,
    strategy: Option<ConflictStrategy>,
    json: bool,
    interrupted: &Arc<AtomicBool>,
) -> Result<SyncSummary> {
    let frontend = Frontend::new(config, json);
    let started = match direction {
        SyncDirection::Push => frontend.engine.start_push(),
        SyncDirection::Pull => frontend.engine.start_pull(strategy),
    };
    let session = match started {
        Ok(session) => session,
        Err(e) => {
            frontend.finish().await;
            return Err(e).context(format!("{} not started", direction));
        }
    };

    let forward = signals::forward_cancel(interrupted.clone(), session.cancel_token());
    let result = session.wait().await;
    forward.abort();
    frontend.finish().await;

    result.with_context(|| format!("{} failed", direction))
}

fn cmd_scan(config: &SyncConfig, json: bool) -> Result<()> {
    let mapper = DatasetMapper::new(&config.sync.root_path, config.filters.variants.clone());
    let scan = mapper
        .scan_detailed()
        .context("failed to scan the WoW folder")?;
    let inventory = mapper
        .scan_inventory()
        .context("failed to read account folders")?;

    if json {
        let value = serde_json::json!({
            "root": config.sync.root_path,
            "tracked": scan.tracked,
            "skipped": scan
                .skipped
                .iter()
                .map(|s| serde_json::json!({ "path": s.path, "reason": s.reason }))
                .collect::<Vec<_>>(),
            "inventory": inventory,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("{}", style::header("Tracked folders"));
    if scan.tracked.is_empty() {
        println!("  {}", style::warn("Nothing to sync under this folder"));
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Version", "Folder", "Repository path"]);
        for tracked in &scan.tracked {
            table.add_row(vec![
                tracked.variant.display_name().to_string(),
                tracked.source_rel().display().to_string(),
                tracked.repo_rel().display().to_string(),
            ]);
        }
        println!("{table}");
    }

    for skipped in &scan.skipped {
        println!(
            "  {}",
            style::warn(&format!("{}: {}", skipped.path.display(), skipped.reason))
        );
    }

    if !inventory.is_empty() {
        println!();
        println!("{}", style::header("Accounts"));
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Version", "Account", "Characters"]);
        for variant in &inventory {
            for account in &variant.accounts {
                let characters = account
                    .characters
                    .iter()
                    .map(|c| format!("{}-{}", c.name, c.realm))
                    .collect::<Vec<_>>()
                    .join(", ");
                table.add_row(vec![
                    variant.variant.display_name().to_string(),
                    account.name.clone(),
                    characters,
                ]);
            }
        }
        println!("{table}");
    }
    println!();
    Ok(())
}

fn cmd_status(config: SyncConfig, json: bool) -> Result<()> {
    let root = config.sync.root_path.clone();
    let engine = SyncEngine::new(config, Arc::new(TracingSink));
    let status = engine.status().context("failed to read repository status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("{}", style::header("WoW Sync"));
    println!("{}", "═".repeat(8));
    println!();

    let state = if status.session_running {
        style::status_running()
    } else {
        style::status_idle()
    };
    println!("  Status     {}", state);
    println!("  WoW        {}", root.display());
    println!(
        "  Remote     {}",
        status.remote_url.as_deref().unwrap_or("(none, local history only)")
    );

    if !status.initialized {
        println!(
            "  Repository {}",
            style::dim("not initialized. Run 'wowsync init' or 'wowsync push'.")
        );
        println!();
        return Ok(());
    }

    println!("  Repository {}", status.repo_path.display());
    println!("  Branch     {}", status.branch);
    match &status.head {
        Some(head) => println!(
            "  Head       {} {} {}",
            head.short_sha,
            head.summary,
            style::dim(&head.time.format("%Y-%m-%d %H:%M").to_string())
        ),
        None => println!("  Head       {}", style::dim("no commits yet")),
    }
    if let (Some(ahead), Some(behind)) = (status.ahead, status.behind) {
        let line = format!("{} ahead, {} behind (as of last transfer)", ahead, behind);
        if ahead == 0 && behind == 0 {
            println!("  Sync       {}", style::success(&line));
        } else {
            println!("  Sync       {}", style::warn(&line));
        }
    }

    if !status.uncommitted.is_empty() {
        println!();
        println!("  {}", style::header("Uncommitted changes in the repository"));
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Change", "Path"]);
        for change in &status.uncommitted {
            table.add_row(vec![format!("{:?}", change.change), change.path.clone()]);
        }
        println!("{table}");
    }
    println!();
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        SyncConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  {}", style::success("Environment variable references processed"));

    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {}", e)));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("All required fields are valid"));

    if !config.sync.root_path.is_dir() {
        println!(
            "  {}",
            style::warn(&format!(
                "WoW folder {} does not exist",
                config.sync.root_path.display()
            ))
        );
    }

    println!();
    println!("Configuration summary:");
    println!("  WoW folder    : {}", config.sync.root_path.display());
    println!(
        "  Remote        : {}",
        config.sync.remote_url.as_deref().unwrap_or("(none)")
    );
    println!("  Branch        : {}", config.sync.branch);
    println!("  Data dir      : {}", config.sync.data_dir.display());
    println!("  Conflicts     : {}", config.sync.conflict_strategy);
    println!(
        "  Token         : {}",
        if config.auth.token.is_some() {
            "set"
        } else {
            "not set (gh CLI, cached token, or prompt)"
        }
    );
    println!("  Config.wtf    : {}", config.filters.sync_config_wtf);
    let characters: usize = config
        .filters
        .selected_characters
        .values()
        .flat_map(|accounts| accounts.values())
        .map(Vec::len)
        .sum();
    if characters > 0 {
        println!("  Characters    : {} selected", characters);
    } else {
        println!("  Characters    : all");
    }
    println!("  Auto-sync     : {}", config.watch.auto_sync);

    Ok(())
}
