//! Interactive setup wizard.
//!
//! Asks for the WoW installation and the remote, initializes the managed
//! repository, and writes the configuration file only once the repository
//! is ready.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use console::Style;
use dialoguer::{Confirm, Input, MultiSelect, Select};

use wowsync_core::config::VariantToggles;
use wowsync_core::dataset::AccountInventory;
use wowsync_core::{ConflictStrategy, DatasetMapper, ProductVariant, SyncConfig};

use crate::style;

/// Run the wizard and write the config to `output`.
pub async fn run_init(output: &Path, data_dir: Option<PathBuf>) -> Result<()> {
    if output.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", output.display()))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;

        if !overwrite {
            println!(
                "{}",
                style::warn("Init cancelled. Existing file was not modified.")
            );
            return Ok(());
        }
    }

    let accent = Style::new().cyan().bold();
    println!();
    println!("{}", accent.apply_to("=== WoW Sync Setup ==="));
    println!();
    println!("This wizard connects your WoW installation to a git repository.");
    println!("Run `wowsync push` on your main machine and `wowsync pull` elsewhere.");
    println!();

    // -----------------------------------------------------------------
    // 1. WoW installation
    // -----------------------------------------------------------------
    println!("{}", style::header("1/4  WoW Installation"));
    println!();

    let root: String = Input::new()
        .with_prompt("World of Warcraft folder (contains _retail_, _classic_, ...)")
        .validate_with(|input: &String| -> Result<(), String> {
            let path = Path::new(input.trim());
            if !path.is_absolute() {
                Err("Enter an absolute path".into())
            } else if !path.is_dir() {
                Err("Folder does not exist".into())
            } else {
                Ok(())
            }
        })
        .interact_text()
        .context("failed to read WoW folder")?;
    let root_path = PathBuf::from(root.trim());

    let detected: Vec<ProductVariant> = ProductVariant::ALL
        .into_iter()
        .filter(|v| root_path.join(v.dir_name()).is_dir())
        .collect();
    if detected.is_empty() {
        println!(
            "  {}",
            style::warn("No _retail_, _classic_, or _classic_era_ folder found here")
        );
    } else {
        for variant in &detected {
            println!(
                "  {}",
                style::success(&format!("Found {}", variant.display_name()))
            );
        }
    }
    println!();

    // -----------------------------------------------------------------
    // 2. Remote
    // -----------------------------------------------------------------
    println!("{}", style::header("2/4  Remote Repository"));
    println!();

    let remote: String = Input::new()
        .with_prompt("Git remote URL (leave empty for local-only history)")
        .allow_empty(true)
        .interact_text()
        .context("failed to read remote URL")?;
    let remote_url = Some(remote.trim().to_string()).filter(|r| !r.is_empty());
    println!();

    // -----------------------------------------------------------------
    // 3. Sync options
    // -----------------------------------------------------------------
    println!("{}", style::header("3/4  Sync Options"));
    println!();

    let labels: Vec<&str> = ProductVariant::ALL
        .iter()
        .map(|v| v.display_name())
        .collect();
    let defaults: Vec<bool> = ProductVariant::ALL
        .iter()
        .map(|v| detected.is_empty() || detected.contains(v))
        .collect();
    let chosen = MultiSelect::new()
        .with_prompt("Game versions to sync (space to toggle)")
        .items(&labels)
        .defaults(&defaults)
        .interact()
        .context("failed to read variant selection")?;
    let enabled = |variant: ProductVariant| {
        ProductVariant::ALL
            .iter()
            .position(|v| *v == variant)
            .is_some_and(|i| chosen.contains(&i))
    };
    let variants = VariantToggles {
        retail: enabled(ProductVariant::Retail),
        classic: enabled(ProductVariant::Classic),
        classic_era: enabled(ProductVariant::ClassicEra),
    };

    let sync_config_wtf = Confirm::new()
        .with_prompt("Sync Config.wtf (graphics and client settings)?")
        .default(true)
        .interact()
        .context("failed to read Config.wtf preference")?;

    let limit_characters = Confirm::new()
        .with_prompt("Limit which characters are synced?")
        .default(false)
        .interact()
        .context("failed to read character preference")?;
    let mut selected_characters = BTreeMap::new();
    if limit_characters {
        let inventory = DatasetMapper::new(&root_path, variants.clone())
            .scan_inventory()
            .unwrap_or_default();
        for entry in inventory.iter().filter(|e| variants.is_enabled(e.variant)) {
            let mut accounts = BTreeMap::new();
            for account in entry.accounts.iter().filter(|a| !a.characters.is_empty()) {
                let items: Vec<String> = account
                    .characters
                    .iter()
                    .map(|c| format!("{} - {}", c.name, c.realm))
                    .collect();
                let chosen = MultiSelect::new()
                    .with_prompt(format!(
                        "{} characters on account {} (space to toggle)",
                        entry.variant.display_name(),
                        account.name
                    ))
                    .items(&items)
                    .defaults(&vec![true; items.len()])
                    .interact()
                    .context("failed to read character selection")?;
                if chosen.is_empty() {
                    println!(
                        "  {}",
                        style::warn(&format!(
                            "Nothing selected for {}; all of its characters will be synced",
                            account.name
                        ))
                    );
                }
                if let Some(selection) = character_selection(account, &chosen) {
                    accounts.insert(account.name.clone(), selection);
                }
            }
            if !accounts.is_empty() {
                selected_characters.insert(entry.variant.key().to_string(), accounts);
            }
        }
        if selected_characters.is_empty() {
            println!("  {}", style::dim("All characters will be synced"));
        }
    }

    let strategies = [
        ConflictStrategy::RemoteWins,
        ConflictStrategy::LocalWins,
        ConflictStrategy::FailFast,
    ];
    let strategy_labels = &[
        "remote-wins  : keep the remote copy of conflicting files",
        "local-wins   : keep this machine's copy of conflicting files",
        "fail-fast    : stop and leave files untouched",
    ];
    let strategy_choice = Select::new()
        .with_prompt("When both machines changed the same file")
        .items(strategy_labels)
        .default(0)
        .interact()
        .context("failed to read conflict strategy")?;
    let conflict_strategy = strategies
        .get(strategy_choice)
        .copied()
        .unwrap_or_default();

    let auto_sync = Confirm::new()
        .with_prompt("Allow `wowsync watch` to pull when WoW starts and push when it exits?")
        .default(true)
        .interact()
        .context("failed to read auto-sync preference")?;
    println!();

    // -----------------------------------------------------------------
    // 4. Summary
    // -----------------------------------------------------------------
    println!("{}", style::header("4/4  Summary"));
    println!();

    let mut config = SyncConfig::new(&root_path, remote_url);
    if let Some(dir) = data_dir {
        config = config.with_data_dir(dir);
    }
    config.filters.variants = variants;
    config.filters.sync_config_wtf = sync_config_wtf;
    config.filters.selected_characters = selected_characters;
    config.sync.conflict_strategy = conflict_strategy;
    config.watch.auto_sync = auto_sync;

    let label = Style::new().bold();
    let value = Style::new().cyan();
    println!(
        "  {:<12} {}",
        label.apply_to("WoW folder"),
        value.apply_to(root_path.display())
    );
    println!(
        "  {:<12} {}",
        label.apply_to("Remote"),
        value.apply_to(config.sync.remote_url.as_deref().unwrap_or("(none)"))
    );
    println!(
        "  {:<12} {}",
        label.apply_to("Repository"),
        value.apply_to(config.repo_path().display())
    );
    println!(
        "  {:<12} {}",
        label.apply_to("Conflicts"),
        value.apply_to(conflict_strategy)
    );
    let narrowed: usize = config
        .filters
        .selected_characters
        .values()
        .flat_map(|accounts| accounts.values())
        .map(Vec::len)
        .sum();
    if narrowed > 0 {
        println!(
            "  {:<12} {}",
            label.apply_to("Characters"),
            value.apply_to(format!("{} selected", narrowed))
        );
    }
    println!();

    config
        .validate()
        .context("the entered settings are not valid")?;

    let proceed = Confirm::new()
        .with_prompt("Initialize the repository with these settings?")
        .default(true)
        .interact()
        .context("failed to read confirmation")?;
    if !proceed {
        println!("{}", style::warn("Init cancelled. Nothing was written."));
        return Ok(());
    }

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    let frontend = crate::Frontend::new(config.clone(), false);
    let initialized = frontend.engine.initialize().await;
    frontend.finish().await;
    match initialized {
        Ok(head) => {
            if let Some(head) = head {
                println!(
                    "  {}",
                    style::success(&format!(
                        "Repository ready at {} ({})",
                        head.short_sha, head.summary
                    ))
                );
            }
        }
        Err(e) => bail!("repository initialization failed, configuration not saved: {}", e),
    }

    config
        .save_to_file(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "  {}",
        style::success(&format!("Configuration saved to {}", output.display()))
    );

    let tracked = DatasetMapper::new(&config.sync.root_path, config.filters.variants.clone())
        .scan()
        .unwrap_or_default();
    println!(
        "  {}",
        style::dim(&format!("{} folder(s) will be synced", tracked.len()))
    );
    println!();
    Ok(())
}

/// `Realm/Character` entries for the chosen indices, or `None` when all or
/// none were kept. A realm with no selected character is never narrowed.
fn character_selection(account: &AccountInventory, chosen: &[usize]) -> Option<Vec<String>> {
    if chosen.is_empty() || chosen.len() == account.characters.len() {
        return None;
    }
    Some(
        chosen
            .iter()
            .filter_map(|&i| account.characters.get(i))
            .map(|c| c.key())
            .collect(),
    )
}
