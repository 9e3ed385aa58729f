//! Configuration for WoW Sync.
//!
//! Loads and validates a TOML configuration file. The sync engine only reads
//! the configuration; the CLI persists confirmed values after a successful
//! repository initialization.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dataset::ProductVariant;
use crate::errors::ConfigError;
use crate::models::ConflictStrategy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Paths, remote, and engine behaviour.
    pub sync: SyncSection,

    /// What to copy out of the WoW installation.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Identity recorded on sync commits.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Credential lookup settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Auto-sync around game sessions.
    #[serde(default)]
    pub watch: WatchConfig,
}

// ---------------------------------------------------------------------------
// Sync section
// ---------------------------------------------------------------------------

/// Core sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// WoW installation directory containing `_retail_`, `_classic_`, ...
    pub root_path: PathBuf,

    /// Upstream repository URL. Unset means local-only history.
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Branch used for commits and transfers.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Directory holding the managed repository, token cache, and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How pull resolves conflicting paths.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
}

fn default_branch() -> String {
    "main".into()
}

fn default_log_level() -> String {
    "info".into()
}

/// `~/.wow_sync`, or a relative `.wow_sync` when no home directory is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".wow_sync"))
        .unwrap_or_else(|| PathBuf::from(".wow_sync"))
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Selection of variants, files, and accounts to sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Whether `WTF/Config.wtf` (graphics and client settings) is synced.
    #[serde(default = "default_true")]
    pub sync_config_wtf: bool,

    /// Glob patterns matched against paths relative to a tracked tree.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    #[serde(default)]
    pub variants: VariantToggles,

    /// Per-variant account allow-list, keyed by variant key (`retail`, ...).
    /// A variant without an entry syncs every account.
    #[serde(default)]
    pub selected_accounts: BTreeMap<String, Vec<String>>,

    /// Per-variant character allow-list: variant key, then account name,
    /// then `Realm/Character` entries. Within a listed account, a realm with
    /// no selected character keeps all of its characters.
    #[serde(default)]
    pub selected_characters: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            sync_config_wtf: true,
            ignore_patterns: default_ignore_patterns(),
            variants: VariantToggles::default(),
            selected_accounts: BTreeMap::new(),
            selected_characters: BTreeMap::new(),
        }
    }
}

fn default_ignore_patterns() -> Vec<String> {
    vec!["**/*.bak".into(), "**/*.tmp".into()]
}

fn default_true() -> bool {
    true
}

/// Which product variants are synced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantToggles {
    #[serde(default = "default_true")]
    pub retail: bool,
    #[serde(default = "default_true")]
    pub classic: bool,
    #[serde(default = "default_true")]
    pub classic_era: bool,
}

impl Default for VariantToggles {
    fn default() -> Self {
        Self {
            retail: true,
            classic: true,
            classic_era: true,
        }
    }
}

impl VariantToggles {
    pub fn is_enabled(&self, variant: ProductVariant) -> bool {
        match variant {
            ProductVariant::Retail => self.retail,
            ProductVariant::Classic => self.classic,
            ProductVariant::ClassicEra => self.classic_era,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Author/committer identity for sync commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_name")]
    pub name: String,
    #[serde(default = "default_identity_email")]
    pub email: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            email: default_identity_email(),
        }
    }
}

fn default_identity_name() -> String {
    "WoW Sync".into()
}

fn default_identity_email() -> String {
    "wowsync@local".into()
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Where credentials come from when the remote asks for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding a GitHub (or other HTTPS) token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Try `gh auth token` for github.com remotes.
    #[serde(default = "default_true")]
    pub use_gh_cli: bool,

    /// Private key for SSH remotes. Defaults to `~/.ssh/id_rsa`.
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            use_gh_cli: true,
            ssh_key: None,
            token: None,
        }
    }
}

fn default_token_env() -> String {
    "WOWSYNC_GITHUB_TOKEN".into()
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

/// Settings for `wowsync watch`, which pulls when the game starts and pushes
/// once the last game process exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Master switch; `watch` refuses to run when off.
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    /// Seconds between process list polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Case-insensitive substrings matched against process names.
    #[serde(default = "default_process_patterns")]
    pub process_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            poll_interval_secs: default_poll_interval_secs(),
            process_patterns: default_process_patterns(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_process_patterns() -> Vec<String> {
    [
        "wow.exe",
        "wowclassic.exe",
        "wow-64.exe",
        "wowclassic-64.exe",
        "world of warcraft.exe",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

// ---------------------------------------------------------------------------
// Construction, loading, saving
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Build a configuration with defaults for everything but the two
    /// user-supplied values.
    pub fn new(root_path: impl Into<PathBuf>, remote_url: Option<String>) -> Self {
        Self {
            sync: SyncSection {
                root_path: root_path.into(),
                remote_url,
                branch: default_branch(),
                data_dir: default_data_dir(),
                log_level: default_log_level(),
                conflict_strategy: ConflictStrategy::default(),
            },
            filters: FilterConfig::default(),
            identity: IdentityConfig::default(),
            auth: AuthConfig::default(),
            watch: WatchConfig::default(),
        }
    }

    /// Override the data directory (tests, portable installs).
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.sync.data_dir = data_dir.into();
        self
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    /// Load a [`SyncConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: SyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.sync.root_path = expand_tilde(&config.sync.root_path);
        config.sync.data_dir = expand_tilde(&config.sync.data_dir);
        if let Some(key) = config.auth.ssh_key.take() {
            config.auth.ssh_key = Some(expand_tilde(&key));
        }

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, contents)?;
        info!(path = %path.display(), "saved configuration");
        Ok(())
    }

    /// Resolve environment variable references.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        self.auth.token = resolve_optional_env(&self.auth.token_env, "auth.token_env");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    ///
    /// The root path's existence is not checked here: a missing installation
    /// is reported by the sync session as `PathNotFound`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.root_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sync.root_path".into(),
                detail: "root path must not be empty".into(),
            });
        }
        if !self.sync.root_path.is_absolute() {
            return Err(ConfigError::InvalidValue {
                field: "sync.root_path".into(),
                detail: "root path must be absolute".into(),
            });
        }
        if let Some(url) = &self.sync.remote_url {
            if url.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "sync.remote_url".into(),
                    detail: "remote URL must not be blank (omit it for local-only use)".into(),
                });
            }
        }
        if self.sync.branch.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sync.branch".into(),
                detail: "branch must not be empty".into(),
            });
        }
        if !matches!(
            self.sync.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::InvalidValue {
                field: "sync.log_level".into(),
                detail: format!("unknown level '{}'", self.sync.log_level),
            });
        }
        if self.sync.root_path.starts_with(self.repo_path())
            || self.repo_path().starts_with(&self.sync.root_path)
        {
            return Err(ConfigError::InvalidValue {
                field: "sync.data_dir".into(),
                detail: "repository location must not overlap the root path".into(),
            });
        }
        if self.filters.ignore_patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "filters.ignore_patterns".into(),
                detail: "patterns must not be empty".into(),
            });
        }
        for key in self.filters.selected_accounts.keys() {
            if ProductVariant::from_key(key).is_none() {
                return Err(ConfigError::InvalidValue {
                    field: "filters.selected_accounts".into(),
                    detail: format!("unknown variant '{}'", key),
                });
            }
        }
        for (key, accounts) in &self.filters.selected_characters {
            if ProductVariant::from_key(key).is_none() {
                return Err(ConfigError::InvalidValue {
                    field: "filters.selected_characters".into(),
                    detail: format!("unknown variant '{}'", key),
                });
            }
            for entry in accounts.values().flatten() {
                let valid = entry
                    .split_once('/')
                    .is_some_and(|(realm, name)| {
                        !realm.is_empty() && !name.is_empty() && !name.contains('/')
                    });
                if !valid {
                    return Err(ConfigError::InvalidValue {
                        field: "filters.selected_characters".into(),
                        detail: format!("'{}' is not of the form Realm/Character", entry),
                    });
                }
            }
        }
        if self.watch.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "watch.poll_interval_secs".into(),
                detail: "poll interval must be at least one second".into(),
            });
        }
        if self.watch.process_patterns.is_empty()
            || self.watch.process_patterns.iter().any(|p| p.trim().is_empty())
        {
            return Err(ConfigError::InvalidValue {
                field: "watch.process_patterns".into(),
                detail: "at least one non-empty process pattern is required".into(),
            });
        }
        if self.identity.name.is_empty() || self.identity.email.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "identity".into(),
                detail: "name and email must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Location of the managed git repository.
    pub fn repo_path(&self) -> PathBuf {
        self.sync.data_dir.join("repo")
    }

    /// Cached HTTPS token written by interactive credential prompts.
    pub fn token_file_path(&self) -> PathBuf {
        self.sync.data_dir.join("github_token.json")
    }

    /// On-disk session lock.
    pub fn lock_path(&self) -> PathBuf {
        self.sync.data_dir.join("session.lock")
    }

    /// Rolling log file directory.
    pub fn log_dir(&self) -> PathBuf {
        self.sync.data_dir.join("logs")
    }

    /// Generate a default TOML config template string.
    pub fn default_template() -> &'static str {
        r#"# WoW Sync configuration

[sync]
root_path = "/path/to/World of Warcraft"
remote_url = "https://github.com/yourname/wow-settings.git"
branch = "main"
# data_dir = "~/.wow_sync"
log_level = "info"
# remote-wins | local-wins | fail-fast
conflict_strategy = "remote-wins"

[filters]
sync_config_wtf = true
ignore_patterns = ["**/*.bak", "**/*.tmp"]

[filters.variants]
retail = true
classic = true
classic_era = true

# [filters.selected_accounts]
# retail = ["MYACCOUNT"]

# [filters.selected_characters.retail]
# MYACCOUNT = ["Silvermoon/Mychar"]

[identity]
name = "WoW Sync"
email = "wowsync@local"

[auth]
token_env = "WOWSYNC_GITHUB_TOKEN"
use_gh_cli = true
# ssh_key = "~/.ssh/id_ed25519"

[watch]
# `wowsync watch`: pull when WoW starts, push when it exits
auto_sync = true
poll_interval_secs = 2
process_patterns = ["wow.exe", "wowclassic.exe", "wow-64.exe", "wowclassic-64.exe", "world of warcraft.exe"]
"#
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Try to read an environment variable by name.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            debug!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
[sync]
root_path = "/games/World of Warcraft"
remote_url = "git@github.com:me/wow.git"
data_dir = "/tmp/wowsync-data"
conflict_strategy = "local-wins"

[filters]
sync_config_wtf = false

[filters.variants]
classic = false

[filters.selected_accounts]
retail = ["ACCOUNT1"]

[filters.selected_characters.retail]
ACCOUNT1 = ["Silvermoon/Alpha"]

[watch]
auto_sync = false
"#
    }

    #[test]
    fn test_parse_config() {
        let config: SyncConfig = toml::from_str(sample_toml()).unwrap();
        assert_eq!(
            config.sync.root_path,
            PathBuf::from("/games/World of Warcraft")
        );
        assert_eq!(
            config.sync.remote_url.as_deref(),
            Some("git@github.com:me/wow.git")
        );
        assert_eq!(config.sync.branch, "main");
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::LocalWins);
        assert!(!config.filters.sync_config_wtf);
        assert!(config.filters.variants.retail);
        assert!(!config.filters.variants.classic);
        assert!(config.filters.variants.classic_era);
        assert_eq!(config.filters.selected_accounts["retail"], vec!["ACCOUNT1"]);
        assert_eq!(
            config.filters.selected_characters["retail"]["ACCOUNT1"],
            vec!["Silvermoon/Alpha"]
        );
        assert!(!config.watch.auto_sync);
        assert_eq!(config.watch.poll_interval_secs, 2);
        assert_eq!(config.identity.name, "WoW Sync");
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::new("/wow", None);
        assert_eq!(config.sync.branch, "main");
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::RemoteWins);
        assert!(config.filters.sync_config_wtf);
        assert_eq!(config.filters.ignore_patterns, vec!["**/*.bak", "**/*.tmp"]);
        assert!(config.sync.data_dir.ends_with(".wow_sync"));
        assert!(config.repo_path().ends_with(".wow_sync/repo"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = SyncConfig::new("/wow", Some("https://example.com/r.git".into()))
            .with_data_dir(dir.path().join("data"));
        config.save_to_file(&path).unwrap();

        let loaded = SyncConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.sync.root_path, PathBuf::from("/wow"));
        assert_eq!(
            loaded.sync.remote_url.as_deref(),
            Some("https://example.com/r.git")
        );
        assert_eq!(loaded.sync.data_dir, dir.path().join("data"));
    }

    #[test]
    fn test_file_not_found() {
        let result = SyncConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_relative_root() {
        let config = SyncConfig::new("wow", None);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sync.root_path"
        ));
    }

    #[test]
    fn test_validate_rejects_blank_remote() {
        let config = SyncConfig::new("/wow", Some("  ".into()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlapping_data_dir() {
        let config = SyncConfig::new("/wow", None).with_data_dir("/wow/.sync");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sync.data_dir"
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_account_variant() {
        let mut config = SyncConfig::new("/wow", None);
        config
            .filters
            .selected_accounts
            .insert("burning-crusade".into(), vec!["A".into()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_character_entry() {
        let mut config = SyncConfig::new("/wow", None);
        let mut accounts = BTreeMap::new();
        accounts.insert("A".to_string(), vec!["Alpha".to_string()]);
        config
            .filters
            .selected_characters
            .insert("retail".into(), accounts);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "filters.selected_characters"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let mut config = SyncConfig::new("/wow", None);
        config.watch.poll_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "watch.poll_interval_secs"
        ));
    }

    #[test]
    fn test_default_template_is_valid() {
        let config: SyncConfig = toml::from_str(SyncConfig::default_template()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.watch.process_patterns, WatchConfig::default().process_patterns);
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("/absolute/path"));
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x")), home.join("x"));
        }
    }
}
