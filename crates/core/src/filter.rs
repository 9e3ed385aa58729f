//! Copy filter applied while mirroring tracked trees.
//!
//! [`CopyFilter`] decides, per entry of a tracked tree, whether it belongs in
//! the repository. Paths are relative to the tracked tree root and always
//! forward-slash separated.
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | `WTF/SavedVariables` directory | `SavedVariables` |
//! | `Config.wtf` while config sync is off | `ConfigExcluded` |
//! | `WTF/Account/<name>` not in the account allow-list | `AccountNotSelected` |
//! | `WTF/Account/<name>/<realm>/<char>` not in the character allow-list | `CharacterNotSelected` |
//! | Path matches an ignore pattern | `Ignored` |
//! | None of the above | `Allow` |

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::FilterConfig;
use crate::dataset::{TrackedPath, TreeKind};

/// The outcome of evaluating an entry against the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Ignored { pattern: String },
    ConfigExcluded,
    SavedVariables,
    AccountNotSelected { account: String },
    CharacterNotSelected {
        account: String,
        realm: String,
        character: String,
    },
}

impl FilterDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ignored { .. } => "ignored",
            Self::ConfigExcluded => "config-excluded",
            Self::SavedVariables => "saved-variables",
            Self::AccountNotSelected { .. } => "account-not-selected",
            Self::CharacterNotSelected { .. } => "character-not-selected",
        }
    }
}

/// Per-tree filter built from the `[filters]` config section.
#[derive(Debug, Clone)]
pub struct CopyFilter {
    kind: TreeKind,
    ignore_patterns: Vec<String>,
    sync_config_wtf: bool,
    selected_accounts: Option<Vec<String>>,
    /// Account name to `Realm/Character` entries.
    selected_characters: Option<BTreeMap<String, Vec<String>>>,
}

impl CopyFilter {
    /// Build the filter for one tracked tree.
    pub fn for_tree(config: &FilterConfig, tracked: &TrackedPath) -> Self {
        Self {
            kind: tracked.kind,
            ignore_patterns: config.ignore_patterns.clone(),
            sync_config_wtf: config.sync_config_wtf,
            selected_accounts: config
                .selected_accounts
                .get(tracked.variant.key())
                .cloned(),
            selected_characters: config
                .selected_characters
                .get(tracked.variant.key())
                .cloned(),
        }
    }

    /// A filter that lets everything through.
    pub fn allow_all(kind: TreeKind) -> Self {
        Self {
            kind,
            ignore_patterns: Vec::new(),
            sync_config_wtf: true,
            selected_accounts: None,
            selected_characters: None,
        }
    }

    /// Whether the filter can exclude anything at all.
    pub fn has_constraints(&self) -> bool {
        !self.ignore_patterns.is_empty() || self.kind == TreeKind::Wtf
    }

    /// Evaluate an entry. `rel_path` is relative to the tracked tree root.
    pub fn evaluate(&self, rel_path: &str, is_dir: bool) -> FilterDecision {
        let path = rel_path.replace('\\', "/");

        if self.kind == TreeKind::Wtf {
            if is_dir && path == "SavedVariables" {
                return FilterDecision::SavedVariables;
            }

            if !self.sync_config_wtf && !is_dir {
                let name = path.rsplit('/').next().unwrap_or(&path);
                if name.eq_ignore_ascii_case("config.wtf") {
                    return FilterDecision::ConfigExcluded;
                }
            }

            if let Some(selected) = &self.selected_accounts {
                let mut parts = path.split('/');
                if let (Some("Account"), Some(account)) = (parts.next(), parts.next()) {
                    let is_account_dir = is_dir || parts.next().is_some();
                    if is_account_dir && !selected.iter().any(|a| a == account) {
                        return FilterDecision::AccountNotSelected {
                            account: account.to_string(),
                        };
                    }
                }
            }

            if let Some(decision) = self.check_character(&path, is_dir) {
                return decision;
            }
        }

        for pattern in &self.ignore_patterns {
            if glob_match::glob_match(&pattern.replace('\\', "/"), &path) {
                debug!(path = %path, pattern = pattern.as_str(), "entry matches ignore pattern");
                return FilterDecision::Ignored {
                    pattern: pattern.clone(),
                };
            }
        }

        FilterDecision::Allow
    }

    /// Character directories live at `Account/<account>/<realm>/<character>`.
    /// Only realms with at least one selected character are narrowed.
    fn check_character(&self, path: &str, is_dir: bool) -> Option<FilterDecision> {
        let selection = self.selected_characters.as_ref()?;
        let parts: Vec<&str> = path.split('/').collect();
        let ["Account", account, realm, character, rest @ ..] = parts.as_slice() else {
            return None;
        };
        if *realm == "SavedVariables" || (!is_dir && rest.is_empty()) {
            return None;
        }

        let selected = selection.get(*account)?;
        let mut in_realm = selected
            .iter()
            .filter_map(|entry| entry.split_once('/'))
            .filter(|(r, _)| r == realm)
            .peekable();
        in_realm.peek()?;
        if in_realm.any(|(_, name)| name == *character) {
            return None;
        }
        Some(FilterDecision::CharacterNotSelected {
            account: account.to_string(),
            realm: realm.to_string(),
            character: character.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ProductVariant;

    fn wtf_filter(config: &FilterConfig) -> CopyFilter {
        CopyFilter::for_tree(config, &TrackedPath::new(ProductVariant::Retail, TreeKind::Wtf))
    }

    #[test]
    fn test_allow_all() {
        let filter = CopyFilter::allow_all(TreeKind::AddOns);
        assert_eq!(filter.evaluate("Foo/Foo.toc", false), FilterDecision::Allow);
        assert_eq!(filter.evaluate("Foo/Foo.toc", false).label(), "allow");
    }

    #[test]
    fn test_saved_variables_excluded_at_wtf_root_only() {
        let filter = wtf_filter(&FilterConfig::default());
        assert_eq!(
            filter.evaluate("SavedVariables", true),
            FilterDecision::SavedVariables
        );
        assert!(filter
            .evaluate("Account/ACC1/SavedVariables", true)
            .is_allowed());
    }

    #[test]
    fn test_config_wtf_toggle() {
        let mut config = FilterConfig::default();
        assert!(wtf_filter(&config).evaluate("Config.wtf", false).is_allowed());

        config.sync_config_wtf = false;
        let filter = wtf_filter(&config);
        assert_eq!(
            filter.evaluate("Config.wtf", false),
            FilterDecision::ConfigExcluded
        );
        assert_eq!(
            filter.evaluate("config.wtf", false),
            FilterDecision::ConfigExcluded
        );
        assert!(filter.evaluate("Account/ACC1/macros-cache.txt", false).is_allowed());
    }

    #[test]
    fn test_account_selection() {
        let mut config = FilterConfig::default();
        config
            .selected_accounts
            .insert("retail".into(), vec!["MAIN".into()]);
        let filter = wtf_filter(&config);

        assert!(filter.evaluate("Account/MAIN", true).is_allowed());
        assert!(filter.evaluate("Account/MAIN/bindings-cache.wtf", false).is_allowed());
        assert_eq!(
            filter.evaluate("Account/ALT", true),
            FilterDecision::AccountNotSelected {
                account: "ALT".into()
            }
        );
        // Files directly under Account/ are not accounts.
        assert!(filter.evaluate("Account/readme.txt", false).is_allowed());

        // Other variants are unaffected.
        let classic = CopyFilter::for_tree(
            &config,
            &TrackedPath::new(ProductVariant::Classic, TreeKind::Wtf),
        );
        assert!(classic.evaluate("Account/ALT", true).is_allowed());
    }

    #[test]
    fn test_character_selection() {
        let mut config = FilterConfig::default();
        let mut accounts = BTreeMap::new();
        accounts.insert("MAIN".to_string(), vec!["Silvermoon/Alpha".to_string()]);
        config.selected_characters.insert("retail".into(), accounts);
        let filter = wtf_filter(&config);

        assert!(filter.evaluate("Account/MAIN/Silvermoon/Alpha", true).is_allowed());
        assert!(filter
            .evaluate("Account/MAIN/Silvermoon/Alpha/macros-cache.txt", false)
            .is_allowed());
        assert_eq!(
            filter.evaluate("Account/MAIN/Silvermoon/Beta", true),
            FilterDecision::CharacterNotSelected {
                account: "MAIN".into(),
                realm: "Silvermoon".into(),
                character: "Beta".into(),
            }
        );
        assert_eq!(
            filter
                .evaluate("Account/MAIN/Silvermoon/Beta/layout-local.txt", false)
                .label(),
            "character-not-selected"
        );

        // Realm-level files, account SavedVariables, realms without a
        // selection, and other accounts are not narrowed.
        assert!(filter
            .evaluate("Account/MAIN/Silvermoon/realm-cache.txt", false)
            .is_allowed());
        assert!(filter
            .evaluate("Account/MAIN/SavedVariables/Blizzard.lua", false)
            .is_allowed());
        assert!(filter.evaluate("Account/MAIN/Argent Dawn/Gamma", true).is_allowed());
        assert!(filter.evaluate("Account/ALT/Silvermoon/Beta", true).is_allowed());
    }

    #[test]
    fn test_ignore_patterns() {
        let filter = CopyFilter::for_tree(
            &FilterConfig::default(),
            &TrackedPath::new(ProductVariant::Retail, TreeKind::AddOns),
        );
        assert!(matches!(
            filter.evaluate("Foo/settings.lua.bak", false),
            FilterDecision::Ignored { .. }
        ));
        assert!(matches!(
            filter.evaluate("scratch.tmp", false),
            FilterDecision::Ignored { .. }
        ));
        assert!(filter.evaluate("Foo/settings.lua", false).is_allowed());
    }
}
