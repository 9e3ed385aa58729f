//! Dataset mapping: which parts of a WoW installation are synced.
//!
//! A WoW installation holds one directory per product variant (`_retail_`,
//! `_classic_`, `_classic_era_`). Each variant contributes up to two tracked
//! trees: `Interface/AddOns` and `WTF`. In the managed repository these land
//! under `<variant key>/AddOns` and `<variant key>/WTF`.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::VariantToggles;
use crate::errors::DatasetError;

// ---------------------------------------------------------------------------
// Product variants
// ---------------------------------------------------------------------------

/// A WoW product line installed side by side under the root path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProductVariant {
    Retail,
    Classic,
    ClassicEra,
}

impl ProductVariant {
    /// All variants, ordered by key.
    pub const ALL: [ProductVariant; 3] = [Self::Classic, Self::ClassicEra, Self::Retail];

    /// Stable key used in the repository layout and configuration.
    pub fn key(self) -> &'static str {
        match self {
            Self::Retail => "retail",
            Self::Classic => "classic",
            Self::ClassicEra => "classic-era",
        }
    }

    /// Directory name under the WoW root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Retail => "_retail_",
            Self::Classic => "_classic_",
            Self::ClassicEra => "_classic_era_",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Retail => "Retail",
            Self::Classic => "Classic",
            Self::ClassicEra => "Classic Era",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.key() == key)
    }
}

impl std::fmt::Display for ProductVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

// ---------------------------------------------------------------------------
// Tracked trees
// ---------------------------------------------------------------------------

/// The two sub-trees synced per variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TreeKind {
    /// `Interface/AddOns`: installed addon code.
    AddOns,
    /// `WTF`: account, realm, and character settings.
    Wtf,
}

impl TreeKind {
    /// Ordered by repository name.
    pub const ALL: [TreeKind; 2] = [Self::AddOns, Self::Wtf];

    /// Directory name inside the repository's variant directory.
    pub fn repo_name(self) -> &'static str {
        match self {
            Self::AddOns => "AddOns",
            Self::Wtf => "WTF",
        }
    }

    /// Path relative to the variant directory in the WoW installation.
    pub fn source_rel(self) -> &'static Path {
        match self {
            Self::AddOns => Path::new("Interface/AddOns"),
            Self::Wtf => Path::new("WTF"),
        }
    }

    fn from_repo_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.repo_name() == name)
    }
}

/// One tracked tree: a (variant, kind) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TrackedPath {
    pub variant: ProductVariant,
    pub kind: TreeKind,
}

impl TrackedPath {
    pub fn new(variant: ProductVariant, kind: TreeKind) -> Self {
        Self { variant, kind }
    }

    /// Location inside the repository working tree, e.g. `retail/WTF`.
    pub fn repo_rel(&self) -> PathBuf {
        Path::new(self.variant.key()).join(self.kind.repo_name())
    }

    /// Location under the root path, e.g. `_retail_/Interface/AddOns`.
    pub fn source_rel(&self) -> PathBuf {
        Path::new(self.variant.dir_name()).join(self.kind.source_rel())
    }

    /// Map a repository-relative file path (`retail/WTF/config.wtf`) to the
    /// tracked tree containing it.
    pub fn containing(repo_path: &str) -> Option<Self> {
        let mut parts = repo_path.split('/');
        let variant = ProductVariant::from_key(parts.next()?)?;
        let kind = TreeKind::from_repo_name(parts.next()?)?;
        Some(Self { variant, kind })
    }
}

impl Ord for TrackedPath {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.variant.key(), self.kind.repo_name())
            .cmp(&(other.variant.key(), other.kind.repo_name()))
    }
}

impl PartialOrd for TrackedPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for TrackedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.variant.key(), self.kind.repo_name())
    }
}

/// A directory the mapper refused to track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPath {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of a detailed scan.
#[derive(Debug, Clone, Default)]
pub struct DatasetScan {
    pub tracked: Vec<TrackedPath>,
    pub skipped: Vec<SkippedPath>,
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Accounts and characters found under one variant's `WTF/Account`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantInventory {
    pub variant: ProductVariant,
    pub accounts: Vec<AccountInventory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountInventory {
    pub name: String,
    pub characters: Vec<CharacterRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct CharacterRef {
    pub realm: String,
    pub name: String,
}

impl CharacterRef {
    /// `Realm/Character`, the form used by `filters.selected_characters`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.realm, self.name)
    }
}

/// Where an exported tree would land under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    /// Safe to write.
    Inside,
    /// The variant directory is missing (or not a directory).
    NotInstalled,
    /// The destination or one of its ancestors resolves outside the root.
    Escapes(PathBuf),
    /// The destination is a symlink that stays inside the root, or one that
    /// cannot be resolved.
    Symlink,
}

// ---------------------------------------------------------------------------
// Mapper
// ---------------------------------------------------------------------------

/// Scans a WoW root for tracked trees.
#[derive(Debug, Clone)]
pub struct DatasetMapper {
    root: PathBuf,
    variants: VariantToggles,
}

impl DatasetMapper {
    pub fn new(root: impl Into<PathBuf>, variants: VariantToggles) -> Self {
        Self {
            root: root.into(),
            variants,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ordered tracked trees present under the root.
    ///
    /// An installation with no known variants yields an empty list.
    pub fn scan(&self) -> Result<Vec<TrackedPath>, DatasetError> {
        Ok(self.scan_detailed()?.tracked)
    }

    /// Like [`scan`](Self::scan), also reporting directories that were
    /// skipped because they escape the root.
    pub fn scan_detailed(&self) -> Result<DatasetScan, DatasetError> {
        let canonical_root = self.canonical_root()?;
        let mut scan = DatasetScan::default();

        for variant in ProductVariant::ALL {
            if !self.variants.is_enabled(variant) {
                debug!(variant = %variant, "variant disabled, skipping");
                continue;
            }
            let variant_dir = self.root.join(variant.dir_name());
            match resolve_inside(&canonical_root, &variant_dir) {
                Containment::Absent => {
                    debug!(variant = %variant, "variant not installed");
                    continue;
                }
                Containment::Escapes(target) => {
                    warn!(path = %variant_dir.display(), target = %target.display(),
                        "variant directory escapes root, skipping");
                    scan.skipped.push(SkippedPath {
                        path: variant_dir,
                        reason: format!("symlink to {} outside root", target.display()),
                    });
                    continue;
                }
                Containment::Inside => {}
            }

            for kind in TreeKind::ALL {
                let tracked = TrackedPath::new(variant, kind);
                let tree = self.root.join(tracked.source_rel());
                match resolve_inside(&canonical_root, &tree) {
                    Containment::Inside => scan.tracked.push(tracked),
                    Containment::Absent => {}
                    Containment::Escapes(target) => {
                        warn!(path = %tree.display(), target = %target.display(),
                            "tracked tree escapes root, skipping");
                        scan.skipped.push(SkippedPath {
                            path: tree,
                            reason: format!("symlink to {} outside root", target.display()),
                        });
                    }
                }
            }
        }

        scan.tracked.sort();
        info!(tracked = scan.tracked.len(), skipped = scan.skipped.len(), "dataset scan complete");
        Ok(scan)
    }

    /// List accounts and characters per installed variant.
    pub fn scan_inventory(&self) -> Result<Vec<VariantInventory>, DatasetError> {
        let canonical_root = self.canonical_root()?;
        let mut inventory = Vec::new();

        for variant in ProductVariant::ALL {
            let variant_dir = self.root.join(variant.dir_name());
            if !matches!(resolve_inside(&canonical_root, &variant_dir), Containment::Inside) {
                continue;
            }

            let account_root = variant_dir.join("WTF").join("Account");
            let mut accounts = Vec::new();
            for account in list_visible_dirs(&account_root)? {
                let account_dir = account_root.join(&account);
                let mut characters = Vec::new();
                for realm in list_visible_dirs(&account_dir)? {
                    if realm == "SavedVariables" {
                        continue;
                    }
                    for name in list_visible_dirs(&account_dir.join(&realm))? {
                        characters.push(CharacterRef {
                            realm: realm.clone(),
                            name,
                        });
                    }
                }
                characters.sort();
                accounts.push(AccountInventory {
                    name: account,
                    characters,
                });
            }
            inventory.push(VariantInventory { variant, accounts });
        }

        Ok(inventory)
    }

    /// Check that writing `tracked` back under the root cannot leave it.
    ///
    /// The deepest existing ancestor of the destination must resolve under
    /// the canonical root, so a symlinked variant directory or `Interface`
    /// directory pointing elsewhere is refused along with a symlinked tree.
    pub fn export_target(&self, tracked: &TrackedPath) -> Result<ExportTarget, DatasetError> {
        let canonical_root = self.canonical_root()?;
        let variant_dir = self.root.join(tracked.variant.dir_name());
        match resolve_inside(&canonical_root, &variant_dir) {
            Containment::Inside => {}
            Containment::Absent => return Ok(ExportTarget::NotInstalled),
            Containment::Escapes(target) => return Ok(ExportTarget::Escapes(target)),
        }

        let dest = self.root.join(tracked.source_rel());
        let mut existing = dest.as_path();
        while existing.symlink_metadata().is_err() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => return Ok(ExportTarget::NotInstalled),
            }
        }
        let resolved = match existing.canonicalize() {
            Ok(resolved) => resolved,
            Err(_) => return Ok(ExportTarget::Symlink),
        };
        if !resolved.starts_with(&canonical_root) {
            return Ok(ExportTarget::Escapes(resolved));
        }
        if dest
            .symlink_metadata()
            .is_ok_and(|m| m.file_type().is_symlink())
        {
            return Ok(ExportTarget::Symlink);
        }
        Ok(ExportTarget::Inside)
    }

    fn canonical_root(&self) -> Result<PathBuf, DatasetError> {
        if !self.root.is_dir() {
            return Err(DatasetError::RootNotFound(self.root.display().to_string()));
        }
        self.root
            .canonicalize()
            .map_err(|_| DatasetError::RootNotFound(self.root.display().to_string()))
    }
}

enum Containment {
    Inside,
    Absent,
    Escapes(PathBuf),
}

/// Resolve symlinks in `path` and check the result is a directory under
/// `canonical_root`.
fn resolve_inside(canonical_root: &Path, path: &Path) -> Containment {
    match path.canonicalize() {
        Ok(resolved) if !resolved.starts_with(canonical_root) => Containment::Escapes(resolved),
        Ok(resolved) if resolved.is_dir() => Containment::Inside,
        _ => Containment::Absent,
    }
}

/// Sorted names of non-hidden, non-symlink subdirectories. A missing
/// directory yields an empty list.
fn list_visible_dirs(dir: &Path) -> Result<Vec<String>, DatasetError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DatasetError::io(dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DatasetError::io(dir, e))?;
        let file_type = entry.file_type().map_err(|e| DatasetError::io(entry.path(), e))?;
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}
