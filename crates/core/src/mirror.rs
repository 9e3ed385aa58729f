//! Atomic tree mirroring between the WoW installation and the repository.
//!
//! A tracked tree is never modified in place. The new contents are built in
//! a staging directory next to the destination, then swapped in with two
//! renames. A failure before the swap leaves the destination untouched and
//! the staging directory is discarded when it drops.
//!
//! Symlinks inside a tree are never copied or followed, wherever they point.
//! The repository stores plain files only.

use std::fs;
use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::DatasetError;
use crate::filter::CopyFilter;

/// Prefix of every scratch directory created by the mirror. The repository
/// excludes it locally so an interrupted swap never gets committed.
pub const SCRATCH_PREFIX: &str = ".wowsync-";

/// How entries the filter rejects are treated at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorMode {
    /// Destination becomes exactly the filtered source.
    Exact,
    /// Entries at the destination that the filter rejects are kept. Used when
    /// exporting, so unsynced local files (e.g. `Config.wtf` with config sync
    /// off) survive a pull.
    PreserveExcluded,
}

/// Counters from one mirror operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub files: usize,
    pub bytes: u64,
    pub filtered: usize,
    pub symlinks_skipped: usize,
    pub preserved: usize,
}

impl std::ops::AddAssign for MirrorStats {
    fn add_assign(&mut self, other: Self) {
        self.files += other.files;
        self.bytes += other.bytes;
        self.filtered += other.filtered;
        self.symlinks_skipped += other.symlinks_skipped;
        self.preserved += other.preserved;
    }
}

/// Replace `dest` with the filtered contents of `src`.
///
/// A missing `src` mirrors a deletion: `dest` is removed (apart from any
/// preserved entries).
pub fn mirror_tree(
    src: &Path,
    dest: &Path,
    filter: &CopyFilter,
    mode: MirrorMode,
) -> Result<MirrorStats, DatasetError> {
    let parent = dest
        .parent()
        .ok_or_else(|| DatasetError::io(dest, std::io::Error::other("destination has no parent")))?;
    fs::create_dir_all(parent).map_err(|e| DatasetError::io(parent, e))?;

    let staging = tempfile::Builder::new()
        .prefix(&format!("{}stage-", SCRATCH_PREFIX))
        .tempdir_in(parent)
        .map_err(|e| DatasetError::io(parent, e))?;

    let mut stats = MirrorStats::default();
    let src_exists = src.is_dir();
    if src_exists {
        copy_filtered(src, staging.path(), filter, &mut stats)?;
    }
    if mode == MirrorMode::PreserveExcluded && dest.is_dir() {
        carry_over_excluded(dest, staging.path(), filter, &mut stats)?;
    }

    if !src_exists && stats.preserved == 0 {
        if dest.exists() {
            info!(path = %dest.display(), "source gone, removing mirrored tree");
            discard(dest, parent)?;
        }
        return Ok(stats);
    }

    swap_into_place(&staging, dest, parent)?;
    debug!(
        src = %src.display(),
        dest = %dest.display(),
        files = stats.files,
        bytes = stats.bytes,
        filtered = stats.filtered,
        "mirrored tree"
    );
    Ok(stats)
}

/// Copy `src` into `staging`, applying the filter and skipping symlinks.
fn copy_filtered(
    src: &Path,
    staging: &Path,
    filter: &CopyFilter,
    stats: &mut MirrorStats,
) -> Result<(), DatasetError> {
    let mut walker = WalkDir::new(src).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| DatasetError::io(entry.path(), std::io::Error::other(e)))?;
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            warn!(path = %entry.path().display(), "skipping symlink");
            stats.symlinks_skipped += 1;
            continue;
        }

        let decision = filter.evaluate(&rel_string(rel), file_type.is_dir());
        if !decision.is_allowed() {
            debug!(path = %rel.display(), reason = decision.label(), "filtered");
            stats.filtered += 1;
            if file_type.is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let target = staging.join(rel);
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| DatasetError::io(&target, e))?;
        } else {
            stats.bytes += fs::copy(entry.path(), &target).map_err(|e| DatasetError::io(entry.path(), e))?;
            stats.files += 1;
        }
    }
    Ok(())
}

/// Copy the entries of `dest` that the filter rejects into `staging`,
/// unfiltered.
fn carry_over_excluded(
    dest: &Path,
    staging: &Path,
    filter: &CopyFilter,
    stats: &mut MirrorStats,
) -> Result<(), DatasetError> {
    let mut walker = WalkDir::new(dest).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| walk_error(dest, e))?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dest)
            .map_err(|e| DatasetError::io(entry.path(), std::io::Error::other(e)))?;
        if filter.evaluate(&rel_string(rel), file_type.is_dir()).is_allowed() {
            continue;
        }

        let target = staging.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| DatasetError::io(parent, e))?;
        }
        if file_type.is_dir() {
            copy_all(entry.path(), &target, stats)?;
            walker.skip_current_dir();
        } else {
            stats.bytes += fs::copy(entry.path(), &target).map_err(|e| DatasetError::io(entry.path(), e))?;
        }
        stats.preserved += 1;
    }
    Ok(())
}

/// Unfiltered recursive copy, symlinks skipped.
fn copy_all(src: &Path, dest: &Path, stats: &mut MirrorStats) -> Result<(), DatasetError> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| DatasetError::io(entry.path(), std::io::Error::other(e)))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| DatasetError::io(&target, e))?;
        } else if entry.file_type().is_file() {
            stats.bytes += fs::copy(entry.path(), &target).map_err(|e| DatasetError::io(entry.path(), e))?;
        }
    }
    Ok(())
}

/// Move `dest` aside, rename the staging directory into its place, then drop
/// the old tree. If the second rename fails the old tree is restored.
fn swap_into_place(staging: &TempDir, dest: &Path, parent: &Path) -> Result<(), DatasetError> {
    let trash = scratch_dir(parent, "trash-")?;
    let old = trash.path().join("old");
    let had_dest = dest.exists();

    if had_dest {
        fs::rename(dest, &old).map_err(|e| DatasetError::io(dest, e))?;
    }

    if let Err(e) = fs::rename(staging.path(), dest) {
        if had_dest {
            if let Err(restore_err) = fs::rename(&old, dest) {
                warn!(path = %dest.display(), error = %restore_err,
                    "failed to restore previous tree after aborted swap");
            }
        }
        return Err(DatasetError::io(dest, e));
    }

    // `trash` removes the old tree when it drops.
    Ok(())
}

/// Remove `dest` by moving it into a scratch directory first, so a failure
/// part-way through deletion never leaves a half-deleted tree in place.
fn discard(dest: &Path, parent: &Path) -> Result<(), DatasetError> {
    let trash = scratch_dir(parent, "trash-")?;
    fs::rename(dest, trash.path().join("old")).map_err(|e| DatasetError::io(dest, e))?;
    trash.close().map_err(|e| DatasetError::io(parent, e))
}

fn scratch_dir(parent: &Path, label: &str) -> Result<TempDir, DatasetError> {
    tempfile::Builder::new()
        .prefix(&format!("{}{}", SCRATCH_PREFIX, label))
        .tempdir_in(parent)
        .map_err(|e| DatasetError::io(parent, e))
}

fn rel_string(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}

fn walk_error(root: &Path, err: walkdir::Error) -> DatasetError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let io = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
    DatasetError::io(path, io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::dataset::{ProductVariant, TrackedPath, TreeKind};

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn no_scratch_left(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().all(|e| {
            !e.unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with(SCRATCH_PREFIX)
        })
    }

    #[test]
    fn test_mirror_copies_and_mirrors_deletions() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "Foo/Foo.toc", "## Title: Foo");
        write(src.path(), "Foo/core.lua", "print(1)");
        let dest = dst.path().join("AddOns");
        let filter = CopyFilter::allow_all(TreeKind::AddOns);

        let stats = mirror_tree(src.path(), &dest, &filter, MirrorMode::Exact).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(fs::read_to_string(dest.join("Foo/core.lua")).unwrap(), "print(1)");

        fs::remove_file(src.path().join("Foo/core.lua")).unwrap();
        mirror_tree(src.path(), &dest, &filter, MirrorMode::Exact).unwrap();
        assert!(!dest.join("Foo/core.lua").exists());
        assert!(dest.join("Foo/Foo.toc").exists());
        assert!(no_scratch_left(dst.path()));
    }

    #[test]
    fn test_missing_source_removes_destination() {
        let dst = tempfile::tempdir().unwrap();
        write(dst.path(), "WTF/Config.wtf", "SET x 1");
        let dest = dst.path().join("WTF");

        mirror_tree(
            &dst.path().join("nope"),
            &dest,
            &CopyFilter::allow_all(TreeKind::Wtf),
            MirrorMode::Exact,
        )
        .unwrap();
        assert!(!dest.exists());
        assert!(no_scratch_left(dst.path()));
    }

    #[test]
    fn test_filter_applied() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "SavedVariables/Blizzard.lua", "x");
        write(src.path(), "Account/A/bindings.wtf", "bind");
        write(src.path(), "Account/A/old.bak", "bak");
        let dest = dst.path().join("WTF");
        let filter = CopyFilter::for_tree(
            &FilterConfig::default(),
            &TrackedPath::new(ProductVariant::Retail, TreeKind::Wtf),
        );

        let stats = mirror_tree(src.path(), &dest, &filter, MirrorMode::Exact).unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.filtered, 2);
        assert!(!dest.join("SavedVariables").exists());
        assert!(!dest.join("Account/A/old.bak").exists());
        assert!(dest.join("Account/A/bindings.wtf").exists());
    }

    #[test]
    fn test_preserve_excluded_keeps_local_only_entries() {
        let repo = tempfile::tempdir().unwrap();
        let wow = tempfile::tempdir().unwrap();
        write(repo.path(), "WTF/Account/A/bindings.wtf", "from repo");
        write(wow.path(), "WTF/Account/A/bindings.wtf", "stale");
        write(wow.path(), "WTF/Config.wtf", "SET gxWindow 1");
        write(wow.path(), "WTF/SavedVariables/Blizzard.lua", "sv");

        let mut config = FilterConfig::default();
        config.sync_config_wtf = false;
        let filter = CopyFilter::for_tree(
            &config,
            &TrackedPath::new(ProductVariant::Retail, TreeKind::Wtf),
        );

        let stats = mirror_tree(
            &repo.path().join("WTF"),
            &wow.path().join("WTF"),
            &filter,
            MirrorMode::PreserveExcluded,
        )
        .unwrap();
        assert_eq!(stats.preserved, 2);
        let wtf = wow.path().join("WTF");
        assert_eq!(
            fs::read_to_string(wtf.join("Account/A/bindings.wtf")).unwrap(),
            "from repo"
        );
        assert_eq!(
            fs::read_to_string(wtf.join("Config.wtf")).unwrap(),
            "SET gxWindow 1"
        );
        assert!(wtf.join("SavedVariables/Blizzard.lua").exists());
    }

    #[test]
    fn test_character_selection_on_import_and_export() {
        let mut config = FilterConfig::default();
        let mut accounts = std::collections::BTreeMap::new();
        accounts.insert("ACC".to_string(), vec!["Realm/Alpha".to_string()]);
        config.selected_characters.insert("retail".into(), accounts);
        let filter = CopyFilter::for_tree(
            &config,
            &TrackedPath::new(ProductVariant::Retail, TreeKind::Wtf),
        );

        let wow = tempfile::tempdir().unwrap();
        write(wow.path(), "WTF/Account/ACC/Realm/Alpha/macros-cache.txt", "alpha");
        write(wow.path(), "WTF/Account/ACC/Realm/Beta/macros-cache.txt", "beta local");
        let repo = tempfile::tempdir().unwrap();
        let repo_wtf = repo.path().join("WTF");

        mirror_tree(&wow.path().join("WTF"), &repo_wtf, &filter, MirrorMode::Exact).unwrap();
        assert!(repo_wtf.join("Account/ACC/Realm/Alpha/macros-cache.txt").exists());
        assert!(!repo_wtf.join("Account/ACC/Realm/Beta").exists());

        write(repo.path(), "WTF/Account/ACC/Realm/Alpha/macros-cache.txt", "alpha remote");
        let stats = mirror_tree(
            &repo_wtf,
            &wow.path().join("WTF"),
            &filter,
            MirrorMode::PreserveExcluded,
        )
        .unwrap();
        assert_eq!(stats.preserved, 1);
        let wtf = wow.path().join("WTF/Account/ACC/Realm");
        assert_eq!(
            fs::read_to_string(wtf.join("Alpha/macros-cache.txt")).unwrap(),
            "alpha remote"
        );
        assert_eq!(
            fs::read_to_string(wtf.join("Beta/macros-cache.txt")).unwrap(),
            "beta local"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        write(outside.path(), "secret.txt", "secret");
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "Foo/Foo.toc", "toc");
        std::os::unix::fs::symlink(outside.path(), src.path().join("Foo/escape")).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let dest = dst.path().join("AddOns");
        let stats = mirror_tree(
            src.path(),
            &dest,
            &CopyFilter::allow_all(TreeKind::AddOns),
            MirrorMode::Exact,
        )
        .unwrap();
        assert_eq!(stats.symlinks_skipped, 1);
        assert!(!dest.join("Foo/escape").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_inside_tree_are_skipped_too() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "Foo/Foo.toc", "toc");
        std::os::unix::fs::symlink(src.path().join("Foo"), src.path().join("FooAlias")).unwrap();

        let dst = tempfile::tempdir().unwrap();
        let dest = dst.path().join("AddOns");
        let stats = mirror_tree(
            src.path(),
            &dest,
            &CopyFilter::allow_all(TreeKind::AddOns),
            MirrorMode::Exact,
        )
        .unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.symlinks_skipped, 1);
        assert!(!dest.join("FooAlias").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_copy_leaves_destination_untouched() {
        use std::os::unix::fs::PermissionsExt;

        // Root ignores permission bits; nothing to test there.
        if unsafe { libc::geteuid() } == 0 {
            return;
        }

        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.txt", "new");
        write(src.path(), "b.txt", "unreadable");
        fs::set_permissions(src.path().join("b.txt"), fs::Permissions::from_mode(0o000)).unwrap();

        let dst = tempfile::tempdir().unwrap();
        write(dst.path(), "AddOns/a.txt", "old");
        let dest = dst.path().join("AddOns");

        let result = mirror_tree(
            src.path(),
            &dest,
            &CopyFilter::allow_all(TreeKind::AddOns),
            MirrorMode::Exact,
        );
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "old");
        assert!(no_scratch_left(dst.path()));
    }
}
