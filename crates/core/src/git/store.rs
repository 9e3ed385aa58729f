//! The local version store: one git working tree mirroring the tracked set.

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    AnnotatedCommit, Commit, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions,
    IndexAddOption, Oid, PushOptions, RemoteCallbacks, Repository, RepositoryInitOptions,
    ResetType, Signature, Status, StatusOptions, Tree,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::auth::{CredentialProvider, CredentialResponse, Credentials};
use crate::config::{FilterConfig, IdentityConfig, SyncConfig};
use crate::dataset::{ProductVariant, TrackedPath, TreeKind};
use crate::errors::{DatasetError, GitError};
use crate::filter::CopyFilter;
use crate::mirror::{mirror_tree, MirrorMode, MirrorStats, SCRATCH_PREFIX};
use crate::models::ConflictStrategy;

pub const REMOTE_NAME: &str = "origin";
pub const INITIAL_COMMIT_MESSAGE: &str = "Initial commit";
pub const SYNC_COMMIT_MESSAGE: &str = "Update WoW addons and settings";
pub const MERGE_COMMIT_MESSAGE: &str = "Merge from remote";
/// Lives in the git directory, never in the working tree.
const SYNCED_MARKER: &str = "wowsync-synced";
const GITIGNORE: &str = "# WoW Sync\n*.bak\n*.tmp\n";

/// Where the store lives and how it talks to the remote.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub repo_path: PathBuf,
    pub branch: String,
    pub remote_url: Option<String>,
    pub identity: IdentityConfig,
}

impl StoreOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            repo_path: config.repo_path(),
            branch: config.sync.branch.clone(),
            remote_url: config.sync.remote_url.clone(),
            identity: config.identity.clone(),
        }
    }
}

/// Result of a merge that produced a commit or moved the branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// New HEAD, when the merge moved it.
    pub commit: Option<String>,
    /// Paths changed relative to the pre-merge HEAD.
    pub changed_paths: Vec<String>,
    /// Paths that conflicted and were resolved by policy.
    pub conflicted_paths: Vec<String>,
}

/// Summary of the current HEAD commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadInfo {
    pub sha: String,
    pub short_sha: String,
    pub summary: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    Conflicted,
    Other,
}

/// One entry of `git status` for the working tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkingChange {
    pub path: String,
    pub change: ChangeKind,
}

/// Wrapper around the single local repository.
pub struct VersionStore {
    repo: Repository,
    options: StoreOptions,
    credentials: Arc<dyn CredentialProvider>,
}

/// Per-transfer bookkeeping shared with the libgit2 callbacks.
#[derive(Default)]
struct TransferState {
    attempts: Cell<u32>,
    auth_failure: RefCell<Option<GitError>>,
    rejection: RefCell<Option<String>>,
}

impl VersionStore {
    /// Open the repository, creating it when absent. Safe to call on every
    /// session start.
    #[instrument(skip(options, credentials), fields(path = %options.repo_path.display()))]
    pub fn initialize(
        options: StoreOptions,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, GitError> {
        let path = options.repo_path.clone();
        let existing = if path.exists() {
            match Repository::open(&path) {
                Ok(repo) => Some(repo),
                Err(e) => {
                    warn!(error = %e, "repository location is not a git repository, recreating");
                    fs::remove_dir_all(&path)?;
                    None
                }
            }
        } else {
            None
        };

        let repo = match existing {
            Some(repo) => {
                debug!("reopened existing repository");
                repo
            }
            None => Self::create(&options, credentials.as_ref())?,
        };

        let store = Self {
            repo,
            options,
            credentials,
        };
        store.normalize_config()?;
        store.sync_origin()?;
        store.ensure_branch()?;
        Ok(store)
    }

    /// Open an existing repository without creating or modifying anything.
    pub fn open(
        options: StoreOptions,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, GitError> {
        let path = &options.repo_path;
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            options,
            credentials,
        })
    }

    fn create(
        options: &StoreOptions,
        credentials: &dyn CredentialProvider,
    ) -> Result<Repository, GitError> {
        if let Some(parent) = options.repo_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Some(url) = &options.remote_url {
            info!(url = %url, "cloning remote repository");
            let state = TransferState::default();
            let mut fetch_opts = FetchOptions::new();
            fetch_opts.remote_callbacks(transfer_callbacks(credentials, url, &state));
            let mut builder = RepoBuilder::new();
            builder.fetch_options(fetch_opts);
            match builder.clone(url, &options.repo_path) {
                Ok(repo) => {
                    info!("clone completed");
                    return Ok(repo);
                }
                Err(e) => match classify(e, &state, url, &options.branch) {
                    err @ (GitError::AuthRequired { .. }
                    | GitError::AuthDenied { .. }
                    | GitError::NetworkUnavailable(_)) => return Err(err),
                    err => {
                        warn!(error = %err, "clone failed, creating a new local repository");
                        if options.repo_path.exists() {
                            fs::remove_dir_all(&options.repo_path)?;
                        }
                    }
                },
            }
        }

        info!("creating new local repository");
        let mut init_opts = RepositoryInitOptions::new();
        init_opts.initial_head(&options.branch);
        let repo = Repository::init_opts(&options.repo_path, &init_opts)?;
        Ok(repo)
    }

    /// Default identity and file-mode handling, plus the local exclude for
    /// mirror scratch directories.
    fn normalize_config(&self) -> Result<(), GitError> {
        let mut config = self.repo.config()?;
        if config.get_string("user.name").is_err() {
            config.set_str("user.name", &self.options.identity.name)?;
        }
        if config.get_string("user.email").is_err() {
            config.set_str("user.email", &self.options.identity.email)?;
        }
        config.set_bool("core.filemode", false)?;

        let exclude = self.repo.path().join("info").join("exclude");
        let pattern = format!("{}*", SCRATCH_PREFIX);
        let current = fs::read_to_string(&exclude).unwrap_or_default();
        if !current.lines().any(|l| l.trim() == pattern) {
            if let Some(parent) = exclude.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut updated = current;
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(&pattern);
            updated.push('\n');
            fs::write(&exclude, updated)?;
        }
        Ok(())
    }

    /// Make `origin` match the configured remote.
    fn sync_origin(&self) -> Result<(), GitError> {
        let current = match self.repo.find_remote(REMOTE_NAME) {
            Ok(remote) => Some(remote.url().unwrap_or_default().to_string()),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        match (&self.options.remote_url, current) {
            (Some(url), None) => {
                info!(url = %url, "adding remote");
                self.repo.remote(REMOTE_NAME, url)?;
            }
            (Some(url), Some(existing)) if *url != existing => {
                info!(from = %existing, to = %url, "remote URL changed");
                self.repo.remote_set_url(REMOTE_NAME, url)?;
            }
            (None, Some(existing)) => {
                info!(url = %existing, "remote no longer configured, removing");
                self.repo.remote_delete(REMOTE_NAME)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Point HEAD at the configured branch, creating it from the remote
    /// branch, the current HEAD, or a fresh initial commit.
    fn ensure_branch(&self) -> Result<(), GitError> {
        let local = format!("refs/heads/{}", self.options.branch);
        let head_target = self
            .repo
            .find_reference("HEAD")?
            .symbolic_target()
            .map(str::to_string);

        if self.repo.find_reference(&local).is_ok() {
            if head_target.as_deref() != Some(local.as_str()) {
                info!(branch = %self.options.branch, "switching to configured branch");
                self.repo.set_head(&local)?;
                self.repo
                    .checkout_head(Some(CheckoutBuilder::new().force()))?;
            }
            return Ok(());
        }

        if let Some(remote_oid) = self.remote_tip()? {
            info!(branch = %self.options.branch, "creating local branch from remote");
            self.repo
                .reference(&local, remote_oid, false, "wowsync: track remote branch")?;
            self.repo.set_head(&local)?;
            self.repo
                .checkout_head(Some(CheckoutBuilder::new().force()))?;
            return Ok(());
        }

        if let Some(head) = self.head_commit()? {
            self.repo
                .reference(&local, head.id(), false, "wowsync: create branch")?;
            self.repo.set_head(&local)?;
            return Ok(());
        }

        self.repo.set_head(&local)?;
        self.initial_commit()
    }

    fn initial_commit(&self) -> Result<(), GitError> {
        fs::write(self.workdir()?.join(".gitignore"), GITIGNORE)?;
        let mut index = self.repo.index()?;
        index.add_path(Path::new(".gitignore"))?;
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;
        let sig = self.signature()?;
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, INITIAL_COMMIT_MESSAGE, &tree, &[])?;
        info!(sha = %oid, "created initial commit");
        Ok(())
    }

    /// Whether a sync session has completed with this repository. Until then
    /// the installation has no history in it worth protecting.
    pub fn has_synced(&self) -> bool {
        self.repo.path().join(SYNCED_MARKER).exists()
    }

    pub fn mark_synced(&self) -> Result<(), GitError> {
        let marker = self.repo.path().join(SYNCED_MARKER);
        if !marker.exists() {
            fs::write(&marker, Utc::now().to_rfc3339())?;
            debug!("marked repository as synced");
        }
        Ok(())
    }

    pub fn repo_path(&self) -> &Path {
        &self.options.repo_path
    }

    pub fn branch(&self) -> &str {
        &self.options.branch
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.options.remote_url.as_deref()
    }

    fn workdir(&self) -> Result<&Path, GitError> {
        self.repo
            .workdir()
            .ok_or_else(|| GitError::RepositoryNotFound(self.options.repo_path.display().to_string()))
    }

    fn signature(&self) -> Result<Signature<'static>, GitError> {
        let sig = self.repo.signature().or_else(|_| {
            Signature::now(&self.options.identity.name, &self.options.identity.email)
        })?;
        Ok(sig)
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>, GitError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remote_tip(&self) -> Result<Option<Oid>, GitError> {
        let name = format!("refs/remotes/{}/{}", REMOTE_NAME, self.options.branch);
        match self.repo.refname_to_id(&name) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn require_remote(&self) -> Result<&str, GitError> {
        self.options
            .remote_url
            .as_deref()
            .ok_or(GitError::RemoteNotConfigured)
    }

    // -----------------------------------------------------------------------
    // Working tree <-> root path
    // -----------------------------------------------------------------------

    /// Mirror each tracked tree from the WoW installation into the working
    /// tree. Each tree is swapped in atomically.
    #[instrument(skip(self, root, paths, filters), fields(trees = paths.len()))]
    pub fn import_tree(
        &self,
        root: &Path,
        paths: &[TrackedPath],
        filters: &FilterConfig,
    ) -> Result<MirrorStats, DatasetError> {
        let workdir = self
            .workdir()
            .map_err(|e| DatasetError::io(self.repo_path(), std::io::Error::other(e.to_string())))?;
        let mut total = MirrorStats::default();
        for tracked in paths {
            let filter = CopyFilter::for_tree(filters, tracked);
            let stats = mirror_tree(
                &root.join(tracked.source_rel()),
                &workdir.join(tracked.repo_rel()),
                &filter,
                MirrorMode::Exact,
            )?;
            debug!(tree = %tracked, files = stats.files, "imported");
            total += stats;
        }
        info!(files = total.files, bytes = total.bytes, "import complete");
        Ok(total)
    }

    /// Mirror tracked trees from the working tree back into the installation.
    /// Entries the filter excludes are kept at the destination.
    #[instrument(skip(self, root, paths, filters), fields(trees = paths.len()))]
    pub fn export_tree(
        &self,
        root: &Path,
        paths: &[TrackedPath],
        filters: &FilterConfig,
    ) -> Result<MirrorStats, DatasetError> {
        let workdir = self
            .workdir()
            .map_err(|e| DatasetError::io(self.repo_path(), std::io::Error::other(e.to_string())))?;
        let mut total = MirrorStats::default();
        for tracked in paths {
            let filter = CopyFilter::for_tree(filters, tracked);
            let stats = mirror_tree(
                &workdir.join(tracked.repo_rel()),
                &root.join(tracked.source_rel()),
                &filter,
                MirrorMode::PreserveExcluded,
            )?;
            debug!(tree = %tracked, files = stats.files, preserved = stats.preserved, "exported");
            total += stats;
        }
        info!(files = total.files, bytes = total.bytes, "export complete");
        Ok(total)
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Stage additions, modifications, and deletions, then commit.
    #[instrument(skip(self))]
    pub fn commit(&self, message: &str) -> Result<Oid, GitError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_oid = index.write_tree()?;

        let parent = self.head_commit()?;
        if parent.as_ref().map(|p| p.tree_id()) == Some(tree_oid) {
            debug!("staged tree matches HEAD");
            return Err(GitError::NoChanges);
        }

        let tree = self.repo.find_tree(tree_oid)?;
        let sig = self.signature()?;
        let parents: Vec<&Commit> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(oid)
    }

    /// Paths that differ between HEAD and the commit before it.
    pub fn last_commit_paths(&self) -> Result<Vec<String>, GitError> {
        let Some(head) = self.head_commit()? else {
            return Ok(Vec::new());
        };
        let parent_tree = match head.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };
        self.diff_paths(parent_tree.as_ref(), Some(&head.tree()?))
    }

    /// Tracked trees that exist in HEAD.
    pub fn trees_in_head(&self) -> Result<Vec<TrackedPath>, GitError> {
        let Some(head) = self.head_commit()? else {
            return Ok(Vec::new());
        };
        let tree = head.tree()?;
        let mut trees = Vec::new();
        for variant in ProductVariant::ALL {
            for kind in TreeKind::ALL {
                let tracked = TrackedPath::new(variant, kind);
                if tree.get_path(&tracked.repo_rel()).is_ok() {
                    trees.push(tracked);
                }
            }
        }
        Ok(trees)
    }

    fn diff_paths(&self, old: Option<&Tree>, new: Option<&Tree>) -> Result<Vec<String>, GitError> {
        let diff = self.repo.diff_tree_to_tree(old, new, None)?;
        let mut paths: Vec<String> = diff
            .deltas()
            .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()).map(path_string))
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    // -----------------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------------

    /// Push the local branch. Never forces.
    #[instrument(skip(self), fields(branch = %self.options.branch))]
    pub fn push(&self) -> Result<(), GitError> {
        let url = self.require_remote()?;
        let branch = &self.options.branch;
        info!(remote = REMOTE_NAME, "pushing");

        let state = TransferState::default();
        let mut remote = self.repo.find_remote(REMOTE_NAME)?;
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(transfer_callbacks(self.credentials.as_ref(), url, &state));
        let refspec = format!("refs/heads/{}:refs/heads/{}", branch, branch);
        remote
            .push(&[&refspec], Some(&mut push_opts))
            .map_err(|e| classify(e, &state, url, branch))?;

        if let Some(detail) = state.rejection.borrow_mut().take() {
            return Err(GitError::PushRejected {
                branch: branch.clone(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }

    /// Fetch the configured branch into its remote-tracking ref.
    #[instrument(skip(self), fields(branch = %self.options.branch))]
    pub fn fetch(&self) -> Result<(), GitError> {
        let url = self.require_remote()?;
        let branch = &self.options.branch;
        info!(remote = REMOTE_NAME, "fetching");

        let state = TransferState::default();
        let mut remote = self.repo.find_remote(REMOTE_NAME)?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(transfer_callbacks(self.credentials.as_ref(), url, &state));
        let refspec = format!(
            "+refs/heads/{}:refs/remotes/{}/{}",
            branch, REMOTE_NAME, branch
        );
        remote
            .fetch(&[&refspec], Some(&mut fetch_opts), None)
            .map_err(|e| classify(e, &state, url, branch))?;
        debug!("fetch completed");
        Ok(())
    }

    /// Fetch and merge the remote branch. On conflict the merge is left in
    /// progress and `MergeConflict` lists the conflicting paths.
    #[instrument(skip(self), fields(branch = %self.options.branch))]
    pub fn pull(&self) -> Result<MergeOutcome, GitError> {
        self.fetch()?;
        let Some(remote_oid) = self.remote_tip()? else {
            info!("remote branch does not exist yet, nothing to merge");
            return Ok(MergeOutcome::default());
        };
        let theirs = self.repo.find_annotated_commit(remote_oid)?;
        self.merge(&theirs)
    }

    fn merge(&self, theirs: &AnnotatedCommit) -> Result<MergeOutcome, GitError> {
        let (analysis, _) = self.repo.merge_analysis(&[theirs])?;
        if analysis.is_up_to_date() {
            debug!("already up to date");
            return Ok(MergeOutcome::default());
        }

        let head = self.head_commit()?;
        if analysis.is_unborn() || analysis.is_fast_forward() {
            let target = self.repo.find_commit(theirs.id())?;
            let old_tree = head.as_ref().map(|c| c.tree()).transpose()?;
            let changed = self.diff_paths(old_tree.as_ref(), Some(&target.tree()?))?;

            let local = format!("refs/heads/{}", self.options.branch);
            self.repo
                .checkout_tree(target.as_object(), Some(CheckoutBuilder::new().force()))?;
            self.repo
                .reference(&local, target.id(), true, "wowsync: fast-forward")?;
            self.repo.set_head(&local)?;
            info!(sha = %target.id(), changed = changed.len(), "fast-forwarded");
            return Ok(MergeOutcome {
                commit: Some(target.id().to_string()),
                changed_paths: changed,
                conflicted_paths: Vec::new(),
            });
        }

        let ours = head.ok_or_else(|| GitError::RefNotFound("HEAD".into()))?;
        self.repo.merge(&[theirs], None, None)?;

        let index = self.repo.index()?;
        if index.has_conflicts() {
            let paths = conflict_paths(&index)?;
            warn!(count = paths.len(), "merge produced conflicts");
            return Err(GitError::MergeConflict { paths });
        }

        let (oid, changed) = self.finish_merge(&ours, theirs.id())?;
        Ok(MergeOutcome {
            commit: Some(oid.to_string()),
            changed_paths: changed,
            conflicted_paths: Vec::new(),
        })
    }

    fn finish_merge(&self, ours: &Commit, theirs: Oid) -> Result<(Oid, Vec<String>), GitError> {
        let mut index = self.repo.index()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;
        let theirs = self.repo.find_commit(theirs)?;
        let sig = self.signature()?;
        let oid = self.repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            MERGE_COMMIT_MESSAGE,
            &tree,
            &[ours, &theirs],
        )?;
        self.repo.cleanup_state()?;
        let changed = self.diff_paths(Some(&ours.tree()?), Some(&tree))?;
        info!(sha = %oid, changed = changed.len(), "merge committed");
        Ok((oid, changed))
    }

    /// Whether a merge is in progress.
    pub fn merge_in_progress(&self) -> bool {
        self.repo.state() == git2::RepositoryState::Merge
    }

    /// Complete an in-progress conflicted merge by taking one side of every
    /// conflicting path. `FailFast` aborts the merge instead.
    #[instrument(skip(self))]
    pub fn resolve_conflicts(&self, strategy: ConflictStrategy) -> Result<MergeOutcome, GitError> {
        let mut index = self.repo.index()?;
        let conflicts = index.conflicts()?.collect::<Result<Vec<_>, _>>()?;
        let mut conflicted = Vec::with_capacity(conflicts.len());

        if strategy == ConflictStrategy::FailFast {
            let paths = conflict_paths(&index)?;
            self.abort_merge()?;
            return Err(GitError::MergeConflict { paths });
        }

        let workdir = self.workdir()?.to_path_buf();
        for conflict in conflicts {
            let Some(rel) = conflict
                .their
                .as_ref()
                .or(conflict.our.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|e| String::from_utf8_lossy(&e.path).into_owned())
            else {
                continue;
            };
            let chosen = match strategy {
                ConflictStrategy::LocalWins => conflict.our,
                _ => conflict.their,
            };
            let file = workdir.join(&rel);

            match chosen {
                Some(entry) => {
                    let blob = self.repo.find_blob(entry.id)?;
                    if let Some(parent) = file.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&file, blob.content())?;
                    index.add_path(Path::new(&rel))?;
                }
                None => {
                    if file.exists() {
                        fs::remove_file(&file)?;
                    }
                    index.remove_path(Path::new(&rel))?;
                }
            }
            debug!(path = %rel, %strategy, "conflict resolved");
            conflicted.push(rel);
        }
        index.write()?;

        let theirs = self
            .repo
            .refname_to_id("MERGE_HEAD")
            .map_err(|_| GitError::RefNotFound("MERGE_HEAD".into()))?;
        let ours = self
            .head_commit()?
            .ok_or_else(|| GitError::RefNotFound("HEAD".into()))?;

        let (oid, changed) = self.finish_merge(&ours, theirs)?;
        conflicted.sort();
        conflicted.dedup();
        Ok(MergeOutcome {
            commit: Some(oid.to_string()),
            changed_paths: changed,
            conflicted_paths: conflicted,
        })
    }

    /// Throw away an in-progress merge.
    #[instrument(skip(self))]
    pub fn abort_merge(&self) -> Result<(), GitError> {
        if let Some(head) = self.head_commit()? {
            self.repo.reset(head.as_object(), ResetType::Hard, None)?;
        }
        self.repo.cleanup_state()?;
        info!("merge aborted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn head(&self) -> Result<Option<HeadInfo>, GitError> {
        let Some(commit) = self.head_commit()? else {
            return Ok(None);
        };
        let sha = commit.id().to_string();
        let time = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(Some(HeadInfo {
            short_sha: sha.chars().take(7).collect(),
            sha,
            summary: commit.summary().unwrap_or_default().to_string(),
            time,
        }))
    }

    /// Commits ahead of and behind the remote-tracking branch, as of the
    /// last fetch. `None` when the remote branch is unknown.
    pub fn ahead_behind(&self) -> Result<Option<(usize, usize)>, GitError> {
        let (Some(local), Some(remote)) = (self.head_commit()?, self.remote_tip()?) else {
            return Ok(None);
        };
        Ok(Some(self.repo.graph_ahead_behind(local.id(), remote)?))
    }

    /// Whether local history has commits the remote does not.
    pub fn is_ahead_of_remote(&self) -> Result<bool, GitError> {
        if self.options.remote_url.is_none() {
            return Ok(false);
        }
        match self.ahead_behind()? {
            Some((ahead, _)) => Ok(ahead > 0),
            None => Ok(self.head_commit()?.is_some()),
        }
    }

    /// Uncommitted changes in the working tree.
    pub fn status(&self) -> Result<Vec<WorkingChange>, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        let changes = statuses
            .iter()
            .filter_map(|entry| {
                let path = entry.path()?.to_string();
                Some(WorkingChange {
                    path,
                    change: change_kind(entry.status()),
                })
            })
            .collect();
        Ok(changes)
    }
}

fn change_kind(status: Status) -> ChangeKind {
    if status.is_conflicted() {
        ChangeKind::Conflicted
    } else if status.intersects(Status::WT_NEW | Status::INDEX_NEW) {
        ChangeKind::Added
    } else if status.intersects(Status::WT_DELETED | Status::INDEX_DELETED) {
        ChangeKind::Deleted
    } else if status.intersects(Status::WT_RENAMED | Status::INDEX_RENAMED) {
        ChangeKind::Renamed
    } else if status.intersects(
        Status::WT_MODIFIED | Status::INDEX_MODIFIED | Status::WT_TYPECHANGE | Status::INDEX_TYPECHANGE,
    ) {
        ChangeKind::Modified
    } else {
        ChangeKind::Other
    }
}

fn conflict_paths(index: &git2::Index) -> Result<Vec<String>, GitError> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        if let Some(entry) = conflict.their.or(conflict.our).or(conflict.ancestor) {
            paths.push(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Callbacks for clone, fetch, and push. Credentials are requested from the
/// provider at most once per transfer so a rejected secret is not retried
/// forever by libgit2.
fn transfer_callbacks<'a>(
    provider: &'a dyn CredentialProvider,
    url: &'a str,
    state: &'a TransferState,
) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        if allowed.contains(CredentialType::USERNAME) {
            return Cred::username(username_from_url.unwrap_or("git"));
        }

        let attempt = state.attempts.get() + 1;
        state.attempts.set(attempt);
        if attempt > 1 {
            *state.auth_failure.borrow_mut() = Some(GitError::AuthDenied {
                url: url.to_string(),
                detail: "credentials rejected by remote".into(),
            });
            return Err(git2::Error::from_str("credentials rejected"));
        }

        match provider.provide_credentials(url, username_from_url, allowed.into()) {
            CredentialResponse::Provided(Credentials::UserPass { username, password }) => {
                Cred::userpass_plaintext(&username, &password)
            }
            CredentialResponse::Provided(Credentials::SshKey {
                username,
                public_key,
                private_key,
                passphrase,
            }) => Cred::ssh_key(
                &username,
                public_key.as_deref(),
                &private_key,
                passphrase.as_deref(),
            ),
            CredentialResponse::Denied => {
                *state.auth_failure.borrow_mut() = Some(GitError::AuthDenied {
                    url: url.to_string(),
                    detail: "credential request denied".into(),
                });
                Err(git2::Error::from_str("credential request denied"))
            }
            CredentialResponse::Unavailable => {
                *state.auth_failure.borrow_mut() = Some(GitError::AuthRequired {
                    url: url.to_string(),
                });
                Err(git2::Error::from_str("no credentials available"))
            }
        }
    });
    callbacks.push_update_reference(move |refname, status| {
        if let Some(msg) = status {
            warn!(refname, msg, "push rejected");
            *state.rejection.borrow_mut() = Some(msg.to_string());
        }
        Ok(())
    });
    callbacks
}

/// Map a transfer failure onto the error taxonomy.
fn classify(err: git2::Error, state: &TransferState, url: &str, branch: &str) -> GitError {
    if let Some(auth) = state.auth_failure.borrow_mut().take() {
        return auth;
    }
    if err.code() == ErrorCode::Auth {
        return GitError::AuthDenied {
            url: url.to_string(),
            detail: err.message().to_string(),
        };
    }
    if err.code() == ErrorCode::NotFastForward {
        return GitError::PushRejected {
            branch: branch.to_string(),
            detail: err.message().to_string(),
        };
    }
    match err.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl => {
            GitError::NetworkUnavailable(err.message().to_string())
        }
        _ => GitError::Git2Error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::auth::NoCredentials;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        remote: PathBuf,
        base: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let remote = dir.path().join("remote.git");
            let bare = Repository::init_bare(&remote).unwrap();
            bare.set_head("refs/heads/main").unwrap();
            let base = dir.path().to_path_buf();
            Self {
                _dir: dir,
                remote,
                base,
            }
        }

        fn options(&self, name: &str, with_remote: bool) -> StoreOptions {
            StoreOptions {
                repo_path: self.base.join(name).join("repo"),
                branch: "main".into(),
                remote_url: with_remote.then(|| self.remote.display().to_string()),
                identity: IdentityConfig::default(),
            }
        }

        fn store(&self, name: &str) -> VersionStore {
            VersionStore::initialize(self.options(name, true), Arc::new(NoCredentials)).unwrap()
        }

        fn root(&self, name: &str) -> PathBuf {
            self.base.join(name).join("wow")
        }
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn retail_wtf() -> Vec<TrackedPath> {
        vec![TrackedPath::new(ProductVariant::Retail, TreeKind::Wtf)]
    }

    fn commit_count(store: &VersionStore) -> usize {
        let mut walk = store.repo.revwalk().unwrap();
        walk.push_head().unwrap();
        walk.count()
    }

    #[test]
    fn test_initialize_creates_initial_commit() {
        let fx = Fixture::new();
        let store =
            VersionStore::initialize(fx.options("a", false), Arc::new(NoCredentials)).unwrap();

        let head = store.head().unwrap().unwrap();
        assert_eq!(head.summary, INITIAL_COMMIT_MESSAGE);
        assert_eq!(head.short_sha.len(), 7);
        let gitignore = fs::read_to_string(store.repo_path().join(".gitignore")).unwrap();
        assert!(gitignore.contains("*.bak"));

        let exclude = fs::read_to_string(store.repo.path().join("info/exclude")).unwrap();
        assert!(exclude.contains(".wowsync-*"));
        let config = store.repo.config().unwrap();
        assert!(!config.get_bool("core.filemode").unwrap());
        assert!(store.repo.find_remote(REMOTE_NAME).is_err());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let fx = Fixture::new();
        let first = fx.store("a");
        let sha = first.head().unwrap().unwrap().sha;
        assert!(!first.has_synced());
        first.mark_synced().unwrap();
        drop(first);

        let second = fx.store("a");
        assert!(second.has_synced());
        assert_eq!(second.head().unwrap().unwrap().sha, sha);
        assert_eq!(commit_count(&second), 1);
    }

    #[test]
    fn test_initialize_replaces_non_repository_directory() {
        let fx = Fixture::new();
        let opts = fx.options("a", false);
        write(&opts.repo_path.join("junk.txt"), "junk");

        let store = VersionStore::initialize(opts, Arc::new(NoCredentials)).unwrap();
        assert!(!store.repo_path().join("junk.txt").exists());
        assert!(store.head().unwrap().is_some());
    }

    #[test]
    fn test_initialize_updates_changed_remote() {
        let fx = Fixture::new();
        drop(fx.store("a"));

        let mut opts = fx.options("a", true);
        opts.remote_url = Some("https://example.invalid/wow.git".into());
        let store = VersionStore::initialize(opts, Arc::new(NoCredentials)).unwrap();
        let remote = store.repo.find_remote(REMOTE_NAME).unwrap();
        assert_eq!(remote.url(), Some("https://example.invalid/wow.git"));
    }

    #[test]
    fn test_commit_reports_no_changes() {
        let fx = Fixture::new();
        let store = fx.store("a");
        assert!(matches!(store.commit(SYNC_COMMIT_MESSAGE), Err(GitError::NoChanges)));
    }

    #[test]
    fn test_import_commit_mirrors_deletions() {
        let fx = Fixture::new();
        let store = fx.store("a");
        let root = fx.root("a");
        write(&root.join("_retail_/WTF/config.wtf"), "SET a \"1\"");
        write(&root.join("_retail_/WTF/Account/ACC/macros-cache.txt"), "macro");

        store.import_tree(&root, &retail_wtf(), &FilterConfig::default()).unwrap();
        store.commit(SYNC_COMMIT_MESSAGE).unwrap();
        assert_eq!(
            store.last_commit_paths().unwrap(),
            vec![
                "retail/WTF/Account/ACC/macros-cache.txt".to_string(),
                "retail/WTF/config.wtf".to_string(),
            ]
        );

        fs::remove_file(root.join("_retail_/WTF/Account/ACC/macros-cache.txt")).unwrap();
        store.import_tree(&root, &retail_wtf(), &FilterConfig::default()).unwrap();
        store.commit(SYNC_COMMIT_MESSAGE).unwrap();

        let head = store.repo.head().unwrap().peel_to_tree().unwrap();
        assert!(head
            .get_path(Path::new("retail/WTF/Account/ACC/macros-cache.txt"))
            .is_err());
        assert!(head.get_path(Path::new("retail/WTF/config.wtf")).is_ok());
        assert!(store.status().unwrap().is_empty());
        assert_eq!(store.trees_in_head().unwrap(), retail_wtf());
    }

    #[test]
    fn test_push_then_pull_fast_forward() {
        let fx = Fixture::new();
        let a = fx.store("a");
        let root_a = fx.root("a");
        write(&root_a.join("_retail_/WTF/config.wtf"), "from a");
        a.import_tree(&root_a, &retail_wtf(), &FilterConfig::default()).unwrap();
        a.commit(SYNC_COMMIT_MESSAGE).unwrap();
        assert!(a.is_ahead_of_remote().unwrap());
        a.push().unwrap();
        assert!(!a.is_ahead_of_remote().unwrap());

        let b = fx.store("b");
        assert_eq!(
            fs::read_to_string(b.repo_path().join("retail/WTF/config.wtf")).unwrap(),
            "from a"
        );

        write(&root_a.join("_retail_/WTF/config.wtf"), "from a, again");
        a.import_tree(&root_a, &retail_wtf(), &FilterConfig::default()).unwrap();
        a.commit(SYNC_COMMIT_MESSAGE).unwrap();
        a.push().unwrap();

        let outcome = b.pull().unwrap();
        assert_eq!(outcome.changed_paths, vec!["retail/WTF/config.wtf".to_string()]);
        assert!(outcome.conflicted_paths.is_empty());

        let root_b = fx.root("b");
        fs::create_dir_all(root_b.join("_retail_")).unwrap();
        b.export_tree(&root_b, &retail_wtf(), &FilterConfig::default()).unwrap();
        assert_eq!(
            fs::read_to_string(root_b.join("_retail_/WTF/config.wtf")).unwrap(),
            "from a, again"
        );
    }

    fn diverge(fx: &Fixture) -> (VersionStore, VersionStore) {
        let a = fx.store("a");
        let root_a = fx.root("a");
        write(&root_a.join("_retail_/WTF/config.wtf"), "base");
        a.import_tree(&root_a, &retail_wtf(), &FilterConfig::default()).unwrap();
        a.commit(SYNC_COMMIT_MESSAGE).unwrap();
        a.push().unwrap();

        let b = fx.store("b");
        let root_b = fx.root("b");
        write(&root_b.join("_retail_/WTF/config.wtf"), "local edit");
        b.import_tree(&root_b, &retail_wtf(), &FilterConfig::default()).unwrap();
        b.commit(SYNC_COMMIT_MESSAGE).unwrap();

        write(&root_a.join("_retail_/WTF/config.wtf"), "remote edit");
        a.import_tree(&root_a, &retail_wtf(), &FilterConfig::default()).unwrap();
        a.commit(SYNC_COMMIT_MESSAGE).unwrap();
        a.push().unwrap();
        (a, b)
    }

    #[test]
    fn test_push_rejected_when_behind() {
        let fx = Fixture::new();
        let (_a, b) = diverge(&fx);
        assert!(matches!(b.push(), Err(GitError::PushRejected { .. })));
    }

    #[test]
    fn test_conflict_remote_wins() {
        let fx = Fixture::new();
        let (_a, b) = diverge(&fx);

        let err = b.pull().unwrap_err();
        match err {
            GitError::MergeConflict { paths } => {
                assert_eq!(paths, vec!["retail/WTF/config.wtf".to_string()])
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(b.merge_in_progress());

        let outcome = b.resolve_conflicts(ConflictStrategy::RemoteWins).unwrap();
        assert_eq!(outcome.conflicted_paths, vec!["retail/WTF/config.wtf".to_string()]);
        assert!(outcome.changed_paths.contains(&"retail/WTF/config.wtf".to_string()));
        assert!(!b.merge_in_progress());
        assert_eq!(
            fs::read_to_string(b.repo_path().join("retail/WTF/config.wtf")).unwrap(),
            "remote edit"
        );
        assert_eq!(b.head().unwrap().unwrap().summary, MERGE_COMMIT_MESSAGE);
        b.push().unwrap();
    }

    #[test]
    fn test_conflict_local_wins() {
        let fx = Fixture::new();
        let (_a, b) = diverge(&fx);
        assert!(b.pull().is_err());

        let outcome = b.resolve_conflicts(ConflictStrategy::LocalWins).unwrap();
        assert_eq!(outcome.conflicted_paths.len(), 1);
        assert_eq!(
            fs::read_to_string(b.repo_path().join("retail/WTF/config.wtf")).unwrap(),
            "local edit"
        );
    }

    #[test]
    fn test_conflict_fail_fast_aborts() {
        let fx = Fixture::new();
        let (_a, b) = diverge(&fx);
        let before = b.head().unwrap().unwrap().sha;
        assert!(b.pull().is_err());

        let err = b.resolve_conflicts(ConflictStrategy::FailFast).unwrap_err();
        assert!(matches!(err, GitError::MergeConflict { .. }));
        assert!(!b.merge_in_progress());
        assert_eq!(b.head().unwrap().unwrap().sha, before);
        assert_eq!(
            fs::read_to_string(b.repo_path().join("retail/WTF/config.wtf")).unwrap(),
            "local edit"
        );
    }

    #[test]
    fn test_push_without_remote() {
        let fx = Fixture::new();
        let store =
            VersionStore::initialize(fx.options("a", false), Arc::new(NoCredentials)).unwrap();
        assert!(matches!(store.push(), Err(GitError::RemoteNotConfigured)));
        assert!(matches!(store.pull(), Err(GitError::RemoteNotConfigured)));
        assert!(!store.is_ahead_of_remote().unwrap());
    }

    #[test]
    fn test_change_kind_mapping() {
        assert_eq!(change_kind(Status::WT_NEW), ChangeKind::Added);
        assert_eq!(change_kind(Status::WT_DELETED), ChangeKind::Deleted);
        assert_eq!(change_kind(Status::INDEX_MODIFIED), ChangeKind::Modified);
        assert_eq!(change_kind(Status::CONFLICTED), ChangeKind::Conflicted);
    }
}
