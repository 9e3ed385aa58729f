//! Sync orchestrator.
//!
//! The [`SyncEngine`] drives push and pull sessions between the WoW
//! installation and the remote repository. Only one session may run at a
//! time; the session lock is held by the worker and released on drop, so it
//! is freed even if a session panics.
//!
//! Push: scan, import the tracked trees into the repository, commit, push.
//! A rejected push merges the remote history, exports the merged trees, and
//! retries once.
//!
//! Pull: scan, import and commit a local snapshot, fetch and merge, resolve
//! conflicts by policy, then export only the trees the merge touched. Trees
//! whose destination resolves outside the root are never written. Before
//! the first completed sync on a machine the snapshot is skipped and every
//! tree in the repository is exported.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::dataset::{DatasetMapper, ExportTarget, TrackedPath};
use crate::errors::{ErrorKind, GitError, SyncError};
use crate::events::EventSink;
use crate::git::auth::{CredentialProvider, DefaultCredentials};
use crate::git::store::{
    HeadInfo, MergeOutcome, StoreOptions, VersionStore, WorkingChange, SYNC_COMMIT_MESSAGE,
};
use crate::lock::SessionLock;
use crate::models::{ConflictStrategy, SyncDirection, SyncPhase, SyncSummary};

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Entry point for front ends. Cheap to clone; clones share the session lock.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    sink: Arc<dyn EventSink>,
    credentials: Arc<dyn CredentialProvider>,
    running: Arc<AtomicBool>,
}

/// Repository state as shown by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryStatus {
    pub repo_path: PathBuf,
    pub initialized: bool,
    pub remote_url: Option<String>,
    pub branch: String,
    pub head: Option<HeadInfo>,
    /// Commits ahead of / behind the remote as of the last transfer.
    pub ahead: Option<usize>,
    pub behind: Option<usize>,
    pub uncommitted: Vec<WorkingChange>,
    pub session_running: bool,
}

impl SyncEngine {
    /// Create an engine using the non-interactive credential chain.
    pub fn new(config: SyncConfig, sink: Arc<dyn EventSink>) -> Self {
        let credentials = Arc::new(DefaultCredentials::from_config(&config));
        Self {
            config: Arc::new(config),
            sink,
            credentials,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the credential provider (e.g. with an interactive prompt).
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Whether a session is currently running in this process.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start an upload session. Must be called from within a tokio runtime.
    pub fn start_push(&self) -> Result<SyncSession, SyncError> {
        self.start(SyncDirection::Push, self.config.sync.conflict_strategy)
    }

    /// Start a download session. `strategy` overrides the configured conflict
    /// policy for this session only.
    pub fn start_pull(&self, strategy: Option<ConflictStrategy>) -> Result<SyncSession, SyncError> {
        self.start(
            SyncDirection::Pull,
            strategy.unwrap_or(self.config.sync.conflict_strategy),
        )
    }

    /// Run a push session to completion.
    pub async fn push(&self) -> Result<SyncSummary, SyncError> {
        self.start_push()?.wait().await
    }

    /// Run a pull session to completion.
    pub async fn pull(&self, strategy: Option<ConflictStrategy>) -> Result<SyncSummary, SyncError> {
        self.start_pull(strategy)?.wait().await
    }

    fn start(
        &self,
        direction: SyncDirection,
        strategy: ConflictStrategy,
    ) -> Result<SyncSession, SyncError> {
        let lock = self.acquire()?;
        let id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        info!(session = %id, %direction, %strategy, "starting sync session");

        let session = Session {
            id,
            direction,
            strategy,
            config: self.config.clone(),
            sink: self.sink.clone(),
            credentials: self.credentials.clone(),
            cancel: cancel.clone(),
            phase: SyncPhase::Idle,
            summary: SyncSummary::new(id, direction),
            _lock: lock,
        };
        let handle = tokio::task::spawn_blocking(move || session.run());

        Ok(SyncSession {
            id,
            direction,
            cancel,
            sink: self.sink.clone(),
            handle,
        })
    }

    fn acquire(&self) -> Result<SessionLock, SyncError> {
        SessionLock::acquire(&self.running, &self.config.lock_path()).inspect_err(|e| {
            warn!(error = %e, "sync request rejected");
            self.sink.on_error(e.kind(), &e.to_string());
        })
    }

    /// Create or reopen the repository without syncing anything.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<Option<HeadInfo>, SyncError> {
        let lock = self.acquire()?;
        let options = StoreOptions::from_config(&self.config);
        let credentials = self.credentials.clone();
        let sink = self.sink.clone();

        let result = tokio::task::spawn_blocking(move || {
            let _lock = lock;
            let store = VersionStore::initialize(options, credentials)?;
            let head = store.head()?;
            sink.on_info(&format!(
                "repository ready at {}",
                store.repo_path().display()
            ));
            Ok::<_, GitError>(head)
        })
        .await
        .map_err(|e| SyncError::Internal(format!("initialize worker failed: {}", e)))?;

        result.map_err(|e| {
            let err = SyncError::from(e);
            self.sink.on_error(err.kind(), &err.to_string());
            err
        })
    }

    /// Inspect the repository. Read-only; does not take the session lock.
    pub fn status(&self) -> Result<RepositoryStatus, SyncError> {
        let options = StoreOptions::from_config(&self.config);
        let mut status = RepositoryStatus {
            repo_path: options.repo_path.clone(),
            initialized: false,
            remote_url: self.config.sync.remote_url.clone(),
            branch: options.branch.clone(),
            head: None,
            ahead: None,
            behind: None,
            uncommitted: Vec::new(),
            session_running: self.is_running() || self.config.lock_path().exists(),
        };

        let store = match VersionStore::open(options, self.credentials.clone()) {
            Ok(store) => store,
            Err(GitError::RepositoryNotFound(_)) => return Ok(status),
            Err(e) => return Err(e.into()),
        };
        status.initialized = true;
        status.head = store.head()?;
        if let Some((ahead, behind)) = store.ahead_behind()? {
            status.ahead = Some(ahead);
            status.behind = Some(behind);
        }
        status.uncommitted = store.status()?;
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Handle to a running session.
pub struct SyncSession {
    id: Uuid,
    direction: SyncDirection,
    cancel: Arc<AtomicBool>,
    sink: Arc<dyn EventSink>,
    handle: JoinHandle<Result<SyncSummary, SyncError>>,
}

impl SyncSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> SyncDirection {
        self.direction
    }

    /// Request cancellation. Honored at the next phase transition.
    pub fn cancel(&self) {
        info!(session = %self.id, "cancellation requested");
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// A token that cancels this session when set.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the session to end.
    pub async fn wait(self) -> Result<SyncSummary, SyncError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                let err = SyncError::Internal(format!("sync worker failed: {}", e));
                self.sink.on_error(ErrorKind::Internal, &err.to_string());
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session worker
// ---------------------------------------------------------------------------

/// State owned by the blocking worker for one session.
struct Session {
    id: Uuid,
    direction: SyncDirection,
    strategy: ConflictStrategy,
    config: Arc<SyncConfig>,
    sink: Arc<dyn EventSink>,
    credentials: Arc<dyn CredentialProvider>,
    cancel: Arc<AtomicBool>,
    phase: SyncPhase,
    summary: SyncSummary,
    _lock: SessionLock,
}

impl Session {
    fn run(mut self) -> Result<SyncSummary, SyncError> {
        let result = match self.direction {
            SyncDirection::Push => self.push_flow(),
            SyncDirection::Pull => self.pull_flow(),
        };

        self.summary.completed_at = Utc::now();
        match result {
            Ok(()) => {
                self.enter(SyncPhase::Done, "");
                self.sink.on_complete(&self.summary);
                Ok(self.summary)
            }
            Err(e) => {
                let message = e.to_string();
                self.enter(SyncPhase::Failed, &message);
                self.sink.on_error(e.kind(), &message);
                Err(e)
            }
        }
    }

    /// Move to `phase`, honoring a pending cancellation first.
    fn transition(&mut self, phase: SyncPhase, detail: &str) -> Result<(), SyncError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled {
                phase: phase.to_string(),
            });
        }
        self.enter(phase, detail);
        Ok(())
    }

    fn enter(&mut self, phase: SyncPhase, detail: &str) {
        info!(session = %self.id, from = %self.phase, to = %phase, "state transition");
        self.phase = phase;
        self.sink.on_phase(phase, detail);
    }

    fn push_flow(&mut self) -> Result<(), SyncError> {
        let root = self.config.sync.root_path.clone();
        self.transition(SyncPhase::Scanning, &root.display().to_string())?;
        let tracked = self.scan()?;
        let store = self.open_store()?;

        self.transition(
            SyncPhase::Importing,
            &format!("{} tracked tree(s)", tracked.len()),
        )?;
        store.import_tree(&root, &tracked, &self.config.filters)?;

        self.transition(SyncPhase::Committing, SYNC_COMMIT_MESSAGE)?;
        match store.commit(SYNC_COMMIT_MESSAGE) {
            Ok(oid) => {
                self.summary.commit = Some(oid.to_string());
                self.summary.changed_paths = store.last_commit_paths()?;
            }
            Err(GitError::NoChanges) => {
                self.summary.no_changes = true;
                self.sink.on_info("no local changes to commit");
            }
            Err(e) => return Err(e.into()),
        }
        store.mark_synced()?;

        if store.remote_url().is_none() {
            self.sink
                .on_warning("no remote configured; changes were committed locally only", None);
            return Ok(());
        }
        if self.summary.no_changes && !store.is_ahead_of_remote()? {
            debug!("remote already has local history");
            return Ok(());
        }

        self.transition(SyncPhase::Transferring, "pushing to remote")?;
        match store.push() {
            Ok(()) => {}
            Err(GitError::PushRejected { detail, .. }) => {
                self.sink.on_warning(
                    &format!("push rejected ({}); merging remote changes and retrying", detail),
                    None,
                );
                self.transition(SyncPhase::Resolving, "merging remote changes")?;
                let outcome = self.merge_remote(&store)?;
                let trees =
                    self.exportable_trees(&store, &tracked, &outcome.changed_paths, false)?;
                if !trees.is_empty() {
                    self.sink
                        .on_info(&format!("applying remote changes to {} tree(s)", trees.len()));
                    store.export_tree(&root, &trees, &self.config.filters)?;
                }
                self.record_merge(outcome);

                self.transition(SyncPhase::Transferring, "retrying push")?;
                store.push().map_err(|e| match e {
                    GitError::PushRejected { branch, detail } => SyncError::RemoteRejected(
                        format!("{}: {} (after merge and retry)", branch, detail),
                    ),
                    other => other.into(),
                })?;
            }
            Err(e) => return Err(e.into()),
        }
        self.summary.transferred = true;
        Ok(())
    }

    fn pull_flow(&mut self) -> Result<(), SyncError> {
        let root = self.config.sync.root_path.clone();
        self.transition(SyncPhase::Scanning, &root.display().to_string())?;
        let tracked = self.scan()?;
        let store = self.open_store()?;
        if store.remote_url().is_none() {
            return Err(SyncError::Configuration(
                "no remote repository configured; nothing to pull from".into(),
            ));
        }
        // Before the first completed sync the installation has no history in
        // the repository; its trees are replaced by the remote state.
        let fresh = !store.has_synced();

        if fresh {
            self.transition(SyncPhase::Importing, "new repository, skipping local snapshot")?;
            self.sink
                .on_info("first sync on this machine; applying the remote state");
        } else {
            self.transition(
                SyncPhase::Importing,
                &format!("{} tracked tree(s)", tracked.len()),
            )?;
            store.import_tree(&root, &tracked, &self.config.filters)?;

            self.transition(SyncPhase::Committing, "recording local snapshot")?;
            match store.commit(SYNC_COMMIT_MESSAGE) {
                Ok(oid) => {
                    info!(sha = %oid, "local changes recorded before merge");
                    self.summary.commit = Some(oid.to_string());
                }
                Err(GitError::NoChanges) => debug!("no local changes to record"),
                Err(e) => return Err(e.into()),
            }
        }

        self.transition(SyncPhase::Transferring, "fetching remote changes")?;
        let outcome = self.merge_remote(&store)?;
        self.summary.transferred = true;

        let local: &[TrackedPath] = if fresh { &[] } else { &tracked };
        let trees = self.exportable_trees(&store, local, &outcome.changed_paths, fresh)?;
        self.summary.no_changes = outcome.changed_paths.is_empty() && trees.is_empty();
        if self.summary.no_changes {
            self.sink.on_info("already up to date");
        }

        self.transition(
            SyncPhase::Exporting,
            &format!("{} tracked tree(s)", trees.len()),
        )?;
        if !trees.is_empty() {
            store.export_tree(&root, &trees, &self.config.filters)?;
        }
        self.record_merge(outcome);
        store.mark_synced()?;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<TrackedPath>, SyncError> {
        let mapper = DatasetMapper::new(
            self.config.sync.root_path.clone(),
            self.config.filters.variants.clone(),
        );
        let scan = mapper.scan_detailed()?;
        for skipped in &scan.skipped {
            self.sink
                .on_warning(&skipped.reason, Some(&skipped.path.display().to_string()));
        }
        if scan.tracked.is_empty() {
            self.sink.on_info("no game directories found; nothing to sync");
        }
        Ok(scan.tracked)
    }

    fn open_store(&self) -> Result<VersionStore, SyncError> {
        let store = VersionStore::initialize(
            StoreOptions::from_config(&self.config),
            self.credentials.clone(),
        )?;
        if store.merge_in_progress() {
            warn!("discarding merge left over from an interrupted session");
            store.abort_merge()?;
        }
        Ok(store)
    }

    /// Fetch and merge, resolving conflicts with the session strategy. The
    /// caller is in `Transferring` (pull) or `Resolving` (push retry).
    fn merge_remote(&mut self, store: &VersionStore) -> Result<MergeOutcome, SyncError> {
        match store.pull() {
            Ok(outcome) => Ok(outcome),
            Err(GitError::MergeConflict { paths }) => {
                if self.phase != SyncPhase::Resolving {
                    if let Err(e) = self.transition(
                        SyncPhase::Resolving,
                        &format!("{} conflicting path(s), policy {}", paths.len(), self.strategy),
                    ) {
                        store.abort_merge()?;
                        return Err(e);
                    }
                }
                if self.strategy != ConflictStrategy::FailFast {
                    let side = match self.strategy {
                        ConflictStrategy::LocalWins => "local",
                        _ => "remote",
                    };
                    for path in &paths {
                        self.sink.on_warning(
                            &format!("conflict resolved using the {} version", side),
                            Some(path),
                        );
                    }
                }
                Ok(store.resolve_conflicts(self.strategy)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Trees to write back to the installation: those touched by `changed`,
    /// plus trees the repository has but this machine does not. Limited to
    /// variants installed and enabled here whose destination stays inside the
    /// root; `warn_all` also reports skipped trees that were not touched.
    fn exportable_trees(
        &self,
        store: &VersionStore,
        local: &[TrackedPath],
        changed: &[String],
        warn_all: bool,
    ) -> Result<Vec<TrackedPath>, SyncError> {
        let touched: BTreeSet<TrackedPath> = changed
            .iter()
            .filter_map(|p| TrackedPath::containing(p))
            .collect();
        let missing: BTreeSet<TrackedPath> = store
            .trees_in_head()?
            .into_iter()
            .filter(|t| !local.contains(t))
            .collect();

        let mapper = DatasetMapper::new(
            self.config.sync.root_path.clone(),
            self.config.filters.variants.clone(),
        );
        let mut trees = Vec::new();
        for tracked in touched.union(&missing).copied() {
            if !self.config.filters.variants.is_enabled(tracked.variant) {
                debug!(tree = %tracked, "variant disabled, not exporting");
                continue;
            }
            let report = warn_all || touched.contains(&tracked);
            match mapper.export_target(&tracked)? {
                ExportTarget::Inside => trees.push(tracked),
                ExportTarget::NotInstalled => {
                    if report {
                        self.sink.on_warning(
                            &format!(
                                "{} is not installed here; skipping remote changes",
                                tracked.variant.display_name()
                            ),
                            Some(&tracked.to_string()),
                        );
                    }
                }
                ExportTarget::Escapes(target) => {
                    warn!(tree = %tracked, target = %target.display(),
                        "destination resolves outside root, not exporting");
                    if report {
                        self.sink.on_warning(
                            &format!(
                                "destination resolves to {} outside the WoW folder; skipping remote changes",
                                target.display()
                            ),
                            Some(&tracked.to_string()),
                        );
                    }
                }
                ExportTarget::Symlink => {
                    debug!(tree = %tracked, "destination is a symlink, not exporting");
                }
            }
        }
        Ok(trees)
    }

    fn record_merge(&mut self, outcome: MergeOutcome) {
        if outcome.commit.is_some() {
            self.summary.commit = outcome.commit;
        }
        let mut changed: BTreeSet<String> = self.summary.changed_paths.drain(..).collect();
        changed.extend(outcome.changed_paths);
        self.summary.changed_paths = changed.into_iter().collect();
        self.summary.conflicted_paths = outcome.conflicted_paths;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelSink, SyncEvent};
    use std::fs;

    fn engine_for(dir: &std::path::Path) -> (SyncEngine, tokio::sync::mpsc::UnboundedReceiver<SyncEvent>) {
        let root = dir.join("wow");
        fs::create_dir_all(root.join("_retail_/WTF")).unwrap();
        fs::write(root.join("_retail_/WTF/config.wtf"), "SET a \"1\"").unwrap();
        let config = SyncConfig::new(&root, None).with_data_dir(dir.join("data"));
        let (sink, rx) = ChannelSink::channel();
        (SyncEngine::new(config, Arc::new(sink)), rx)
    }

    #[tokio::test]
    async fn test_push_without_remote_commits_locally() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx) = engine_for(dir.path());

        let summary = engine.push().await.unwrap();
        assert!(!summary.transferred);
        assert_eq!(summary.changed_paths, vec!["retail/WTF/config.wtf".to_string()]);
        assert!(!engine.is_running());

        let mut saw_warning = false;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Warning { message, .. } = event {
                saw_warning |= message.contains("no remote");
            }
        }
        assert!(saw_warning);
    }

    #[tokio::test]
    async fn test_pull_without_remote_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _rx) = engine_for(dir.path());
        let err = engine.pull(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_cancel_before_start_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx) = engine_for(dir.path());

        let session = engine.start_push().unwrap();
        session.cancel();
        // The worker may finish before it sees the flag.
        if let Err(e) = session.wait().await {
            assert_eq!(e.kind(), ErrorKind::Cancelled);
        }
        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Phase { phase, .. } = event {
                phases.push(phase);
            }
        }
        let last = phases.last().copied().unwrap();
        assert!(last.is_terminal());
    }

    #[tokio::test]
    async fn test_status_before_and_after_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _rx) = engine_for(dir.path());

        let status = engine.status().unwrap();
        assert!(!status.initialized);

        let head = engine.initialize().await.unwrap();
        assert!(head.is_some());
        let status = engine.status().unwrap();
        assert!(status.initialized);
        assert!(status.uncommitted.is_empty());
        assert!(!status.session_running);
    }

    #[tokio::test]
    async fn test_missing_root_is_path_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::new(dir.path().join("nope"), None).with_data_dir(dir.path().join("data"));
        let (sink, _rx) = ChannelSink::channel();
        let engine = SyncEngine::new(config, Arc::new(sink));
        let err = engine.push().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathNotFound);
    }
}
