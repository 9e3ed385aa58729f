//! Error types for the WoW Sync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type. [`ErrorKind`] is the flat taxonomy reported to event
//! sinks when a sync session fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Category of a sync failure, as surfaced to event sinks and the CLI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PathNotFound,
    NoChanges,
    AuthRequired,
    AuthDenied,
    RemoteRejected,
    MergeConflict,
    NetworkUnavailable,
    SyncInProgress,
    IoFailure,
    Cancelled,
    Configuration,
    Repository,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PathNotFound => "path_not_found",
            Self::NoChanges => "no_changes",
            Self::AuthRequired => "auth_required",
            Self::AuthDenied => "auth_denied",
            Self::RemoteRejected => "remote_rejected",
            Self::MergeConflict => "merge_conflict",
            Self::NetworkUnavailable => "network_unavailable",
            Self::SyncInProgress => "sync_in_progress",
            Self::IoFailure => "io_failure",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
            Self::Repository => "repository",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from the local version store (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error that does not fit a more specific variant.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, remote-tracking branch) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The repository has no `origin` remote configured.
    #[error("no remote repository configured")]
    RemoteNotConfigured,

    /// The staged tree is identical to HEAD.
    #[error("no changes to commit")]
    NoChanges,

    /// The transport demanded credentials and none were available.
    #[error("authentication required for '{url}'")]
    AuthRequired { url: String },

    /// Credentials were refused by the provider or rejected by the remote.
    #[error("authentication denied for '{url}': {detail}")]
    AuthDenied { url: String, detail: String },

    /// Push was rejected (e.g. non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// Merge left conflicting paths in the index and working tree.
    #[error("merge conflict in {} path(s): {}", .paths.len(), .paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    /// The remote could not be reached.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Dataset errors
// ---------------------------------------------------------------------------

/// Errors from scanning the WoW installation and mirroring trees.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The configured root path is missing or not a directory.
    #[error("root path not found: {0}")]
    RootNotFound(String),

    /// A copy, rename, or directory listing failed.
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl DatasetError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Terminal errors of a sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another session already holds the repository.
    #[error("sync already in progress ({holder})")]
    SyncInProgress { holder: String },

    /// Root path missing or unreadable.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// Nothing changed since the last commit.
    #[error("no changes to sync")]
    NoChanges,

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("authentication denied: {0}")]
    AuthDenied(String),

    /// The remote refused the push, even after one pull-and-retry.
    #[error("remote rejected push: {0}")]
    RemoteRejected(String),

    #[error("merge conflict in {} path(s): {}", .paths.len(), .paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Copy into or out of the repository failed; staged changes were discarded.
    #[error("I/O failure at '{path}': {detail}")]
    IoFailure { path: String, detail: String },

    /// The session was cancelled at a phase boundary.
    #[error("sync cancelled before {phase}")]
    Cancelled { phase: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// The taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SyncInProgress { .. } => ErrorKind::SyncInProgress,
            Self::PathNotFound(_) => ErrorKind::PathNotFound,
            Self::NoChanges => ErrorKind::NoChanges,
            Self::AuthRequired(_) => ErrorKind::AuthRequired,
            Self::AuthDenied(_) => ErrorKind::AuthDenied,
            Self::RemoteRejected(_) => ErrorKind::RemoteRejected,
            Self::MergeConflict { .. } => ErrorKind::MergeConflict,
            Self::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
            Self::IoFailure { .. } => ErrorKind::IoFailure,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Repository(_) => ErrorKind::Repository,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<GitError> for SyncError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::NoChanges => Self::NoChanges,
            GitError::RemoteNotConfigured => {
                Self::Configuration("no remote repository configured".into())
            }
            GitError::AuthRequired { url } => Self::AuthRequired(url),
            GitError::AuthDenied { url, detail } => Self::AuthDenied(format!("{url}: {detail}")),
            GitError::PushRejected { branch, detail } => {
                Self::RemoteRejected(format!("{branch}: {detail}"))
            }
            GitError::MergeConflict { paths } => Self::MergeConflict { paths },
            GitError::NetworkUnavailable(detail) => Self::NetworkUnavailable(detail),
            GitError::IoError(e) => Self::IoFailure {
                path: "<repository>".into(),
                detail: e.to_string(),
            },
            other => Self::Repository(other.to_string()),
        }
    }
}

impl From<DatasetError> for SyncError {
    fn from(err: DatasetError) -> Self {
        match err {
            DatasetError::RootNotFound(path) => Self::PathNotFound(path),
            DatasetError::Io { path, source } => Self::IoFailure {
                path,
                detail: source.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// TOML serialization error when saving.
    #[error("configuration serialize error: {0}")]
    SerializeError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading or writing the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
