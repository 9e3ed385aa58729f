//! Shared data types: session phases, conflict strategies, and summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SyncPhase
// ---------------------------------------------------------------------------

/// States of a sync session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Scanning,
    Importing,
    Exporting,
    Committing,
    Transferring,
    Resolving,
    Done,
    Failed,
}

impl SyncPhase {
    /// Whether the session has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Importing => write!(f, "importing"),
            Self::Exporting => write!(f, "exporting"),
            Self::Committing => write!(f, "committing"),
            Self::Transferring => write!(f, "transferring"),
            Self::Resolving => write!(f, "resolving"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncDirection
// ---------------------------------------------------------------------------

/// Direction of a sync session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Upload: WoW installation → repository → remote.
    Push,
    /// Download: remote → repository → WoW installation.
    Pull,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
        }
    }
}

// ---------------------------------------------------------------------------
// ConflictStrategy
// ---------------------------------------------------------------------------

/// How a conflicted merge is resolved during pull.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Take the remote version of every conflicting path.
    #[default]
    RemoteWins,
    /// Keep the local version of every conflicting path.
    LocalWins,
    /// Abort the merge and fail the session.
    FailFast,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoteWins => write!(f, "remote-wins"),
            Self::LocalWins => write!(f, "local-wins"),
            Self::FailFast => write!(f, "fail-fast"),
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote-wins" | "remote" | "theirs" => Ok(Self::RemoteWins),
            "local-wins" | "local" | "ours" => Ok(Self::LocalWins),
            "fail-fast" | "fail" => Ok(Self::FailFast),
            other => Err(format!(
                "unknown conflict strategy '{}' (expected remote-wins, local-wins, or fail-fast)",
                other
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncSummary
// ---------------------------------------------------------------------------

/// Outcome of a completed sync session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub session_id: Uuid,
    pub direction: SyncDirection,
    /// Repository-relative paths that changed (committed on push, merged on pull).
    pub changed_paths: Vec<String>,
    /// Paths that conflicted during a merge and were resolved by policy.
    pub conflicted_paths: Vec<String>,
    /// SHA of the commit created by this session, if any.
    pub commit: Option<String>,
    /// The working tree matched HEAD; nothing new was committed.
    pub no_changes: bool,
    /// Whether history was transferred to or from the remote.
    pub transferred: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncSummary {
    pub(crate) fn new(session_id: Uuid, direction: SyncDirection) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            direction,
            changed_paths: Vec::new(),
            conflicted_paths: Vec::new(),
            commit: None,
            no_changes: false,
            transferred: false,
            started_at: now,
            completed_at: now,
        }
    }
}
