//! WoW Sync core library.
//!
//! This crate keeps World of Warcraft addons and settings in sync across
//! machines through a git repository: dataset mapping of the game
//! installation, copy filters, atomic tree mirroring, the git version store,
//! the session lock, event reporting, and the sync engine.

pub mod config;
pub mod dataset;
pub mod errors;
pub mod events;
pub mod filter;
pub mod git;
pub mod lock;
pub mod mirror;
pub mod models;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::SyncConfig;
pub use dataset::{DatasetMapper, ProductVariant, TrackedPath, TreeKind};
pub use errors::{CoreError, ErrorKind, SyncError};
pub use events::{ChannelSink, EventSink, SyncEvent, TracingSink};
pub use git::{CredentialProvider, CredentialResponse, Credentials, VersionStore};
pub use models::{ConflictStrategy, SyncDirection, SyncPhase, SyncSummary};
pub use sync_engine::{RepositoryStatus, SyncEngine, SyncSession};
