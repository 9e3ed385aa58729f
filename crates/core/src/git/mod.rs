//! Git-backed version store and transfer credentials.

pub mod auth;
pub mod store;

pub use auth::{
    AllowedCredentials, CredentialProvider, CredentialResponse, Credentials, DefaultCredentials,
    NoCredentials, StaticCredentials,
};
pub use store::{
    ChangeKind, HeadInfo, MergeOutcome, StoreOptions, VersionStore, WorkingChange,
    SYNC_COMMIT_MESSAGE,
};
