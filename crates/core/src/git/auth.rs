//! Credential providers for remote transfers.
//!
//! The version store asks a [`CredentialProvider`] only when libgit2 reports
//! that the remote wants credentials. Providers never prompt on their own
//! unless they are interactive bindings supplied by a front end.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;

/// Credentials handed to the transport.
#[derive(Clone)]
pub enum Credentials {
    /// HTTPS username/password or token.
    UserPass { username: String, password: String },
    /// SSH key pair on disk.
    SshKey {
        username: String,
        public_key: Option<PathBuf>,
        private_key: PathBuf,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserPass { username, .. } => f
                .debug_struct("UserPass")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::SshKey {
                username,
                private_key,
                ..
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("private_key", private_key)
                .finish(),
        }
    }
}

/// The kinds of credentials the remote will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedCredentials {
    pub user_pass: bool,
    pub ssh_key: bool,
}

impl From<git2::CredentialType> for AllowedCredentials {
    fn from(allowed: git2::CredentialType) -> Self {
        Self {
            user_pass: allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT),
            ssh_key: allowed.contains(git2::CredentialType::SSH_KEY),
        }
    }
}

/// Provider answer.
#[derive(Debug, Clone)]
pub enum CredentialResponse {
    Provided(Credentials),
    /// The user or provider refused to supply credentials.
    Denied,
    /// No credentials of an acceptable kind are known.
    Unavailable,
}

/// Opaque source of credentials for a remote URL.
pub trait CredentialProvider: Send + Sync {
    fn provide_credentials(
        &self,
        remote_url: &str,
        username_from_url: Option<&str>,
        allowed: AllowedCredentials,
    ) -> CredentialResponse;
}

/// Provider that never has credentials. Remotes that need auth fail with
/// `AuthRequired`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn provide_credentials(
        &self,
        _remote_url: &str,
        _username_from_url: Option<&str>,
        _allowed: AllowedCredentials,
    ) -> CredentialResponse {
        CredentialResponse::Unavailable
    }
}

/// Fixed credentials, e.g. supplied by a GUI dialog.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

impl CredentialProvider for StaticCredentials {
    fn provide_credentials(
        &self,
        _remote_url: &str,
        _username_from_url: Option<&str>,
        _allowed: AllowedCredentials,
    ) -> CredentialResponse {
        CredentialResponse::Provided(self.0.clone())
    }
}

/// Non-interactive provider chain:
///
/// 1. SSH key (`auth.ssh_key`, else `~/.ssh/id_rsa`) for SSH remotes.
/// 2. Token from the configured environment variable.
/// 3. `gh auth token` for github.com remotes.
/// 4. Token cached in `<data_dir>/github_token.json`.
#[derive(Debug, Clone)]
pub struct DefaultCredentials {
    env_token: Option<String>,
    use_gh_cli: bool,
    ssh_key: Option<PathBuf>,
    token_file: PathBuf,
}

impl DefaultCredentials {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            env_token: config.auth.token.clone(),
            use_gh_cli: config.auth.use_gh_cli,
            ssh_key: config
                .auth
                .ssh_key
                .clone()
                .or_else(|| dirs::home_dir().map(|h| h.join(".ssh").join("id_rsa"))),
            token_file: config.token_file_path(),
        }
    }

    fn ssh_credentials(&self, username: &str) -> Option<Credentials> {
        let private_key = self.ssh_key.as_ref()?;
        if !private_key.exists() {
            return None;
        }
        let public_key = PathBuf::from(format!("{}.pub", private_key.display()));
        Some(Credentials::SshKey {
            username: username.to_string(),
            public_key: public_key.exists().then_some(public_key),
            private_key: private_key.clone(),
            passphrase: None,
        })
    }

    fn token(&self, remote_url: &str) -> Option<String> {
        if let Some(token) = &self.env_token {
            debug!("using token from environment");
            return Some(token.clone());
        }
        if !is_github(remote_url) {
            return None;
        }
        if self.use_gh_cli {
            if let Some(token) = gh_cli_token() {
                info!("using GitHub CLI authentication");
                return Some(token);
            }
        }
        match load_token(&self.token_file) {
            Some(token) => {
                info!("using cached GitHub token");
                Some(token)
            }
            None => None,
        }
    }
}

impl CredentialProvider for DefaultCredentials {
    fn provide_credentials(
        &self,
        remote_url: &str,
        username_from_url: Option<&str>,
        allowed: AllowedCredentials,
    ) -> CredentialResponse {
        if allowed.ssh_key {
            if let Some(creds) = self.ssh_credentials(username_from_url.unwrap_or("git")) {
                return CredentialResponse::Provided(creds);
            }
        }
        if allowed.user_pass {
            if let Some(token) = self.token(remote_url) {
                return CredentialResponse::Provided(token_credentials(token));
            }
        }
        CredentialResponse::Unavailable
    }
}

/// Username/password pair for an HTTPS token.
pub fn token_credentials(token: String) -> Credentials {
    Credentials::UserPass {
        username: token,
        password: "x-oauth-basic".into(),
    }
}

pub fn is_github(remote_url: &str) -> bool {
    remote_url.to_ascii_lowercase().contains("github.com")
}

fn gh_cli_token() -> Option<String> {
    let output = Command::new("gh").args(["auth", "token"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!token.is_empty()).then_some(token)
}

#[derive(Serialize, Deserialize)]
struct TokenFile {
    access_token: String,
}

/// Read a cached token. Missing or malformed files yield `None`.
pub fn load_token(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<TokenFile>(&contents) {
        Ok(file) if !file.access_token.is_empty() => Some(file.access_token),
        Ok(_) => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed token file");
            None
        }
    }
}

/// Cache a token with owner-only permissions.
pub fn save_token(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string(&TokenFile {
        access_token: token.to_string(),
    })
    .map_err(std::io::Error::other)?;
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), "token saved for future use");
    Ok(())
}
