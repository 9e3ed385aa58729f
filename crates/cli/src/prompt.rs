//! Interactive credential prompt used when the non-interactive chain has
//! nothing for an HTTPS remote.

use std::path::PathBuf;

use dialoguer::{Confirm, Password};
use indicatif::ProgressBar;
use tracing::{info, warn};

use wowsync_core::git::auth::{save_token, token_credentials};
use wowsync_core::git::{AllowedCredentials, CredentialProvider, CredentialResponse};

pub struct PromptCredentials {
    inner: Box<dyn CredentialProvider>,
    token_file: PathBuf,
    progress: Option<ProgressBar>,
}

impl PromptCredentials {
    pub fn new(inner: Box<dyn CredentialProvider>, token_file: PathBuf) -> Self {
        Self {
            inner,
            token_file,
            progress: None,
        }
    }

    /// Spinner to hide while the prompt is on screen.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    fn prompt(&self, remote_url: &str) -> CredentialResponse {
        let token = match Password::new()
            .with_prompt(format!("Access token for {}", remote_url))
            .allow_empty_password(true)
            .interact()
        {
            Ok(token) if !token.trim().is_empty() => token.trim().to_string(),
            Ok(_) => {
                info!("credential prompt left empty");
                return CredentialResponse::Denied;
            }
            Err(e) => {
                warn!(error = %e, "credential prompt failed");
                return CredentialResponse::Denied;
            }
        };

        let save = Confirm::new()
            .with_prompt("Save this token for future syncs?")
            .default(true)
            .interact()
            .unwrap_or(false);
        if save {
            if let Err(e) = save_token(&self.token_file, &token) {
                warn!(error = %e, "failed to save token");
            }
        }
        CredentialResponse::Provided(token_credentials(token))
    }
}

impl CredentialProvider for PromptCredentials {
    fn provide_credentials(
        &self,
        remote_url: &str,
        username_from_url: Option<&str>,
        allowed: AllowedCredentials,
    ) -> CredentialResponse {
        match self
            .inner
            .provide_credentials(remote_url, username_from_url, allowed)
        {
            CredentialResponse::Unavailable if allowed.user_pass && console::user_attended() => {
                match &self.progress {
                    Some(progress) => progress.suspend(|| self.prompt(remote_url)),
                    None => self.prompt(remote_url),
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wowsync_core::git::{Credentials, NoCredentials, StaticCredentials};

    const HTTPS_ONLY: AllowedCredentials = AllowedCredentials {
        user_pass: true,
        ssh_key: false,
    };

    #[test]
    fn test_known_credentials_skip_prompt() {
        let inner = StaticCredentials(Credentials::UserPass {
            username: "token".into(),
            password: "x-oauth-basic".into(),
        });
        let dir = tempfile::tempdir().unwrap();
        let provider = PromptCredentials::new(Box::new(inner), dir.path().join("token.json"));

        let response =
            provider.provide_credentials("https://github.com/me/wow.git", None, HTTPS_ONLY);
        assert!(matches!(response, CredentialResponse::Provided(_)));
        assert!(!dir.path().join("token.json").exists());
    }

    #[test]
    fn test_ssh_only_remote_is_not_prompted() {
        let dir = tempfile::tempdir().unwrap();
        let provider = PromptCredentials::new(Box::new(NoCredentials), dir.path().join("t.json"));
        let allowed = AllowedCredentials {
            user_pass: false,
            ssh_key: true,
        };
        let response = provider.provide_credentials("git@github.com:me/wow.git", Some("git"), allowed);
        assert!(matches!(response, CredentialResponse::Unavailable));
    }
}
