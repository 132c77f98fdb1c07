pub mod password;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;

use crate::advice::now_timestamp;
use crate::chatlog::is_safe_file_stem;
use password::{hash_password, verify_password};
use store::{Credential, CredentialFile};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),
    #[error("Username not found")]
    UnknownUser,
    #[error("Incorrect password")]
    IncorrectPassword,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl AuthError {
    fn validation(message: &str) -> Self {
        AuthError::Validation(message.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
    pub confirm: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Username/password checks against the YAML credential store.
pub struct Authenticator {
    path: PathBuf,
    store: RwLock<CredentialFile>,
}

impl Authenticator {
    /// Load the store from `path`, creating it with defaults if absent.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = CredentialFile::load_or_init(&path)?;
        Ok(Self {
            path,
            store: RwLock::new(store),
        })
    }

    pub fn register(&self, req: &RegisterRequest) -> Result<(), AuthError> {
        let username = req.username.as_str();
        if username.is_empty() {
            return Err(AuthError::validation("Please enter a username"));
        }
        if !is_safe_file_stem(username) {
            return Err(AuthError::validation(
                "Username may not contain path separators",
            ));
        }
        if self.read().contains(username) {
            return Err(AuthError::validation("Username already exists"));
        }
        if req.password != req.confirm {
            return Err(AuthError::validation("Passwords do not match"));
        }
        if req.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::validation(
                "Password must be at least 8 characters",
            ));
        }

        let credential = Credential {
            email: req.email.clone().filter(|e| !e.trim().is_empty()),
            password: hash_password(&req.password)?,
            name: username.to_string(),
            created_at: now_timestamp(),
        };

        let mut store = self
            .store
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Re-check under the write lock; another registration may have won.
        if store.contains(username) {
            return Err(AuthError::validation("Username already exists"));
        }
        let mut updated = store.clone();
        updated
            .credentials
            .usernames
            .insert(username.to_string(), credential);
        updated.save(&self.path)?;
        *store = updated;

        tracing::info!("Registered new user {}", username);
        Ok(())
    }

    /// Verify credentials and return the canonical username.
    pub fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::validation(
                "Please enter both username and password",
            ));
        }
        let stored_hash = match self.read().get(username) {
            Some(credential) => credential.password.clone(),
            None => return Err(AuthError::UnknownUser),
        };

        match verify_password(password, &stored_hash) {
            Ok(true) => Ok(username.to_string()),
            Ok(false) => Err(AuthError::IncorrectPassword),
            Err(e) => {
                tracing::warn!("Unreadable password hash for {}: {}", username, e);
                Err(AuthError::IncorrectPassword)
            }
        }
    }

    pub fn credential(&self, username: &str) -> Option<Credential> {
        self.read().get(username).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CredentialFile> {
        self.store
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
