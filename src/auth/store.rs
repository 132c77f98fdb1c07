//! YAML credential store (`users.yaml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::chatlog::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub email: Option<String>,
    /// Salted PBKDF2 hash, PHC or passlib format
    pub password: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub usernames: BTreeMap<String, Credential>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieSettings {
    pub expiry_days: u32,
    pub key: String,
    pub name: String,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            expiry_days: 30,
            key: "some_random_key_here".to_string(),
            name: "theraipy_cookie".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preauthorized {
    #[serde(default)]
    pub emails: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialFile {
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub cookie: CookieSettings,
    #[serde(default)]
    pub preauthorized: Preauthorized,
}

impl CredentialFile {
    /// Read the store, writing a default one first if the file is absent.
    /// An empty or unparseable file is an error.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let defaults = Self::default();
            defaults.save(path)?;
            tracing::info!("Created credential store at {:?}", path);
            return Ok(defaults);
        }

        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        if contents.trim().is_empty() {
            return Err(anyhow!("Credential store {:?} is empty", path));
        }
        let store: CredentialFile = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        tracing::debug!(
            "Loaded {} credential(s) from {:?}",
            store.credentials.usernames.len(),
            path
        );
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize credential store")?;
        write_atomic(path, yaml.as_bytes())
    }

    pub fn get(&self, username: &str) -> Option<&Credential> {
        self.credentials.usernames.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.credentials.usernames.contains_key(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("users.yaml");

        let store = CredentialFile::load_or_init(&path).unwrap();
        assert!(store.credentials.usernames.is_empty());
        assert!(path.exists());

        let raw: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["cookie"]["expiry_days"].as_u64(), Some(30));
        assert_eq!(raw["cookie"]["name"].as_str(), Some("theraipy_cookie"));
        assert!(raw["preauthorized"]["emails"].as_sequence().unwrap().is_empty());
        assert!(raw["credentials"]["usernames"].is_mapping());
    }

    #[test]
    fn reads_existing_store_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");
        fs::write(
            &path,
            "credentials:\n  usernames:\n    alice:\n      email: ''\n      password: $pbkdf2-sha256$x\n      name: alice\n      created_at: '2024-05-01T10:00:00'\ncookie:\n  expiry_days: 30\n  key: k\n  name: c\npreauthorized:\n  emails: []\n",
        )
        .unwrap();

        let store = CredentialFile::load_or_init(&path).unwrap();
        let alice = store.get("alice").unwrap();
        assert_eq!(alice.name, "alice");
        assert_eq!(alice.created_at, "2024-05-01T10:00:00");
        assert_eq!(store.cookie.key, "k");
    }

    #[test]
    fn empty_or_corrupt_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");
        fs::write(&path, "\n").unwrap();
        assert!(CredentialFile::load_or_init(&path).is_err());

        fs::write(&path, "credentials: [unclosed").unwrap();
        assert!(CredentialFile::load_or_init(&path).is_err());
    }
}
