//! Credential resolution for provider configs.
//!
//! A `ProviderConfig` carries an opaque `credential_ref`; the session
//! manager resolves it to a [`Secret`] exactly once at session creation
//! and places the plaintext only in the loopback request body.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

/// A resolved secret. `Debug` and `Display` render `***`; the raw value
/// is only reachable through [`Secret::expose`] at the request-build
/// site.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***")
    }
}

/// Seam to the host's secure storage.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn resolve(&self, credential_ref: &str) -> Option<Secret>;
}

/// JSON-file-backed store: a flat `{"ref": "secret"}` object, loaded
/// once and cached.
pub struct FileCredentialStore {
    path: PathBuf,
    cache: RwLock<Option<HashMap<String, String>>>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    fn load(&self) -> HashMap<String, String> {
        {
            let cached = self.cache.read().expect("credential cache poisoned");
            if let Some(map) = cached.as_ref() {
                return map.clone();
            }
        }

        let map = read_credentials_file(&self.path).unwrap_or_else(|e| {
            tracing::warn!(path = %self.path.display(), "failed to load credentials: {e}");
            HashMap::new()
        });

        let mut cached = self.cache.write().expect("credential cache poisoned");
        *cached = Some(map.clone());
        map
    }
}

fn read_credentials_file(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn resolve(&self, credential_ref: &str) -> Option<Secret> {
        self.load().get(credential_ref).cloned().map(Secret::new)
    }
}

/// In-memory store for tests and embedders that hold secrets elsewhere.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential_ref: impl Into<String>, secret: impl Into<String>) {
        self.entries
            .write()
            .expect("credential map poisoned")
            .insert(credential_ref.into(), secret.into());
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn resolve(&self, credential_ref: &str) -> Option<Secret> {
        self.entries
            .read()
            .expect("credential map poisoned")
            .get(credential_ref)
            .cloned()
            .map(Secret::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_never_prints_plaintext() {
        let secret = Secret::new("sk-very-secret");
        assert_eq!(format!("{secret}"), "***");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.expose(), "sk-very-secret");
    }

    #[tokio::test]
    async fn file_store_resolves_refs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, r#"{"hosted-key": "sk-abc123"}"#).unwrap();

        let store = FileCredentialStore::new(&path);
        let secret = store.resolve("hosted-key").await.unwrap();
        assert_eq!(secret.expose(), "sk-abc123");
        assert!(store.resolve("missing").await.is_none());
    }

    #[tokio::test]
    async fn memory_store_resolves_refs() {
        let store = MemoryCredentialStore::new();
        store.insert("r1", "s1");
        assert_eq!(store.resolve("r1").await.unwrap().expose(), "s1");
        assert!(store.resolve("r2").await.is_none());
    }
}
