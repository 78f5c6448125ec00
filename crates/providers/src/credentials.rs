use crate::{CredentialStore, CredentialStoreError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct StoredKeys {
    refresh_token: Option<String>,
}

/// Reads the refresh token from a JSON file on every load, so an operator
/// can repair the file without restarting the process.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load_refresh_token(&mut self) -> Result<String, CredentialStoreError> {
        let data = tokio::fs::read_to_string(&self.path).await.map_err(|source| {
            CredentialStoreError::Read {
                path: self.path.clone(),
                source,
            }
        })?;
        let keys: StoredKeys =
            serde_json::from_str(&data).map_err(|source| CredentialStoreError::Parse {
                path: self.path.clone(),
                source,
            })?;

        match keys.refresh_token {
            Some(token) if !token.trim().is_empty() => {
                debug!(path = %self.path.display(), "loaded refresh token");
                Ok(token)
            }
            _ => Err(CredentialStoreError::MissingRefreshToken {
                path: self.path.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FileCredentialStore;
    use crate::{CredentialStore, CredentialStoreError};

    #[tokio::test]
    async fn reads_refresh_token_and_ignores_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotify_keys.json");
        std::fs::write(
            &path,
            r#"{"access_token":"stale","refresh_token":"r-123","expires_in":3600}"#,
        )
        .unwrap();

        let mut store = FileCredentialStore::new(&path);
        assert_eq!(store.load_refresh_token().await.unwrap(), "r-123");
    }

    #[tokio::test]
    async fn rereads_the_file_on_each_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotify_keys.json");
        std::fs::write(&path, r#"{"refresh_token":"first"}"#).unwrap();

        let mut store = FileCredentialStore::new(&path);
        assert_eq!(store.load_refresh_token().await.unwrap(), "first");

        std::fs::write(&path, r#"{"refresh_token":"second"}"#).unwrap();
        assert_eq!(store.load_refresh_token().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCredentialStore::new(dir.path().join("absent.json"));

        let err = store.load_refresh_token().await.unwrap_err();
        assert!(matches!(err, CredentialStoreError::Read { .. }));
    }

    #[tokio::test]
    async fn reports_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotify_keys.json");
        std::fs::write(&path, "{ refresh_token: ").unwrap();

        let mut store = FileCredentialStore::new(&path);
        let err = store.load_refresh_token().await.unwrap_err();
        assert!(matches!(err, CredentialStoreError::Parse { .. }));
    }

    #[tokio::test]
    async fn reports_blank_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotify_keys.json");
        std::fs::write(&path, r#"{"refresh_token":"  "}"#).unwrap();

        let mut store = FileCredentialStore::new(&path);
        let err = store.load_refresh_token().await.unwrap_err();
        assert!(matches!(err, CredentialStoreError::MissingRefreshToken { .. }));
    }
}
