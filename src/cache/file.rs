//! File-based provider storage with atomic writes.
//!
//! Stores sealed records under `<storage root>/<namespace>/providers/`.
//! Uses temp file + rename for atomic writes.

use crate::cache::format::StoredRecord;
use crate::config::LicensorConfig;
use crate::LicensorError;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Per-provider record storage.
#[derive(Debug, Clone)]
pub struct ProviderStore {
    /// Directory for record files.
    dir: PathBuf,
}

impl ProviderStore {
    /// Create a store at the configured location.
    ///
    /// The directory is created lazily on first save.
    pub fn new(config: &LicensorConfig) -> Result<Self, LicensorError> {
        Ok(Self {
            dir: config.provider_storage_dir()?,
        })
    }

    /// Create a store at a specific directory.
    pub fn with_path(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for a provider.
    pub fn path_for(&self, provider: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_file_stem(provider)))
    }

    /// Save a record atomically.
    pub async fn save(&self, record: &StoredRecord) -> Result<(), LicensorError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| LicensorError::StorageIO(format!("Failed to create storage dir: {}", e)))?;

        let target_path = self.path_for(&record.provider);
        let temp_path = self
            .dir
            .join(format!("{}.tmp", safe_file_stem(&record.provider)));

        let json = record.to_json()?;

        fs::write(&temp_path, json.as_bytes())
            .await
            .map_err(|e| LicensorError::StorageIO(format!("Failed to write temp file: {}", e)))?;

        fs::rename(&temp_path, &target_path)
            .await
            .map_err(|e| LicensorError::StorageIO(format!("Failed to rename record file: {}", e)))?;

        Ok(())
    }

    /// Load a provider's record, if one was saved.
    pub async fn load(&self, provider: &str) -> Result<Option<StoredRecord>, LicensorError> {
        let json = match fs::read_to_string(self.path_for(provider)).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LicensorError::StorageIO(format!(
                    "Failed to read record file: {}",
                    e
                )))
            }
        };

        StoredRecord::from_json(&json).map(Some)
    }
}

fn is_file_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

/// Map a provider identifier to a file stem that cannot escape the directory.
///
/// Identifiers that are already safe are used as is. Others are rewritten
/// and suffixed with `~` and a digest of the original, so two identifiers
/// never share a stem.
fn safe_file_stem(provider: &str) -> String {
    if !provider.is_empty() && !provider.starts_with('.') && provider.chars().all(is_file_safe) {
        return provider.to_string();
    }

    let rewritten: String = provider
        .chars()
        .map(|c| if is_file_safe(c) { c } else { '_' })
        .collect();
    let digest = hex::encode(Sha256::digest(provider.as_bytes()));
    format!("{}~{}", rewritten.trim_start_matches('.'), &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(provider: &str, started: &str) -> StoredRecord {
        let clock = MockClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        StoredRecord::seal(provider, &serde_json::json!({ "started_at": started }), &clock)
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProviderStore::with_path(temp_dir.path().join("providers"));

        let saved = record("trial.pro", "2025-01-15T12:00:00Z");
        store.save(&saved).await.unwrap();

        let loaded = store.load("trial.pro").await.unwrap();
        assert_eq!(loaded, Some(saved));
    }

    #[tokio::test]
    async fn test_store_load_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProviderStore::with_path(temp_dir.path());
        assert!(store.load("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProviderStore::with_path(temp_dir.path());

        store.save(&record("trial", "2025-01-01T00:00:00Z")).await.unwrap();
        let second = record("trial", "2025-02-01T00:00:00Z");
        store.save(&second).await.unwrap();

        assert_eq!(store.load("trial").await.unwrap(), Some(second));
        assert!(!temp_dir.path().join("trial.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProviderStore::with_path(temp_dir.path());
        std::fs::write(store.path_for("trial"), "{not json").unwrap();

        assert!(matches!(
            store.load("trial").await,
            Err(LicensorError::StorageIO(_))
        ));
    }

    #[test]
    fn test_path_for_sanitizes() {
        let store = ProviderStore::with_path("/data/providers");
        let escaped = store.path_for("../etc/passwd");
        assert_eq!(escaped.parent(), Some(Path::new("/data/providers")));
        let name = escaped.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("_etc_passwd~"));
        assert!(name.ends_with(".json"));

        assert_eq!(
            store.path_for("com.owncloud.trial"),
            PathBuf::from("/data/providers/com.owncloud.trial.json")
        );
    }

    #[tokio::test]
    async fn test_rewritten_ids_do_not_collide() {
        let temp_dir = TempDir::new().unwrap();
        let store = ProviderStore::with_path(temp_dir.path());
        assert_ne!(store.path_for("trial:pro"), store.path_for("trial_pro"));
        assert_ne!(store.path_for("trial:pro"), store.path_for("trial/pro"));

        let colon = record("trial:pro", "2025-01-01T00:00:00Z");
        let underscore = record("trial_pro", "2025-02-01T00:00:00Z");
        store.save(&colon).await.unwrap();
        store.save(&underscore).await.unwrap();

        assert_eq!(store.load("trial:pro").await.unwrap(), Some(colon));
        assert_eq!(store.load("trial_pro").await.unwrap(), Some(underscore));
    }
}
