//! Licensor configuration.

use crate::LicensorError;
use std::path::PathBuf;

/// Configuration for a [`LicenseManager`](crate::LicenseManager).
///
/// This struct contains the application-level settings the manager and its
/// providers need; catalog and provider setup happen through the manager API.
#[derive(Debug, Clone)]
pub struct LicensorConfig {
    /// Application name, used in log fields (e.g., "owncloud").
    pub app_name: &'static str,

    /// Storage namespace for persisted provider data.
    /// Each application should use a unique namespace to avoid collisions.
    pub storage_namespace: &'static str,

    /// Root directory for provider storage.
    /// `None` resolves to `dirs::data_dir()/<storage_namespace>`.
    pub storage_root: Option<PathBuf>,

    /// Re-evaluate observers automatically when an entitlement reaches its
    /// expiry or next status change.
    pub schedule_status_changes: bool,
}

impl LicensorConfig {
    /// Create a configuration with default storage location and scheduling enabled.
    pub fn new(app_name: &'static str, storage_namespace: &'static str) -> Self {
        Self {
            app_name,
            storage_namespace,
            storage_root: None,
            schedule_status_changes: true,
        }
    }

    /// Override the storage root directory.
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), LicensorError> {
        if self.app_name.is_empty() {
            return Err(LicensorError::ConfigError(
                "app_name cannot be empty".to_string(),
            ));
        }
        if self.storage_namespace.is_empty() {
            return Err(LicensorError::ConfigError(
                "storage_namespace cannot be empty".to_string(),
            ));
        }
        if self
            .storage_namespace
            .contains(|c: char| c == '/' || c == '\\' || c == '.')
        {
            return Err(LicensorError::ConfigError(format!(
                "storage_namespace must be a single path segment, got {:?}",
                self.storage_namespace
            )));
        }
        Ok(())
    }

    /// Resolve the directory that holds per-provider storage files.
    pub fn provider_storage_dir(&self) -> Result<PathBuf, LicensorError> {
        let base = match &self.storage_root {
            Some(root) => root.clone(),
            None => dirs::data_dir().ok_or_else(|| {
                LicensorError::StorageIO("Could not find data directory".to_string())
            })?,
        };
        Ok(base.join(self.storage_namespace).join("providers"))
    }
}
