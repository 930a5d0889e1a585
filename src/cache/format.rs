//! Integrity-checked record format for persisted provider data.
//!
//! A stored record carries:
//! - The provider it belongs to
//! - The payload as JSON text
//! - The time it was written
//! - A SHA-256 digest over all of the above
//!
//! On load, we:
//! 1. Recompute and compare the digest
//! 2. Reject records claiming to be written in the future (clock tampering)

use crate::clock::Clock;
use crate::LicensorError;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tolerated clock skew between writing and reading a record.
const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Persisted provider data with an integrity digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Identifier of the provider that wrote the record.
    pub provider: String,

    /// When the record was written.
    pub stored_at: DateTime<Utc>,

    /// The payload (JSON).
    pub body: String,

    /// Hex SHA-256 over provider, timestamp and body.
    pub digest: String,
}

fn compute_digest(provider: &str, stored_at: &DateTime<Utc>, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b"\n");
    hasher.update(stored_at.to_rfc3339().as_bytes());
    hasher.update(b"\n");
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

impl StoredRecord {
    /// Serialize `payload` and seal it for `provider`.
    pub fn seal<T: Serialize>(
        provider: &str,
        payload: &T,
        clock: &dyn Clock,
    ) -> Result<Self, LicensorError> {
        let body = serde_json::to_string(payload)
            .map_err(|e| LicensorError::StorageIO(format!("Failed to serialize payload: {}", e)))?;
        let stored_at = clock.now_utc();
        let digest = compute_digest(provider, &stored_at, &body);

        Ok(Self {
            provider: provider.to_string(),
            stored_at,
            body,
            digest,
        })
    }

    /// Verify the record and deserialize its payload.
    ///
    /// # Errors
    /// - `StorageTampered` if the digest does not match, the record belongs to
    ///   another provider, or it was written in the future
    /// - `StorageIO` if the payload does not deserialize
    pub fn open<T: DeserializeOwned>(
        &self,
        provider: &str,
        clock: &dyn Clock,
    ) -> Result<T, LicensorError> {
        if self.provider != provider {
            return Err(LicensorError::StorageTampered);
        }

        let expected = compute_digest(&self.provider, &self.stored_at, &self.body);
        if expected != self.digest {
            return Err(LicensorError::StorageTampered);
        }

        let age = clock.now_utc().signed_duration_since(self.stored_at);
        if age < -Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(LicensorError::StorageTampered);
        }

        serde_json::from_str(&self.body)
            .map_err(|e| LicensorError::StorageIO(format!("Failed to deserialize payload: {}", e)))
    }

    /// Serialize the record to JSON.
    pub fn to_json(&self) -> Result<String, LicensorError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LicensorError::StorageIO(format!("Failed to serialize record: {}", e)))
    }

    /// Deserialize a record from JSON.
    pub fn from_json(json: &str) -> Result<Self, LicensorError> {
        serde_json::from_str(json)
            .map_err(|e| LicensorError::StorageIO(format!("Failed to deserialize record: {}", e)))
    }
}
