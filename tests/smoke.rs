//! Basic smoke test to verify the public API is reachable.

use licensor::{LicenseManager, LicensorConfig, LicensorError};

#[test]
fn crate_compiles() {
    // If this test runs, the public surface is exported.
    let _ = std::any::type_name::<licensor::LicensorConfig>();
    let _ = std::any::type_name::<licensor::LicensorError>();
    let _ = std::any::type_name::<licensor::LicenseManager>();
}

#[test]
fn manager_needs_a_runtime() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = LicensorConfig::new("smoke", "licensor-smoke").with_storage_root(dir.path());
    assert!(matches!(
        LicenseManager::new(config),
        Err(LicensorError::RuntimeUnavailable(_))
    ));
}

#[tokio::test]
async fn manager_starts_empty() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = LicensorConfig::new("smoke", "licensor-smoke").with_storage_root(dir.path());
    let manager = LicenseManager::new(config).unwrap();

    assert!(manager.providers().is_empty());
    assert_eq!(manager.catalog().features().count(), 0);
    assert_eq!(manager.config().app_name, "smoke");
    assert!(manager.retrieve_all_transactions().await.is_empty());
}
