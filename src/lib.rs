//! # Licensor
//!
//! **Entitlement authorization for apps that sell features several ways.**
//!
//! Licensor reconciles independently refreshing sources of license truth
//! (App Store receipts, enterprise unlock lists, EMM builds, trial timers,
//! QA overrides) into one authorization decision per feature or product,
//! per environment, with live observation of changes.
//!
//! ## Features
//!
//! - **Provider snapshots** — every source publishes complete, immutable snapshots
//! - **Per-environment evaluation** — entitlements can apply to specific hosts or servers
//! - **Offer states** — uncommitted, in progress, committed, redundant, expired
//! - **Observers** — handlers fire only when a status or offer set changes
//! - **Persistent trials** — claim dates survive relaunch in integrity-checked records
//!
//! ## Quickstart
//!
//! ```no_run
//! use licensor::{
//!     AuthorizationStatus, EnterpriseProvider, Environment, Feature, LicenseManager,
//!     LicensorConfig, Product, Provider,
//! };
//!
//! # async fn run() -> Result<(), licensor::LicensorError> {
//! let manager = LicenseManager::new(LicensorConfig::new("myapp", "myapp-licensing"))?;
//! manager.register_feature(Feature::new("document-scanner"))?;
//! manager.register_product(Product::new("bundle.pro", "Pro", ["document-scanner"]))?;
//! manager.add_provider(Provider::new(
//!     "enterprise",
//!     "Enterprise",
//!     EnterpriseProvider::new(["bundle.pro"]),
//! ))?;
//!
//! let env = Environment::new().with_hostname("cloud.example.com");
//! let status = manager
//!     .perform_after_currently_pending_refreshes(|m| {
//!         m.authorization_status_for_feature("document-scanner", &env)
//!     })
//!     .await;
//! assert_eq!(status, AuthorizationStatus::Granted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Status rules
//!
//! - Within a feature or product, the most favorable entitlement wins
//! - Across an observer's watched ids, the least favorable status wins
//! - `Unknown` is only reported while some provider is still starting
//!
//! See [`LicenseManager`] for the full API.

#![deny(missing_docs)]
#![doc(html_root_url = "https://docs.rs/licensor/0.1.0")]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Model
pub mod catalog;
pub mod duration;
pub mod entitlement;
pub mod environment;
pub mod offer;
pub mod transaction;

// Policy layer
pub mod evaluation;
pub mod policy;

// Protocol layer
pub mod protocol;

// Cache layer
pub mod cache;

// Providers
pub mod provider;

// Manager (main public API)
mod dispatch;
pub mod manager;
pub mod observer;

// Re-exports for public API
pub use catalog::{
    Catalog, Feature, FeatureId, OfferId, Product, ProductId, ProviderId, ResolvedFeature,
    ResolvedProduct,
};
pub use clock::{Clock, SystemClock};
pub use config::LicensorConfig;
pub use duration::{DurationUnit, LicenseDuration};
pub use entitlement::{AuthorizationStatus, Entitlement, LicenseType};
pub use environment::{Certificate, Environment};
pub use errors::{CommitError, LicensorError};
pub use evaluation::EvaluationContext;
pub use manager::LicenseManager;
pub use observer::{ObservationRequest, Observer};
pub use offer::{CommitFuture, CommitHandler, CommitOptions, Offer, OfferState, Price};
pub use policy::applicability::ApplicabilityRule;
pub use protocol::receipt::{ReceiptFuture, ReceiptParseError, ReceiptRecord, ReceiptSupplier};
pub use provider::{
    AppStoreItem, AppStoreProvider, EmmProvider, EnterpriseProvider, PaymentQueue, Provider,
    ProviderKind, ProviderSnapshot, ProviderState, QaProvider, QaUnlockDelegate, TrialProvider,
};
pub use transaction::{ProviderTransactions, Transaction};

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
