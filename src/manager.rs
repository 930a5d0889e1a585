//! License Manager - the main public API for Licensor.
//!
//! The `LicenseManager` ties the catalog and the providers together:
//! - Registers features and products
//! - Adds, starts and removes providers
//! - Answers authorization queries against the published snapshots
//! - Delivers status and offer changes to observers through one dispatcher

use crate::cache::file::ProviderStore;
use crate::catalog::{
    Catalog, Feature, FeatureId, OfferId, Product, ProductId, ProviderId, ResolvedFeature, ResolvedProduct,
};
use crate::clock::{Clock, SystemClock};
use crate::config::LicensorConfig;
use crate::dispatch::{self, DispatchEvent};
use crate::entitlement::AuthorizationStatus;
use crate::environment::Environment;
use crate::evaluation::EvaluationContext;
use crate::observer::{ObservationRequest, Observer};
use crate::offer::{Offer, OfferState};
use crate::provider::{Provider, ProviderContext, ProviderKind};
use crate::transaction::{sort_newest_first, ProviderTransactions};
use crate::LicensorError;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PURCHASES_DISABLED_MESSAGE: &str =
    "In-app purchases are disabled on this device. Purchases can be allowed in the device's restrictions settings.";

/// A provider as tracked by the manager.
pub(crate) struct ProviderEntry {
    pub(crate) provider: Arc<Provider>,
    /// Generation of the last snapshot the dispatcher reconciled.
    pub(crate) seen_generation: Option<u64>,
    /// Products that snapshot contributed.
    pub(crate) seen_products: BTreeSet<ProductId>,
    forwarder: JoinHandle<()>,
}

impl Drop for ProviderEntry {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

pub(crate) struct Registry {
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) providers: Vec<ProviderEntry>,
    pub(crate) observers: BTreeMap<u64, Arc<Observer>>,
    /// Whether some provider was starting at the last reconcile.
    pub(crate) last_pending: bool,
}

pub(crate) struct ManagerInner {
    pub(crate) config: LicensorConfig,
    pub(crate) clock: Arc<dyn Clock>,
    provider_context: ProviderContext,
    registry: Mutex<Registry>,
    events: mpsc::UnboundedSender<DispatchEvent>,
    qa_slot: OnceCell<ProviderId>,
    next_observer_id: AtomicU64,
    runtime: Handle,
    dispatcher: JoinHandle<()>,
}

impl ManagerInner {
    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pin the catalog, every provider's snapshot and the current time.
    pub(crate) fn evaluation_context(&self) -> EvaluationContext {
        let registry = self.lock_registry();
        let snapshots = registry
            .providers
            .iter()
            .map(|entry| entry.provider.snapshot())
            .collect();
        let pending = registry
            .providers
            .iter()
            .any(|entry| entry.provider.is_starting());
        EvaluationContext::new(
            Arc::clone(&registry.catalog),
            snapshots,
            self.clock.now_utc(),
            pending,
        )
    }

    fn send(&self, event: DispatchEvent) {
        if self.events.send(event).is_err() {
            warn!("Dispatcher is gone, event dropped");
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Main entry point of Licensor.
///
/// Create one per process context and share it; clones refer to the same
/// manager. Must be created inside a tokio runtime, which hosts the
/// dispatcher and provider start tasks.
#[derive(Clone)]
pub struct LicenseManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for LicenseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseManager")
            .field("app_name", &self.inner.config.app_name)
            .field("providers", &self.inner.lock_registry().providers.len())
            .finish_non_exhaustive()
    }
}

impl LicenseManager {
    /// Create a new license manager with the given configuration.
    ///
    /// Uses the system clock for time operations.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Configuration validation fails
    /// - The storage location cannot be determined
    /// - No tokio runtime is running
    pub fn new(config: LicensorConfig) -> Result<Self, LicensorError> {
        config.validate()?;
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a license manager with a custom clock (for testing).
    #[cfg(any(test, feature = "test-seams"))]
    pub fn new_with_clock(
        config: LicensorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LicensorError> {
        config.validate()?;
        Self::with_clock(config, clock)
    }

    fn with_clock(config: LicensorConfig, clock: Arc<dyn Clock>) -> Result<Self, LicensorError> {
        let runtime = Handle::try_current()
            .map_err(|e| LicensorError::RuntimeUnavailable(e.to_string()))?;
        let store = ProviderStore::new(&config)?;
        let provider_context = ProviderContext::new(Arc::clone(&clock), Some(store));
        let (events, receiver) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak| ManagerInner {
            dispatcher: runtime.spawn(dispatch::run(weak.clone(), receiver)),
            config,
            clock,
            provider_context,
            registry: Mutex::new(Registry {
                catalog: Arc::new(Catalog::default()),
                providers: Vec::new(),
                observers: BTreeMap::new(),
                last_pending: false,
            }),
            events,
            qa_slot: OnceCell::new(),
            next_observer_id: AtomicU64::new(1),
            runtime,
        });

        info!(app = inner.config.app_name, "License manager created");
        Ok(Self { inner })
    }

    /// Get the current configuration.
    pub fn config(&self) -> &LicensorConfig {
        &self.inner.config
    }

    // ---- Catalog ----

    /// Register a feature.
    ///
    /// # Errors
    /// `DuplicateIdentifier` if a feature with the same identifier exists.
    pub fn register_feature(&self, feature: Feature) -> Result<(), LicensorError> {
        {
            let mut registry = self.inner.lock_registry();
            if registry.catalog.feature(feature.identifier.as_str()).is_some() {
                return Err(LicensorError::DuplicateIdentifier {
                    kind: "feature",
                    identifier: feature.identifier.to_string(),
                });
            }
            debug!(feature = %feature.identifier, "Feature registered");
            Arc::make_mut(&mut registry.catalog)
                .features
                .insert(feature.identifier.clone(), Arc::new(feature));
        }
        self.inner.send(DispatchEvent::Reevaluate);
        Ok(())
    }

    /// Register a product.
    ///
    /// # Errors
    /// `DuplicateIdentifier` if a product with the same identifier exists.
    pub fn register_product(&self, product: Product) -> Result<(), LicensorError> {
        {
            let mut registry = self.inner.lock_registry();
            if registry.catalog.product(product.identifier.as_str()).is_some() {
                return Err(LicensorError::DuplicateIdentifier {
                    kind: "product",
                    identifier: product.identifier.to_string(),
                });
            }
            for feature in &product.contents {
                if registry.catalog.feature(feature.as_str()).is_none() {
                    debug!(
                        product = %product.identifier,
                        feature = %feature,
                        "Product lists a feature that is not registered"
                    );
                }
            }
            debug!(product = %product.identifier, "Product registered");
            Arc::make_mut(&mut registry.catalog)
                .products
                .insert(product.identifier.clone(), Arc::new(product));
        }
        self.inner.send(DispatchEvent::Reevaluate);
        Ok(())
    }

    /// The registered features and products.
    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.inner.lock_registry().catalog)
    }

    // ---- Providers ----

    /// Add a provider and start it in the background.
    ///
    /// Until its first load finishes, identifiers without entitlements
    /// report `Unknown`. Start failures are logged and leave the provider
    /// stopped; they do not affect other providers.
    ///
    /// # Errors
    /// - `DuplicateIdentifier` if a provider with the same id was added
    /// - `ProviderConflict` if another QA provider was added first, or the
    ///   provider belongs to another manager
    pub fn add_provider(&self, provider: Arc<Provider>) -> Result<(), LicensorError> {
        let guard = {
            let mut registry = self.inner.lock_registry();
            let id = provider.id().clone();

            if registry.providers.iter().any(|e| e.provider.id() == &id) {
                return Err(LicensorError::DuplicateIdentifier {
                    kind: "provider",
                    identifier: id.to_string(),
                });
            }

            let is_qa = matches!(provider.kind(), ProviderKind::Qa(_));
            if is_qa {
                if let Some(winner) = self.inner.qa_slot.get() {
                    if winner != &id {
                        return Err(LicensorError::ProviderConflict(format!(
                            "QA provider {} is already active, ignoring {}",
                            winner, id
                        )));
                    }
                }
            }

            provider.attach(self.inner.provider_context.clone())?;
            if is_qa {
                let _ = self.inner.qa_slot.set(id.clone());
            }

            let forwarder = dispatch::spawn_forwarder(
                &self.inner.runtime,
                &provider,
                self.inner.events.clone(),
            );
            let guard = provider.begin_operation();
            registry.providers.push(ProviderEntry {
                provider: Arc::clone(&provider),
                seen_generation: None,
                seen_products: BTreeSet::new(),
                forwarder,
            });
            guard
        };

        info!(provider = %provider.id(), kind = provider.kind().name(), "Provider added");
        self.inner
            .send(DispatchEvent::ProviderStateChanged(provider.id().clone()));

        let starting = Arc::clone(&provider);
        self.inner.runtime.spawn(async move {
            if let Err(e) = starting.start_with(guard).await {
                warn!(provider = %starting.id(), error = %e, "Provider did not start");
            }
        });
        Ok(())
    }

    /// Remove a provider, stop it and withdraw its data.
    ///
    /// # Errors
    /// `UnknownProvider` if no provider with this id was added.
    pub async fn remove_provider(&self, id: &str) -> Result<(), LicensorError> {
        let entry = {
            let mut registry = self.inner.lock_registry();
            let index = registry
                .providers
                .iter()
                .position(|e| e.provider.id().as_str() == id)
                .ok_or_else(|| LicensorError::UnknownProvider(id.to_string()))?;
            registry.providers.remove(index)
        };

        let provider = Arc::clone(&entry.provider);
        let mut products = entry.seen_products.clone();
        products.extend(provider.snapshot().products());
        drop(entry);

        provider.stop_providing().await?;
        self.inner.send(DispatchEvent::ProvidersRemoved(products));
        info!(provider = %id, "Provider removed");
        Ok(())
    }

    /// Look up a provider.
    pub fn provider(&self, id: &str) -> Option<Arc<Provider>> {
        self.inner
            .lock_registry()
            .providers
            .iter()
            .find(|e| e.provider.id().as_str() == id)
            .map(|e| Arc::clone(&e.provider))
    }

    /// All providers, in the order they were added.
    pub fn providers(&self) -> Vec<Arc<Provider>> {
        self.inner
            .lock_registry()
            .providers
            .iter()
            .map(|e| Arc::clone(&e.provider))
            .collect()
    }

    // ---- Queries ----

    /// A point-in-time view of the current data.
    pub fn evaluation_context(&self) -> EvaluationContext {
        self.inner.evaluation_context()
    }

    /// A feature with its products and current entitlements.
    pub fn feature(&self, id: &str) -> Option<ResolvedFeature> {
        let context = self.inner.evaluation_context();
        let feature = Arc::clone(context.catalog().feature(id)?);
        Some(ResolvedFeature {
            products: context.catalog().products_containing(id).cloned().collect(),
            entitlements: context.entitlements_for_feature(id),
            feature,
        })
    }

    /// A product with its features and current entitlements.
    pub fn product(&self, id: &str) -> Option<ResolvedProduct> {
        let context = self.inner.evaluation_context();
        let product = Arc::clone(context.catalog().product(id)?);
        Some(ResolvedProduct {
            features: product
                .contents
                .iter()
                .filter_map(|f| context.catalog().feature(f.as_str()).cloned())
                .collect(),
            entitlements: context.entitlements_covering_product(id),
            product,
        })
    }

    /// Features for which at least one offer is published.
    pub fn features_with_offers(&self) -> Vec<Arc<Feature>> {
        let context = self.inner.evaluation_context();
        let offered: BTreeSet<ProductId> = context.offers().map(|o| o.product_id.clone()).collect();
        context
            .catalog()
            .features()
            .filter(|feature| {
                context
                    .catalog()
                    .products_containing(feature.identifier.as_str())
                    .any(|p| offered.contains(&p.identifier))
            })
            .cloned()
            .collect()
    }

    /// Offers for every product containing the feature.
    pub fn offers_for_feature(&self, feature: &str) -> Vec<Arc<Offer>> {
        let context = self.inner.evaluation_context();
        let products: BTreeSet<ProductId> = context
            .catalog()
            .products_containing(feature)
            .map(|p| p.identifier.clone())
            .collect();
        context.offers_for_products(&products)
    }

    /// Effective state of an offer in the environment, if it is published.
    pub fn offer_state(&self, id: &str, environment: &Environment) -> Option<OfferState> {
        self.inner
            .evaluation_context()
            .offer_state(&OfferId::from(id), environment)
    }

    /// Authorization status of a feature.
    ///
    /// Evaluates the published snapshots; no refresh is triggered.
    pub fn authorization_status_for_feature(
        &self,
        id: &str,
        environment: &Environment,
    ) -> AuthorizationStatus {
        self.inner
            .evaluation_context()
            .status_for_feature(id, environment)
    }

    /// Authorization status of a product.
    pub fn authorization_status_for_product(
        &self,
        id: &str,
        environment: &Environment,
    ) -> AuthorizationStatus {
        self.inner
            .evaluation_context()
            .status_for_product(id, environment)
    }

    /// Message to show when the device disallows purchases and something
    /// is for sale. With a feature, only that feature's offers count.
    pub fn in_app_purchase_message(&self, feature: Option<&str>) -> Option<String> {
        let disallowed = self
            .providers()
            .iter()
            .any(|p| p.purchases_allowed() == Some(false));
        if !disallowed {
            return None;
        }

        let has_offers = match feature {
            Some(feature) => !self.offers_for_feature(feature).is_empty(),
            None => self.inner.evaluation_context().offers().next().is_some(),
        };
        has_offers.then(|| PURCHASES_DISABLED_MESSAGE.to_string())
    }

    // ---- Observation ----

    /// Observe products and features, reporting status changes to `handler`.
    ///
    /// The handler is called once synchronously with `is_initial = true`
    /// before this returns. It stops being called once `owner` or
    /// `environment` is dropped.
    pub fn observe_products<I, P, J, F, O, H>(
        &self,
        products: I,
        features: J,
        environment: &Arc<Environment>,
        owner: &Arc<O>,
        handler: H,
    ) -> Arc<Observer>
    where
        I: IntoIterator<Item = P>,
        P: Into<ProductId>,
        J: IntoIterator<Item = F>,
        F: Into<FeatureId>,
        O: Any + Send + Sync,
        H: Fn(&Observer, bool, AuthorizationStatus) + Send + Sync + 'static,
    {
        self.observe(
            ObservationRequest::new(environment)
                .products(products)
                .features(features)
                .owned_by(owner)
                .on_status(handler),
        )
    }

    /// Register an observation.
    ///
    /// Evaluates synchronously (handlers see `is_initial = true`), then
    /// registers the observer for change delivery on the dispatcher.
    pub fn observe(&self, request: ObservationRequest) -> Arc<Observer> {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let observer = Arc::new(Observer::new(id, request));

        let context = self.inner.evaluation_context();
        if !observer.evaluate(&context, true) {
            debug!(observer = id, "Observer inactive at registration");
            return observer;
        }

        self.inner
            .lock_registry()
            .observers
            .insert(id, Arc::clone(&observer));
        self.inner.send(DispatchEvent::ObserverRegistered(id));
        observer
    }

    /// Stop an observer. No handler call starts after this returns.
    pub fn stop_observer(&self, observer: &Observer) {
        observer.deactivate();
        self.inner.lock_registry().observers.remove(&observer.id());
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner.lock_registry().observers.len()
    }

    /// Force re-evaluation of every observer.
    pub fn reevaluate(&self) {
        self.inner.send(DispatchEvent::Reevaluate);
    }

    // ---- Async operations ----

    /// Run `block` once every in-flight start or refresh has finished and
    /// the dispatcher has delivered the resulting changes.
    pub async fn perform_after_currently_pending_refreshes<F, R>(&self, block: F) -> R
    where
        F: FnOnce(&LicenseManager) -> R,
    {
        for provider in self.providers() {
            provider.wait_idle().await;
        }
        self.barrier().await;
        block(self)
    }

    async fn barrier(&self) {
        let (done, waiter) = oneshot::channel();
        self.inner.send(DispatchEvent::Barrier(done));
        if waiter.await.is_err() {
            warn!("Dispatcher dropped a barrier");
        }
    }

    /// Ask every provider to restore previous purchases.
    ///
    /// All providers are asked even if one fails.
    ///
    /// # Errors
    /// The first failure encountered.
    pub async fn restore_purchases(&self) -> Result<(), LicensorError> {
        let mut first_error = None;
        for provider in self.providers() {
            if let Err(e) = provider.restore_purchases().await {
                warn!(provider = %provider.id(), error = %e, "Restore failed");
                first_error.get_or_insert(e);
            }
        }
        self.barrier().await;
        first_error.map_or(Ok(()), Err)
    }

    /// Purchase history of every provider that has any, newest first.
    pub async fn retrieve_all_transactions(&self) -> Vec<ProviderTransactions> {
        let providers = self.providers();
        for provider in &providers {
            provider.wait_idle().await;
        }

        providers
            .iter()
            .filter_map(|provider| {
                let mut transactions = provider.snapshot().transactions.clone();
                if transactions.is_empty() {
                    return None;
                }
                sort_newest_first(&mut transactions);
                Some(ProviderTransactions {
                    provider_id: provider.id().clone(),
                    provider_name: provider.name().to_string(),
                    transactions,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::entitlement::LicenseType;
    use crate::duration::LicenseDuration;
    use crate::offer::CommitOptions;
    use crate::provider::{EnterpriseProvider, QaProvider, TrialProvider};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> LicensorConfig {
        LicensorConfig::new("test-app", "licensor-test").with_storage_root(dir.path())
    }

    fn manager(dir: &TempDir) -> LicenseManager {
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        ));
        let manager = LicenseManager::new_with_clock(test_config(dir), clock).unwrap();
        manager.register_feature(Feature::new("document-scanner")).unwrap();
        manager.register_feature(Feature::new("shortcuts")).unwrap();
        manager
            .register_product(Product::new(
                "bundle.pro",
                "Pro",
                ["document-scanner", "shortcuts"],
            ))
            .unwrap();
        manager
    }

    #[test]
    fn test_requires_runtime() {
        let dir = TempDir::new().unwrap();
        let result = LicenseManager::new(test_config(&dir));
        assert!(matches!(result, Err(LicensorError::RuntimeUnavailable(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = LicensorConfig::new("test-app", "");
        assert!(matches!(
            LicenseManager::new(config),
            Err(LicensorError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_catalog_entries_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert!(matches!(
            manager.register_feature(Feature::new("shortcuts")),
            Err(LicensorError::DuplicateIdentifier { kind: "feature", .. })
        ));
        assert!(matches!(
            manager.register_product(Product::new("bundle.pro", "Pro", ["shortcuts"])),
            Err(LicensorError::DuplicateIdentifier { kind: "product", .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_provider_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager
            .add_provider(Provider::new("enterprise", "Enterprise", EnterpriseProvider::new(["bundle.pro"])))
            .unwrap();
        let result = manager.add_provider(Provider::new(
            "enterprise",
            "Enterprise",
            EnterpriseProvider::new(["bundle.pro"]),
        ));
        assert!(matches!(
            result,
            Err(LicensorError::DuplicateIdentifier { kind: "provider", .. })
        ));
    }

    #[tokio::test]
    async fn test_second_qa_provider_conflicts() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let qa = |id: &str| Provider::new(id, "QA", QaProvider::new(["bundle.pro"], Arc::new(|| true)));

        manager.add_provider(qa("qa.one")).unwrap();
        assert!(matches!(
            manager.add_provider(qa("qa.two")),
            Err(LicensorError::ProviderConflict(_))
        ));
        assert!(manager.provider("qa.two").is_none());
    }

    #[tokio::test]
    async fn test_resolved_feature_and_product() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager
            .add_provider(Provider::new("enterprise", "Enterprise", EnterpriseProvider::new(["bundle.pro"])))
            .unwrap();

        manager
            .perform_after_currently_pending_refreshes(|manager| {
                let feature = manager.feature("shortcuts").unwrap();
                assert_eq!(feature.products.len(), 1);
                assert_eq!(feature.entitlements.len(), 1);
                assert_eq!(feature.entitlements[0].license_type, LicenseType::None);

                let product = manager.product("bundle.pro").unwrap();
                assert_eq!(product.features.len(), 2);
                assert_eq!(product.entitlements.len(), 1);

                assert!(manager.feature("unknown").is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_remove_unknown_provider() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert_eq!(
            manager.remove_provider("nope").await,
            Err(LicensorError::UnknownProvider("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_unknown_while_starting() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let env = Environment::new();
        manager
            .add_provider(Provider::new("enterprise", "Enterprise", EnterpriseProvider::new(Vec::<&str>::new())))
            .unwrap();

        // The start task has not run yet on the current-thread runtime
        assert_eq!(
            manager.authorization_status_for_feature("shortcuts", &env),
            AuthorizationStatus::Unknown
        );
        let status = manager
            .perform_after_currently_pending_refreshes(|m| {
                m.authorization_status_for_feature("shortcuts", &env)
            })
            .await;
        assert_eq!(status, AuthorizationStatus::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_expiry_reaches_observer_without_provider_event() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        ));
        let manager = LicenseManager::new_with_clock(test_config(&dir), clock.clone()).unwrap();
        manager.register_feature(Feature::new("shortcuts")).unwrap();
        manager
            .register_product(Product::new("bundle.pro", "Pro", ["shortcuts"]))
            .unwrap();
        manager
            .add_provider(Provider::new(
                "trial.pro",
                "Pro Trial",
                TrialProvider::new("bundle.pro", LicenseDuration::days(14)),
            ))
            .unwrap();
        manager.perform_after_currently_pending_refreshes(|_| ()).await;
        let offer = manager.offers_for_feature("shortcuts")[0].clone();
        offer.commit(CommitOptions::new()).await.unwrap();
        manager.perform_after_currently_pending_refreshes(|_| ()).await;

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);
        let env = Arc::new(Environment::new());
        let owner = Arc::new(());
        let _observer = manager.observe_products(
            ["bundle.pro"],
            ["shortcuts"],
            &env,
            &owner,
            move |_, _, status| seen.lock().unwrap().push(status),
        );
        manager.perform_after_currently_pending_refreshes(|_| ()).await;
        assert_eq!(*statuses.lock().unwrap(), vec![AuthorizationStatus::Granted]);

        let trial_length = chrono::Duration::days(14) + chrono::Duration::seconds(1);
        clock.advance(trial_length);
        tokio::time::advance(trial_length.to_std().unwrap() + std::time::Duration::from_secs(1))
            .await;
        manager.perform_after_currently_pending_refreshes(|_| ()).await;

        assert_eq!(
            *statuses.lock().unwrap(),
            vec![AuthorizationStatus::Granted, AuthorizationStatus::Expired]
        );
    }
}
