//! Live subscriptions to authorization status and offers.
//!
//! An observer watches a set of products and features in one environment.
//! It holds its environment and its owner weakly: once either is dropped the
//! observer goes quiet and the manager forgets it at the next delivery.
//! Handlers only fire when the combined status or the offer set changed.

use crate::catalog::{Catalog, FeatureId, ProductId};
use crate::entitlement::AuthorizationStatus;
use crate::environment::Environment;
use crate::evaluation::EvaluationContext;
use crate::offer::{Offer, OfferSignature};
use crate::policy::access::combine_watch_set;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Called with the observer, whether this is the initial report, and the combined status.
pub type StatusHandler = Box<dyn Fn(&Observer, bool, AuthorizationStatus) + Send + Sync>;

/// Called with the observer and the offers for its watched products.
pub type OffersHandler = Box<dyn Fn(&Observer, &[Arc<Offer>]) + Send + Sync>;

/// Parameters of an observation.
pub struct ObservationRequest {
    products: Vec<ProductId>,
    features: Vec<FeatureId>,
    environment: Weak<Environment>,
    owner: Option<Weak<dyn Any + Send + Sync>>,
    status_handler: Option<StatusHandler>,
    offers_handler: Option<OffersHandler>,
}

impl ObservationRequest {
    /// Observe in `environment`. The request keeps only a weak reference.
    pub fn new(environment: &Arc<Environment>) -> Self {
        Self {
            products: Vec::new(),
            features: Vec::new(),
            environment: Arc::downgrade(environment),
            owner: None,
            status_handler: None,
            offers_handler: None,
        }
    }

    /// Watch products.
    pub fn products<I, P>(mut self, products: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProductId>,
    {
        self.products.extend(products.into_iter().map(Into::into));
        self
    }

    /// Watch features.
    pub fn features<I, F>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FeatureId>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    /// Tie the observer's lifetime to `owner`.
    pub fn owned_by<O: Any + Send + Sync>(mut self, owner: &Arc<O>) -> Self {
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(owner) as Weak<dyn Any + Send + Sync>;
        self.owner = Some(weak);
        self
    }

    /// Set the status handler.
    pub fn on_status<H>(mut self, handler: H) -> Self
    where
        H: Fn(&Observer, bool, AuthorizationStatus) + Send + Sync + 'static,
    {
        self.status_handler = Some(Box::new(handler));
        self
    }

    /// Set the offers handler.
    pub fn on_offers<H>(mut self, handler: H) -> Self
    where
        H: Fn(&Observer, &[Arc<Offer>]) + Send + Sync + 'static,
    {
        self.offers_handler = Some(Box::new(handler));
        self
    }
}

#[derive(Debug, Default)]
struct LastReport {
    status: Option<AuthorizationStatus>,
    offers: Option<Vec<OfferSignature>>,
}

/// A live observation registered with a manager.
pub struct Observer {
    id: u64,
    products: BTreeSet<ProductId>,
    features: BTreeSet<FeatureId>,
    environment: Weak<Environment>,
    owner: Option<Weak<dyn Any + Send + Sync>>,
    active: AtomicBool,
    last: Mutex<LastReport>,
    status_handler: Option<StatusHandler>,
    offers_handler: Option<OffersHandler>,
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("products", &self.products)
            .field("features", &self.features)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Observer {
    pub(crate) fn new(id: u64, request: ObservationRequest) -> Self {
        Self {
            id,
            products: request.products.into_iter().collect(),
            features: request.features.into_iter().collect(),
            environment: request.environment,
            owner: request.owner,
            active: AtomicBool::new(true),
            last: Mutex::new(LastReport::default()),
            status_handler: request.status_handler,
            offers_handler: request.offers_handler,
        }
    }

    /// Identifier within the manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Watched products.
    pub fn products(&self) -> &BTreeSet<ProductId> {
        &self.products
    }

    /// Watched features.
    pub fn features(&self) -> &BTreeSet<FeatureId> {
        &self.features
    }

    /// The environment, if still alive.
    pub fn environment(&self) -> Option<Arc<Environment>> {
        self.environment.upgrade()
    }

    /// Not stopped, and both owner and environment are alive.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            && self.environment.strong_count() > 0
            && self.owner.as_ref().map_or(true, |owner| owner.strong_count() > 0)
    }

    /// The last status delivered.
    pub fn last_status(&self) -> Option<AuthorizationStatus> {
        self.lock_last().status
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Watched products plus every product containing a watched feature.
    pub(crate) fn watched_products(&self, catalog: &Catalog) -> BTreeSet<ProductId> {
        let mut watched = self.products.clone();
        for feature in &self.features {
            watched.extend(
                catalog
                    .products_containing(feature.as_str())
                    .map(|p| p.identifier.clone()),
            );
        }
        watched
    }

    /// Whether a change to `products` can affect this observer.
    pub(crate) fn is_affected_by(&self, catalog: &Catalog, products: &BTreeSet<ProductId>) -> bool {
        !self.watched_products(catalog).is_disjoint(products)
    }

    /// Evaluate and deliver changes. Returns false once the observer is dead.
    ///
    /// The status handler always fires on the initial evaluation; afterwards
    /// handlers only fire on change. Liveness is rechecked right before each
    /// callback.
    pub(crate) fn evaluate(&self, context: &EvaluationContext, is_initial: bool) -> bool {
        let Some(environment) = self.environment.upgrade() else {
            return false;
        };
        if !self.is_active() {
            return false;
        }

        let status = combine_watch_set(
            self.products
                .iter()
                .map(|p| context.status_for_product(p.as_str(), &environment))
                .chain(
                    self.features
                        .iter()
                        .map(|f| context.status_for_feature(f.as_str(), &environment)),
                ),
        );
        let offers = context.offers_for_products(&self.watched_products(context.catalog()));
        let signature: Vec<OfferSignature> = offers
            .iter()
            .map(|offer| OfferSignature {
                identifier: offer.identifier.clone(),
                state: offer.state_in_environment(&environment, context),
            })
            .collect();

        let (status_changed, offers_changed) = {
            let mut last = self.lock_last();
            let status_changed = last.status != Some(status);
            let offers_changed = last.offers.as_ref() != Some(&signature);
            last.status = Some(status);
            last.offers = Some(signature);
            (status_changed, offers_changed)
        };

        if status_changed || is_initial {
            if !self.is_active() {
                return false;
            }
            if let Some(handler) = &self.status_handler {
                handler(self, is_initial, status);
            }
        }

        if offers_changed {
            if !self.is_active() {
                return false;
            }
            if let Some(handler) = &self.offers_handler {
                handler(self, &offers);
            }
        }

        true
    }

    fn lock_last(&self) -> std::sync::MutexGuard<'_, LastReport> {
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Feature, Product};
    use crate::entitlement::{Entitlement, LicenseType};
    use crate::provider::ProviderSnapshot;
    use chrono::{TimeZone, Utc};

    fn catalog() -> Arc<Catalog> {
        let mut catalog = Catalog::default();
        let feature = Feature::new("f1");
        catalog
            .features
            .insert(feature.identifier.clone(), Arc::new(feature));
        let product = Product::new("p1", "Product 1", ["f1"]);
        catalog
            .products
            .insert(product.identifier.clone(), Arc::new(product));
        Arc::new(catalog)
    }

    fn context(entitlements: Vec<Entitlement>) -> EvaluationContext {
        let snapshot = ProviderSnapshot::from_parts(
            entitlements.into_iter().map(Arc::new).collect(),
            Vec::new(),
            Vec::new(),
        );
        EvaluationContext::new(
            catalog(),
            vec![Arc::new(snapshot)],
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
            false,
        )
    }

    fn recording_observer(
        environment: &Arc<Environment>,
    ) -> (Observer, Arc<Mutex<Vec<(bool, AuthorizationStatus)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let request = ObservationRequest::new(environment)
            .features(["f1"])
            .on_status(move |_, initial, status| sink.lock().unwrap().push((initial, status)));
        (Observer::new(1, request), calls)
    }

    #[test]
    fn test_fires_only_on_change() {
        let env = Arc::new(Environment::new());
        let (observer, calls) = recording_observer(&env);

        assert!(observer.evaluate(&context(vec![]), true));
        assert!(observer.evaluate(&context(vec![]), false));
        let granted = vec![Entitlement::new("enterprise", "p1", LicenseType::None)];
        assert!(observer.evaluate(&context(granted.clone()), false));
        assert!(observer.evaluate(&context(granted), false));

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                (true, AuthorizationStatus::Denied),
                (false, AuthorizationStatus::Granted)
            ]
        );
        assert_eq!(observer.last_status(), Some(AuthorizationStatus::Granted));
    }

    #[test]
    fn test_dead_environment_stops_delivery() {
        let env = Arc::new(Environment::new());
        let (observer, calls) = recording_observer(&env);
        drop(env);

        assert!(!observer.evaluate(&context(vec![]), true));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dead_owner_stops_delivery() {
        let env = Arc::new(Environment::new());
        let owner = Arc::new(String::from("view controller"));
        let request = ObservationRequest::new(&env)
            .products(["p1"])
            .owned_by(&owner)
            .on_status(|_, _, _| panic!("owner is gone"));
        let observer = Observer::new(7, request);
        drop(owner);

        assert!(!observer.is_active());
        assert!(!observer.evaluate(&context(vec![]), true));
    }

    #[test]
    fn test_least_favorable_across_watch_set() {
        let env = Arc::new(Environment::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let request = ObservationRequest::new(&env)
            .products(["p1", "unregistered"])
            .on_status(move |_, _, status| sink.lock().unwrap().push(status));
        let observer = Observer::new(2, request);

        observer.evaluate(
            &context(vec![Entitlement::new("enterprise", "p1", LicenseType::None)]),
            true,
        );
        assert_eq!(*calls.lock().unwrap(), vec![AuthorizationStatus::Denied]);
    }

    #[test]
    fn test_watched_products_expand_features() {
        let env = Arc::new(Environment::new());
        let (observer, _) = recording_observer(&env);
        let watched = observer.watched_products(&catalog());
        assert!(watched.contains("p1"));
        assert!(observer.is_affected_by(&catalog(), &watched));
    }
}
