//! Point-in-time view used to answer authorization queries.
//!
//! An [`EvaluationContext`] pins the catalog, every provider's published
//! snapshot and the current time, so that all answers within one evaluation
//! agree with each other even while providers keep publishing.

use crate::catalog::{Catalog, OfferId, ProductId};
use crate::entitlement::{AuthorizationStatus, Entitlement};
use crate::environment::Environment;
use crate::offer::{Offer, OfferState};
use crate::policy::access::combine_grant_paths;
use crate::provider::ProviderSnapshot;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Catalog, snapshots and time for one round of evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    catalog: Arc<Catalog>,
    snapshots: Vec<Arc<ProviderSnapshot>>,
    now: DateTime<Utc>,
    pending: bool,
}

impl EvaluationContext {
    /// Create a context.
    ///
    /// `pending` is true while some provider has not finished its first load;
    /// identifiers without entitlements are then reported as unknown.
    pub fn new(
        catalog: Arc<Catalog>,
        snapshots: Vec<Arc<ProviderSnapshot>>,
        now: DateTime<Utc>,
        pending: bool,
    ) -> Self {
        Self {
            catalog,
            snapshots,
            now,
            pending,
        }
    }

    /// Evaluation time.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Whether some provider is still starting.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// The catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// All entitlements, in provider order.
    pub fn entitlements(&self) -> impl Iterator<Item = &Arc<Entitlement>> {
        self.snapshots.iter().flat_map(|s| s.entitlements.iter())
    }

    /// All offers, in provider order.
    pub fn offers(&self) -> impl Iterator<Item = &Arc<Offer>> {
        self.snapshots.iter().flat_map(|s| s.offers.iter())
    }

    fn entitlements_of<'a>(
        &'a self,
        product: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Entitlement>> + 'a {
        self.entitlements()
            .filter(move |e| e.product_id.as_str() == product)
    }

    /// Entitlements targeting the product itself.
    pub fn entitlements_for_product(&self, product: &str) -> Vec<Arc<Entitlement>> {
        self.entitlements_of(product).cloned().collect()
    }

    /// The product's own entitlements followed by those of every product
    /// sharing one of its features, without duplicates.
    pub fn entitlements_covering_product(&self, product: &str) -> Vec<Arc<Entitlement>> {
        let mut related: BTreeSet<&str> = BTreeSet::new();
        if let Some(catalog_product) = self.catalog.product(product) {
            for feature in &catalog_product.contents {
                related.extend(
                    self.catalog
                        .products_containing(feature.as_str())
                        .map(|p| p.identifier.as_str()),
                );
            }
        }
        related.remove(product);

        self.entitlements_of(product)
            .chain(
                self.entitlements()
                    .filter(|e| related.contains(e.product_id.as_str())),
            )
            .cloned()
            .collect()
    }

    /// Entitlements targeting any product that contains the feature.
    pub fn entitlements_for_feature(&self, feature: &str) -> Vec<Arc<Entitlement>> {
        let products: BTreeSet<&str> = self
            .catalog
            .products_containing(feature)
            .map(|p| p.identifier.as_str())
            .collect();
        self.entitlements()
            .filter(|e| products.contains(e.product_id.as_str()))
            .cloned()
            .collect()
    }

    /// Offers targeting any of the products, in provider order.
    pub fn offers_for_products(&self, products: &BTreeSet<ProductId>) -> Vec<Arc<Offer>> {
        self.offers()
            .filter(|o| products.contains(&o.product_id))
            .cloned()
            .collect()
    }

    /// Look up an offer by identifier.
    pub fn offer(&self, identifier: &OfferId) -> Option<&Arc<Offer>> {
        self.offers().find(|o| &o.identifier == identifier)
    }

    /// Authorization status of a product. Unregistered products are denied.
    ///
    /// A product is granted by an entitlement of its own or when every
    /// feature it contains is granted through some product. Otherwise its
    /// own entitlements decide between expired, unknown and denied.
    pub fn status_for_product(&self, product: &str, environment: &Environment) -> AuthorizationStatus {
        if self.catalog.product(product).is_none() {
            return AuthorizationStatus::Denied;
        }
        if self.product_authorized_excluding(product, environment, None) {
            return AuthorizationStatus::Granted;
        }
        combine_grant_paths(
            self.entitlements_of(product)
                .map(|e| e.authorization_status(environment, self.now)),
            self.pending,
        )
    }

    /// Authorization status of a feature across every product containing it.
    /// Unregistered features are denied.
    pub fn status_for_feature(&self, feature: &str, environment: &Environment) -> AuthorizationStatus {
        if self.catalog.feature(feature).is_none() {
            return AuthorizationStatus::Denied;
        }
        combine_grant_paths(
            self.entitlements_for_feature(feature)
                .iter()
                .map(|e| e.authorization_status(environment, self.now)),
            self.pending,
        )
    }

    /// Effective state of an offer in the environment.
    pub fn offer_state(&self, identifier: &OfferId, environment: &Environment) -> Option<OfferState> {
        self.offer(identifier)
            .map(|offer| offer.state_in_environment(environment, self))
    }

    /// Whether the product is licensed without counting entitlements derived
    /// from `excluded`.
    ///
    /// A product counts as licensed when it has a granted entitlement of its
    /// own, or when it bundles features and each of them is granted through
    /// some product.
    pub(crate) fn product_authorized_excluding(
        &self,
        product: &str,
        environment: &Environment,
        excluded: Option<&Offer>,
    ) -> bool {
        let grants = |e: &Arc<Entitlement>| {
            excluded.map_or(true, |offer| !offer.derived(e))
                && e.authorization_status(environment, self.now) == AuthorizationStatus::Granted
        };

        if self.entitlements_of(product).any(grants) {
            return true;
        }

        let Some(catalog_product) = self.catalog.product(product) else {
            return false;
        };
        !catalog_product.contents.is_empty()
            && catalog_product.contents.iter().all(|feature| {
                self.catalog
                    .products_containing(feature.as_str())
                    .any(|other| self.entitlements_of(other.identifier.as_str()).any(grants))
            })
    }
}
