//! Features: the capabilities an application gates.

use crate::catalog::{FeatureId, Product};
use crate::entitlement::{AuthorizationStatus, Entitlement};
use crate::environment::Environment;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A gated capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    /// Unique key.
    pub identifier: FeatureId,

    /// Display name.
    pub localized_name: Option<String>,

    /// Display description.
    pub localized_description: Option<String>,
}

impl Feature {
    /// Create a feature without display strings.
    pub fn new(identifier: impl Into<FeatureId>) -> Self {
        Self {
            identifier: identifier.into(),
            localized_name: None,
            localized_description: None,
        }
    }

    /// Attach display strings.
    pub fn named(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.localized_name = Some(name.into());
        self.localized_description = Some(description.into());
        self
    }
}

/// A feature together with the data derived from the current provider set.
///
/// Produced by [`LicenseManager::feature`](crate::LicenseManager::feature);
/// it reflects the snapshots published at the time of the call.
#[derive(Debug, Clone)]
pub struct ResolvedFeature {
    /// The catalog entry.
    pub feature: Arc<Feature>,

    /// Products whose contents include this feature.
    pub products: Vec<Arc<Product>>,

    /// Entitlements targeting any of those products.
    pub entitlements: Vec<Arc<Entitlement>>,
}

impl ResolvedFeature {
    /// True iff at least one entitlement is valid, unexpired and applicable.
    pub fn access_allowed(&self, environment: &Environment, now: DateTime<Utc>) -> bool {
        self.entitlements
            .iter()
            .any(|e| e.authorization_status(environment, now) == AuthorizationStatus::Granted)
    }
}
