//! Products: purchasable bundles of features.

use crate::catalog::{Feature, FeatureId, ProductId};
use crate::entitlement::Entitlement;
use std::sync::Arc;

/// A bundle of features that entitlements and offers refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    /// Unique key.
    pub identifier: ProductId,

    /// Display name.
    pub localized_name: String,

    /// Display description.
    pub localized_description: Option<String>,

    /// Contained features, in catalog order.
    pub contents: Vec<FeatureId>,
}

impl Product {
    /// Create a product bundling the given features.
    pub fn new<I, F>(identifier: impl Into<ProductId>, name: impl Into<String>, contents: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FeatureId>,
    {
        Self {
            identifier: identifier.into(),
            localized_name: name.into(),
            localized_description: None,
            contents: contents.into_iter().map(Into::into).collect(),
        }
    }

    /// Attach a display description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.localized_description = Some(description.into());
        self
    }

    /// Whether the product bundles the feature.
    pub fn contains(&self, feature: &str) -> bool {
        self.contents.iter().any(|f| f.as_str() == feature)
    }
}

/// A product together with its resolved features and current entitlements.
#[derive(Debug, Clone)]
pub struct ResolvedProduct {
    /// The catalog entry.
    pub product: Arc<Product>,

    /// Registered features listed in `contents`; unregistered ids are skipped.
    pub features: Vec<Arc<Feature>>,

    /// Entitlements of this product and of every product sharing one of its features.
    pub entitlements: Vec<Arc<Entitlement>>,
}
