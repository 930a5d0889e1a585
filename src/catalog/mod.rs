//! Feature and product catalog.
//!
//! Features are capabilities ("document-scanner"); products bundle features
//! ("bundle.pro"). Both are static catalog data registered once with the
//! manager. Entitlements and offers always target products.

pub mod feature;
pub mod product;

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from its raw string value.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// The raw string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

identifier!(
    /// Unique key of a [`Feature`](feature::Feature).
    FeatureId
);
identifier!(
    /// Unique key of a [`Product`](product::Product).
    ProductId
);
identifier!(
    /// Unique key of a [`Provider`](crate::provider::Provider).
    ProviderId
);
identifier!(
    /// Unique key of an [`Offer`](crate::offer::Offer).
    OfferId
);

pub use feature::{Feature, ResolvedFeature};
pub use product::{Product, ResolvedProduct};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Registered features and products.
///
/// Cloned copy-on-write by the manager so evaluation snapshots stay cheap.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub(crate) features: BTreeMap<FeatureId, Arc<Feature>>,
    pub(crate) products: BTreeMap<ProductId, Arc<Product>>,
}

impl Catalog {
    /// Look up a feature.
    pub fn feature(&self, id: &str) -> Option<&Arc<Feature>> {
        self.features.get(id)
    }

    /// Look up a product.
    pub fn product(&self, id: &str) -> Option<&Arc<Product>> {
        self.products.get(id)
    }

    /// All registered features, ordered by identifier.
    pub fn features(&self) -> impl Iterator<Item = &Arc<Feature>> {
        self.features.values()
    }

    /// All registered products, ordered by identifier.
    pub fn products(&self) -> impl Iterator<Item = &Arc<Product>> {
        self.products.values()
    }

    /// Products whose contents include the feature.
    pub fn products_containing<'a>(
        &'a self,
        feature: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Product>> + 'a {
        self.products
            .values()
            .filter(move |product| product.contains(feature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_display_and_borrow() {
        let id = ProductId::new("bundle.pro");
        assert_eq!(id.to_string(), "bundle.pro");

        let mut map = BTreeMap::new();
        map.insert(id.clone(), 1);
        assert_eq!(map.get("bundle.pro"), Some(&1));
    }

    #[test]
    fn test_identifier_serializes_transparently() {
        let id = FeatureId::from("document-scanner");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"document-scanner\"");
    }

    #[test]
    fn test_products_containing() {
        let mut catalog = Catalog::default();
        for product in [
            Product::new("single.document-scanner", "Document Scanner", ["document-scanner"]),
            Product::new("bundle.pro", "Pro Features", ["document-scanner", "shortcuts"]),
            Product::new("single.shortcuts", "Shortcuts", ["shortcuts"]),
        ] {
            catalog
                .products
                .insert(product.identifier.clone(), Arc::new(product));
        }

        let ids: Vec<_> = catalog
            .products_containing("document-scanner")
            .map(|p| p.identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["bundle.pro", "single.document-scanner"]);
    }
}
