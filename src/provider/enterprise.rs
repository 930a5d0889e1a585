//! Static unlocks: enterprise deployments and EMM builds.

use crate::catalog::ProductId;
use crate::entitlement::{Entitlement, LicenseType};
use crate::policy::applicability::ApplicabilityRule;
use crate::provider::{Provider, ProviderContent};
use std::sync::Arc;

/// Unconditionally unlocks a fixed product list.
#[derive(Debug, Clone)]
pub struct EnterpriseProvider {
    products: Vec<ProductId>,
    applicability: Option<ApplicabilityRule>,
}

impl EnterpriseProvider {
    /// Unlock the products everywhere.
    pub fn new<I, P>(products: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProductId>,
    {
        Self {
            products: products.into_iter().map(Into::into).collect(),
            applicability: None,
        }
    }

    /// Only unlock in environments matching the rule (e.g. the company's servers).
    pub fn applicable_when(mut self, rule: ApplicabilityRule) -> Self {
        self.applicability = Some(rule);
        self
    }

    /// The unlocked products.
    pub fn products(&self) -> &[ProductId] {
        &self.products
    }

    pub(crate) fn load(&self, provider: &Provider) -> ProviderContent {
        ProviderContent {
            entitlements: unlock_entitlements(provider, &self.products, self.applicability.as_ref()),
            ..ProviderContent::default()
        }
    }
}

/// Unlocks a product list when the running build is the EMM build.
#[derive(Debug, Clone)]
pub struct EmmProvider {
    products: Vec<ProductId>,
    is_emm_build: bool,
}

impl EmmProvider {
    /// Unlock `products` if `is_emm_build` is set.
    pub fn new<I, P>(products: I, is_emm_build: bool) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProductId>,
    {
        Self {
            products: products.into_iter().map(Into::into).collect(),
            is_emm_build,
        }
    }

    /// Whether this is the EMM build.
    pub fn is_emm_build(&self) -> bool {
        self.is_emm_build
    }

    pub(crate) fn load(&self, provider: &Provider) -> ProviderContent {
        if !self.is_emm_build {
            return ProviderContent::default();
        }
        ProviderContent {
            entitlements: unlock_entitlements(provider, &self.products, None),
            ..ProviderContent::default()
        }
    }
}

pub(crate) fn unlock_entitlements(
    provider: &Provider,
    products: &[ProductId],
    applicability: Option<&ApplicabilityRule>,
) -> Vec<Arc<Entitlement>> {
    products
        .iter()
        .map(|product| {
            let entitlement = Entitlement::new(provider.id().clone(), product.clone(), LicenseType::None)
                .with_identifier(format!("{}:{}", provider.id(), product));
            Arc::new(match applicability {
                Some(rule) => entitlement.applicable_when(rule.clone()),
                None => entitlement,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::entitlement::AuthorizationStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn test_enterprise_unlocks_products() {
        let provider = Provider::new(
            "enterprise",
            "Enterprise",
            EnterpriseProvider::new(["bundle.pro", "single.shortcuts"]),
        );
        provider.start_providing().await.unwrap();

        let snapshot = provider.snapshot();
        let products: Vec<_> = snapshot
            .entitlements
            .iter()
            .map(|e| e.product_id.as_str())
            .collect();
        assert_eq!(products, vec!["bundle.pro", "single.shortcuts"]);
        assert!(snapshot.offers.is_empty());
    }

    #[tokio::test]
    async fn test_enterprise_applicability() {
        let provider = Provider::new(
            "enterprise",
            "Enterprise",
            EnterpriseProvider::new(["bundle.pro"])
                .applicable_when(ApplicabilityRule::host_suffix(".corp.example.com")),
        );
        provider.start_providing().await.unwrap();

        let entitlement = provider.snapshot().entitlements[0].clone();
        let inside = Environment::new().with_hostname("files.corp.example.com");
        let outside = Environment::new().with_hostname("demo.owncloud.com");
        assert_eq!(
            entitlement.authorization_status(&inside, Utc::now()),
            AuthorizationStatus::Granted
        );
        assert_eq!(
            entitlement.authorization_status(&outside, Utc::now()),
            AuthorizationStatus::Denied
        );
    }

    #[tokio::test]
    async fn test_emm_only_unlocks_emm_build() {
        let regular = Provider::new("emm", "EMM", EmmProvider::new(["bundle.pro"], false));
        regular.start_providing().await.unwrap();
        assert!(regular.snapshot().entitlements.is_empty());

        let emm = Provider::new("emm", "EMM", EmmProvider::new(["bundle.pro"], true));
        emm.start_providing().await.unwrap();
        assert_eq!(emm.snapshot().entitlements.len(), 1);
    }
}
