//! QA override: unlocks products when a debug switch is on.

use crate::catalog::ProductId;
use crate::provider::enterprise::unlock_entitlements;
use crate::provider::{Provider, ProviderContent};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Decides whether the QA unlock is active.
pub trait QaUnlockDelegate: Send + Sync {
    /// True to unlock the configured products.
    fn unlocks(&self) -> bool;
}

impl<F> QaUnlockDelegate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn unlocks(&self) -> bool {
        self()
    }
}

/// Unlocks a product list while its delegate says so.
///
/// Only the first QA provider added to a manager is accepted.
pub struct QaProvider {
    products: Vec<ProductId>,
    delegate: Arc<dyn QaUnlockDelegate>,
}

impl fmt::Debug for QaProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QaProvider")
            .field("products", &self.products)
            .finish_non_exhaustive()
    }
}

impl QaProvider {
    /// Unlock `products` whenever `delegate` returns true.
    pub fn new<I, P>(products: I, delegate: Arc<dyn QaUnlockDelegate>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProductId>,
    {
        Self {
            products: products.into_iter().map(Into::into).collect(),
            delegate,
        }
    }

    pub(crate) fn load(&self, provider: &Provider) -> ProviderContent {
        let unlocked = self.delegate.unlocks();
        debug!(provider = %provider.id(), unlocked, "QA unlock evaluated");
        if !unlocked {
            return ProviderContent::default();
        }
        ProviderContent {
            entitlements: unlock_entitlements(provider, &self.products, None),
            ..ProviderContent::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_qa_follows_delegate_on_refresh() {
        let switch = Arc::new(AtomicBool::new(false));
        let flag = switch.clone();
        let provider = Provider::new(
            "qa",
            "QA",
            QaProvider::new(
                ["bundle.pro"],
                Arc::new(move || flag.load(Ordering::SeqCst)),
            ),
        );

        provider.start_providing().await.unwrap();
        assert!(provider.snapshot().entitlements.is_empty());

        switch.store(true, Ordering::SeqCst);
        provider.refresh().await.unwrap();
        assert_eq!(provider.snapshot().entitlements.len(), 1);
        assert_eq!(provider.snapshot().generation, 1);
    }
}
