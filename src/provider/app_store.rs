//! App Store purchases.
//!
//! Entitlements are derived from the parsed receipt on every load:
//! - Cancelled purchases yield invalid entitlements
//! - Subscriptions use the record with the latest expiry
//! - Introductory-offer periods are reported as trials
//!
//! Each configured item is also published as an offer that is committed
//! through the [`PaymentQueue`].

use crate::catalog::ProductId;
use crate::duration::LicenseDuration;
use crate::entitlement::{Entitlement, LicenseType};
use crate::errors::CommitError;
use crate::offer::{CommitFuture, CommitHandler, CommitOptions, Offer, OfferState, Price};
use crate::protocol::receipt::{ReceiptRecord, ReceiptSupplier};
use crate::provider::{Provider, ProviderContent};
use crate::transaction::{sort_newest_first, Transaction};
use crate::LicensorError;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Payment processing collaborator.
pub trait PaymentQueue: Send + Sync {
    /// False when purchases are disabled on the device (parental controls, MDM).
    fn purchases_allowed(&self) -> bool;

    /// Localized price of a store item.
    fn price_for(&self, app_store_id: &str) -> Option<Price>;

    /// Run the purchase flow for a store item.
    fn submit(&self, app_store_id: &str, options: CommitOptions) -> CommitFuture;

    /// Restore previous purchases into the receipt.
    fn restore(&self) -> CommitFuture;
}

/// A store item and the product it licenses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStoreItem {
    /// App Store product identifier.
    pub app_store_id: String,
    /// Licensed product.
    pub product_id: ProductId,
    /// `Purchase` for non-consumables, `Subscription` for auto-renewables.
    pub license_type: LicenseType,
    /// Introductory trial of a subscription.
    pub trial_duration: Option<LicenseDuration>,
    /// Billing period of a subscription.
    pub subscription_term: Option<LicenseDuration>,
    /// Subscription group.
    pub group_id: Option<String>,
}

impl AppStoreItem {
    /// A one-time purchase.
    pub fn non_consumable(app_store_id: impl Into<String>, product: impl Into<ProductId>) -> Self {
        Self {
            app_store_id: app_store_id.into(),
            product_id: product.into(),
            license_type: LicenseType::Purchase,
            trial_duration: None,
            subscription_term: None,
            group_id: None,
        }
    }

    /// An auto-renewable subscription, optionally with an introductory trial.
    pub fn subscription(
        app_store_id: impl Into<String>,
        product: impl Into<ProductId>,
        term: LicenseDuration,
        trial: Option<LicenseDuration>,
    ) -> Self {
        Self {
            app_store_id: app_store_id.into(),
            product_id: product.into(),
            license_type: LicenseType::Subscription,
            trial_duration: trial,
            subscription_term: Some(term),
            group_id: None,
        }
    }

    /// Put the item in a subscription group.
    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// Provider backed by App Store receipts.
pub struct AppStoreProvider {
    items: Vec<AppStoreItem>,
    receipts: Arc<dyn ReceiptSupplier>,
    queue: Arc<dyn PaymentQueue>,
    offers: OnceCell<Vec<Arc<Offer>>>,
}

impl fmt::Debug for AppStoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppStoreProvider")
            .field("items", &self.items)
            .finish_non_exhaustive()
    }
}

impl AppStoreProvider {
    /// Create a provider for the given items.
    pub fn new(
        items: Vec<AppStoreItem>,
        receipts: Arc<dyn ReceiptSupplier>,
        queue: Arc<dyn PaymentQueue>,
    ) -> Self {
        Self {
            items,
            receipts,
            queue,
            offers: OnceCell::new(),
        }
    }

    /// Configured items.
    pub fn items(&self) -> &[AppStoreItem] {
        &self.items
    }

    /// Whether the device allows purchases.
    pub fn purchases_allowed(&self) -> bool {
        self.queue.purchases_allowed()
    }

    pub(crate) async fn restore(&self) -> Result<(), LicensorError> {
        self.queue.restore().await?;
        Ok(())
    }

    fn offers(&self, provider: &Arc<Provider>) -> &[Arc<Offer>] {
        self.offers.get_or_init(|| {
            self.items
                .iter()
                .map(|item| {
                    let handler = Arc::new(Purchase {
                        app_store_id: item.app_store_id.clone(),
                        queue: Arc::clone(&self.queue),
                        provider: Arc::downgrade(provider),
                    });
                    let mut offer = Offer::new(
                        format!("{}:{}", provider.id(), item.app_store_id),
                        provider.id().clone(),
                        item.product_id.clone(),
                        item.license_type,
                    )
                    .with_price(self.queue.price_for(&item.app_store_id))
                    .with_trial_duration(item.trial_duration)
                    .with_subscription_term(item.subscription_term)
                    .with_clock(provider.clock())
                    .with_commit_handler(handler);
                    if let Some(group) = &item.group_id {
                        offer = offer.in_group(group.clone());
                    }
                    Arc::new(offer)
                })
                .collect()
        })
    }

    pub(crate) async fn load(
        &self,
        provider: &Arc<Provider>,
    ) -> Result<ProviderContent, LicensorError> {
        let records = match self.receipts.in_app_purchases().await {
            Ok(records) => records,
            Err(e) => {
                warn!(provider = %provider.id(), error = %e, "Receipt unavailable, no purchases");
                Vec::new()
            }
        };

        let offers = self.offers(provider);
        let mut content = ProviderContent::default();

        for (item, offer) in self.items.iter().zip(offers) {
            let matching: Vec<&ReceiptRecord> = records
                .iter()
                .filter(|r| r.product_id == item.app_store_id)
                .collect();

            let entitlements: Vec<Entitlement> = match item.license_type {
                LicenseType::Subscription => {
                    subscription_entitlement(provider, item, offer, &matching)
                        .into_iter()
                        .collect()
                }
                _ => matching
                    .iter()
                    .map(|record| purchase_entitlement(provider, item, offer, record))
                    .collect(),
            };

            let state = if entitlements.iter().any(|e| e.valid) {
                OfferState::Committed
            } else {
                OfferState::Uncommitted
            };
            content.push_offer(Arc::clone(offer), state);

            content
                .entitlements
                .extend(entitlements.into_iter().map(Arc::new));
            content.transactions.extend(
                matching
                    .iter()
                    .map(|record| transaction(provider, item, record)),
            );
        }

        for record in &records {
            if !self.items.iter().any(|i| i.app_store_id == record.product_id) {
                debug!(
                    provider = %provider.id(),
                    app_store_id = %record.product_id,
                    "Receipt entry for unconfigured item ignored"
                );
            }
        }

        sort_newest_first(&mut content.transactions);
        Ok(content)
    }
}

fn record_identifier(record: &ReceiptRecord) -> String {
    record
        .original_transaction_id
        .clone()
        .unwrap_or_else(|| record.transaction_id.clone())
}

fn purchase_entitlement(
    provider: &Provider,
    item: &AppStoreItem,
    offer: &Offer,
    record: &ReceiptRecord,
) -> Entitlement {
    Entitlement::new(provider.id().clone(), item.product_id.clone(), LicenseType::Purchase)
        .with_identifier(record_identifier(record))
        .with_validity(record.cancellation_date.is_none())
        .derived_from(offer.identifier.clone())
}

/// One entitlement for the subscription period with the latest expiry.
///
/// Cancelled periods only count when nothing else is left, and then yield an
/// invalid entitlement.
fn subscription_entitlement(
    provider: &Provider,
    item: &AppStoreItem,
    offer: &Offer,
    records: &[&ReceiptRecord],
) -> Option<Entitlement> {
    let latest = |active: bool| {
        records
            .iter()
            .filter(|r| r.cancellation_date.is_none() == active)
            .max_by_key(|r| r.subscription_expiration_date)
            .copied()
    };
    let record = latest(true).or_else(|| latest(false))?;

    let license_type = if record.in_intro_offer_period {
        LicenseType::Trial
    } else {
        LicenseType::Subscription
    };
    let mut entitlement = Entitlement::new(provider.id().clone(), item.product_id.clone(), license_type)
        .with_identifier(record_identifier(record))
        .with_validity(record.cancellation_date.is_none())
        .derived_from(offer.identifier.clone());
    if let Some(expiry) = record.subscription_expiration_date {
        entitlement = entitlement.expiring_at(expiry);
    }
    Some(entitlement)
}

fn transaction(provider: &Provider, item: &AppStoreItem, record: &ReceiptRecord) -> Transaction {
    Transaction {
        provider_id: provider.id().clone(),
        identifier: record.transaction_id.clone(),
        product_id: Some(item.product_id.clone()),
        license_type: if record.in_intro_offer_period {
            LicenseType::Trial
        } else {
            item.license_type
        },
        quantity: record.quantity,
        date: record.purchase_date,
        end_date: record.subscription_expiration_date,
        cancellation_date: record.cancellation_date,
    }
}

/// Commits a store offer through the payment queue.
struct Purchase {
    app_store_id: String,
    queue: Arc<dyn PaymentQueue>,
    provider: Weak<Provider>,
}

impl CommitHandler for Purchase {
    fn commit(&self, _offer: Arc<Offer>, options: CommitOptions) -> CommitFuture {
        if !self.queue.purchases_allowed() {
            return Box::pin(async { Err(CommitError::PurchasesNotAllowed) });
        }

        let submission = self.queue.submit(&self.app_store_id, options);
        let provider = self.provider.clone();
        Box::pin(async move {
            submission.await?;
            if let Some(provider) = provider.upgrade() {
                provider
                    .refresh()
                    .await
                    .map_err(|e| CommitError::Failed(e.to_string()))?;
            }
            Ok(())
        })
    }
}
