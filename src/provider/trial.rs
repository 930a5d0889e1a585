//! Claimable time-boxed trials.
//!
//! The trial offer is committed by claiming it. The claim date is persisted
//! as a sealed [`StoredRecord`] so relaunching does not restart the trial;
//! a record that fails its integrity check yields an invalid entitlement.

use crate::cache::format::StoredRecord;
use crate::catalog::ProductId;
use crate::duration::LicenseDuration;
use crate::entitlement::{Entitlement, LicenseType};
use crate::errors::CommitError;
use crate::offer::{CommitFuture, CommitHandler, CommitOptions, Offer, OfferState};
use crate::provider::{Provider, ProviderContent, ProviderKind};
use crate::transaction::Transaction;
use crate::LicensorError;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};

/// Persisted claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TrialRecord {
    product: ProductId,
    started_at: DateTime<Utc>,
    duration: LicenseDuration,
}

enum ClaimStatus {
    Unclaimed,
    Claimed(DateTime<Utc>),
    Tampered,
}

/// A trial of one product for a fixed duration.
#[derive(Debug)]
pub struct TrialProvider {
    product: ProductId,
    duration: LicenseDuration,
    title: Option<String>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    offer: OnceCell<Arc<Offer>>,
}

impl TrialProvider {
    /// Trial of `product` lasting `duration` from the claim.
    pub fn new(product: impl Into<ProductId>, duration: LicenseDuration) -> Self {
        Self {
            product: product.into(),
            duration,
            title: None,
            started_at: Mutex::new(None),
            offer: OnceCell::new(),
        }
    }

    /// Display title of the trial offer.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Trial length.
    pub fn duration(&self) -> LicenseDuration {
        self.duration
    }

    fn offer(&self, provider: &Arc<Provider>) -> Arc<Offer> {
        Arc::clone(self.offer.get_or_init(|| {
            let mut offer = Offer::new(
                format!("{}:trial", provider.id()),
                provider.id().clone(),
                self.product.clone(),
                LicenseType::Trial,
            )
            .with_trial_duration(Some(self.duration))
            .with_clock(provider.clock())
            .with_commit_handler(Arc::new(ClaimTrial {
                provider: Arc::downgrade(provider),
            }));
            if let Some(title) = &self.title {
                offer = offer.with_title(title.clone(), None);
            }
            Arc::new(offer)
        }))
    }

    async fn claim_status(&self, provider: &Provider) -> Result<ClaimStatus, LicensorError> {
        let cached = *self.lock_started();
        if let Some(start) = cached {
            return Ok(ClaimStatus::Claimed(start));
        }

        let Some(store) = provider.store() else {
            return Ok(ClaimStatus::Unclaimed);
        };
        let Some(record) = store.load(provider.id().as_str()).await? else {
            return Ok(ClaimStatus::Unclaimed);
        };

        let clock = provider.clock();
        match record.open::<TrialRecord>(provider.id().as_str(), clock.as_ref()) {
            Ok(stored) if stored.product == self.product => {
                *self.lock_started() = Some(stored.started_at);
                Ok(ClaimStatus::Claimed(stored.started_at))
            }
            Ok(stored) => {
                warn!(
                    provider = %provider.id(),
                    stored_product = %stored.product,
                    "Stored trial belongs to another product, ignoring"
                );
                Ok(ClaimStatus::Unclaimed)
            }
            Err(LicensorError::StorageTampered) => {
                warn!(provider = %provider.id(), "Stored trial record failed integrity check");
                Ok(ClaimStatus::Tampered)
            }
            Err(e) => Err(e),
        }
    }

    /// Record the trial start, persisting it when storage is available.
    ///
    /// Claiming an already claimed trial returns the original start date.
    pub(crate) async fn claim(&self, provider: &Provider) -> Result<DateTime<Utc>, LicensorError> {
        match self.claim_status(provider).await? {
            ClaimStatus::Claimed(start) => return Ok(start),
            ClaimStatus::Tampered => return Err(LicensorError::StorageTampered),
            ClaimStatus::Unclaimed => {}
        }

        let clock = provider.clock();
        let started_at = clock.now_utc();
        if let Some(store) = provider.store() {
            let record = StoredRecord::seal(
                provider.id().as_str(),
                &TrialRecord {
                    product: self.product.clone(),
                    started_at,
                    duration: self.duration,
                },
                clock.as_ref(),
            )?;
            store.save(&record).await?;
        }

        *self.lock_started() = Some(started_at);
        info!(
            provider = %provider.id(),
            product = %self.product,
            duration = %self.duration,
            "Trial claimed"
        );
        Ok(started_at)
    }

    pub(crate) async fn load(
        &self,
        provider: &Arc<Provider>,
    ) -> Result<ProviderContent, LicensorError> {
        let offer = self.offer(provider);
        let mut content = ProviderContent::default();

        let state = match self.claim_status(provider).await? {
            ClaimStatus::Unclaimed => OfferState::Uncommitted,
            ClaimStatus::Claimed(started_at) => {
                let expiry = self.duration.after(started_at).ok_or_else(|| {
                    LicensorError::ProviderLoad {
                        provider: provider.id().to_string(),
                        reason: format!("trial end out of range for {}", self.duration),
                    }
                })?;
                content.entitlements.push(Arc::new(
                    Entitlement::new(provider.id().clone(), self.product.clone(), LicenseType::Trial)
                        .with_identifier(offer.identifier.to_string())
                        .expiring_at(expiry)
                        .derived_from(offer.identifier.clone()),
                ));
                content.transactions.push(Transaction {
                    provider_id: provider.id().clone(),
                    identifier: offer.identifier.to_string(),
                    product_id: Some(self.product.clone()),
                    license_type: LicenseType::Trial,
                    quantity: 1,
                    date: Some(started_at),
                    end_date: Some(expiry),
                    cancellation_date: None,
                });
                OfferState::Committed
            }
            ClaimStatus::Tampered => {
                content.entitlements.push(Arc::new(
                    Entitlement::new(provider.id().clone(), self.product.clone(), LicenseType::Trial)
                        .with_validity(false)
                        .derived_from(offer.identifier.clone()),
                ));
                OfferState::Committed
            }
        };

        content.push_offer(offer, state);
        Ok(content)
    }

    fn lock_started(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.started_at.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Commits a trial offer by claiming it.
struct ClaimTrial {
    provider: Weak<Provider>,
}

impl CommitHandler for ClaimTrial {
    fn commit(&self, _offer: Arc<Offer>, _options: CommitOptions) -> CommitFuture {
        let provider = self.provider.clone();
        Box::pin(async move {
            let provider = provider.upgrade().ok_or(CommitError::Unavailable)?;
            let ProviderKind::Trial(trial) = provider.kind() else {
                return Err(CommitError::NoCommitHandler);
            };
            trial
                .claim(&provider)
                .await
                .map_err(|e| CommitError::Failed(e.to_string()))?;
            provider
                .refresh()
                .await
                .map_err(|e| CommitError::Failed(e.to_string()))
        })
    }
}
