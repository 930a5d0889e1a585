//! Offers: purchasable or claimable units and their state machine.
//!
//! An offer is what a user *can* obtain; an entitlement is what they *have*.
//! Providers report a stored state for each offer. The effective state shown
//! to the user also depends on the time window and on whether the product is
//! already licensed through some other path, so it is resolved per
//! environment by [`Offer::state_in_environment`].

use crate::catalog::{OfferId, ProductId, ProviderId};
use crate::clock::{Clock, SystemClock};
use crate::duration::LicenseDuration;
use crate::entitlement::{Entitlement, LicenseType};
use crate::environment::Environment;
use crate::errors::CommitError;
use crate::evaluation::EvaluationContext;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Effective state of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    /// Can be committed.
    Uncommitted,
    /// Outside its availability window or disabled.
    Unavailable,
    /// The product is already licensed by another path.
    Redundant,
    /// A commit is running.
    InProgress,
    /// Purchased or claimed.
    Committed,
    /// Committed, but the resulting entitlement has expired.
    Expired,
}

impl fmt::Display for OfferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OfferState::Uncommitted => "uncommitted",
            OfferState::Unavailable => "unavailable",
            OfferState::Redundant => "redundant",
            OfferState::InProgress => "in_progress",
            OfferState::Committed => "committed",
            OfferState::Expired => "expired",
        })
    }
}

/// Price of an offer in minor currency units (cents for EUR/USD).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    /// Amount in minor units.
    pub amount_minor: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Locale the price was localized for (e.g. "de_DE").
    pub locale: Option<String>,
}

impl Price {
    /// Create a price.
    pub fn new(amount_minor: i64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
            locale: None,
        }
    }

    /// Attach the locale.
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.amount_minor < 0 { "-" } else { "" };
        let abs = self.amount_minor.unsigned_abs();
        write!(f, "{}{}.{:02} {}", sign, abs / 100, abs % 100, self.currency)
    }
}

/// Open key/value options passed through to a commit handler.
pub type CommitOptions = BTreeMap<String, serde_json::Value>;

/// Future returned by commit side effects.
pub type CommitFuture = Pin<Box<dyn Future<Output = Result<(), CommitError>> + Send>>;

/// Performs the side effect of committing an offer (purchase, trial claim).
pub trait CommitHandler: Send + Sync {
    /// Run the commit flow for `offer`.
    fn commit(&self, offer: Arc<Offer>, options: CommitOptions) -> CommitFuture;
}

type StateListener = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct StoredState {
    reported: OfferState,
    in_progress: bool,
}

/// A purchasable or claimable unit for one product.
pub struct Offer {
    /// Unique key (unique across providers).
    pub identifier: OfferId,

    /// Provider that publishes this offer.
    pub provider_id: ProviderId,

    /// License obtained by committing.
    pub license_type: LicenseType,

    /// Product licensed by committing.
    pub product_id: ProductId,

    /// Offers sharing a group are alternatives (e.g. monthly vs yearly).
    pub group_id: Option<String>,

    /// Start of the availability window.
    pub available_from: Option<DateTime<Utc>>,

    /// End of the availability window.
    pub available_until: Option<DateTime<Utc>>,

    /// Raw availability flag.
    pub available: bool,

    /// Price, when known.
    pub price: Option<Price>,

    /// Length of the trial granted by this offer.
    pub trial_duration: Option<LicenseDuration>,

    /// Billing period of a subscription offer.
    pub subscription_term: Option<LicenseDuration>,

    /// Display title.
    pub localized_title: Option<String>,

    /// Display description.
    pub localized_description: Option<String>,

    state: Mutex<StoredState>,
    commit_handler: Option<Arc<dyn CommitHandler>>,
    clock: Arc<dyn Clock>,
    listener: OnceCell<StateListener>,
}

impl fmt::Debug for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Offer")
            .field("identifier", &self.identifier)
            .field("provider_id", &self.provider_id)
            .field("product_id", &self.product_id)
            .field("license_type", &self.license_type)
            .field("stored_state", &self.stored_state())
            .finish_non_exhaustive()
    }
}

impl Offer {
    /// An available, uncommitted offer without price or handler.
    pub fn new(
        identifier: impl Into<OfferId>,
        provider_id: impl Into<ProviderId>,
        product_id: impl Into<ProductId>,
        license_type: LicenseType,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            provider_id: provider_id.into(),
            license_type,
            product_id: product_id.into(),
            group_id: None,
            available_from: None,
            available_until: None,
            available: true,
            price: None,
            trial_duration: None,
            subscription_term: None,
            localized_title: None,
            localized_description: None,
            state: Mutex::new(StoredState {
                reported: OfferState::Uncommitted,
                in_progress: false,
            }),
            commit_handler: None,
            clock: Arc::new(SystemClock),
            listener: OnceCell::new(),
        }
    }

    /// Set the group.
    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Restrict availability to `[from, until]`; `None` leaves that side open.
    pub fn available_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.available_from = from;
        self.available_until = until;
        self
    }

    /// Set the raw availability flag.
    pub fn with_availability(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Set the price.
    pub fn with_price(mut self, price: Option<Price>) -> Self {
        self.price = price;
        self
    }

    /// Set the trial length.
    pub fn with_trial_duration(mut self, duration: Option<LicenseDuration>) -> Self {
        self.trial_duration = duration;
        self
    }

    /// Set the subscription term.
    pub fn with_subscription_term(mut self, term: Option<LicenseDuration>) -> Self {
        self.subscription_term = term;
        self
    }

    /// Set display strings.
    pub fn with_title(mut self, title: impl Into<String>, description: Option<String>) -> Self {
        self.localized_title = Some(title.into());
        self.localized_description = description;
        self
    }

    /// Set the initially reported state.
    pub fn with_state(mut self, state: OfferState) -> Self {
        self.state.get_mut().unwrap_or_else(|e| e.into_inner()).reported = state;
        self
    }

    /// Attach the handler that performs the commit side effect.
    pub fn with_commit_handler(mut self, handler: Arc<dyn CommitHandler>) -> Self {
        self.commit_handler = Some(handler);
        self
    }

    /// Use a specific clock for availability checks during commit.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether the raw flag and time window allow committing at `now`.
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        if !self.available {
            return false;
        }
        if self.available_from.is_some_and(|from| now < from) {
            return false;
        }
        if self.available_until.is_some_and(|until| now > until) {
            return false;
        }
        true
    }

    /// The stored state: in-progress while a commit runs, otherwise the provider-reported state.
    pub fn stored_state(&self) -> OfferState {
        let stored = self.lock_state();
        if stored.in_progress {
            OfferState::InProgress
        } else {
            stored.reported
        }
    }

    /// Record the state the provider derived from its latest data.
    ///
    /// Listeners are not notified; the provider publishes the state with
    /// the snapshot it belongs to.
    pub(crate) fn set_reported_state(&self, state: OfferState) {
        self.lock_state().reported = state;
    }

    /// Register the callback invoked after each stored state change.
    ///
    /// Only the first registration takes effect.
    pub(crate) fn on_state_change(&self, listener: impl Fn() + Send + Sync + 'static) {
        let _ = self.listener.set(Box::new(listener));
    }

    /// Resolve the effective state of this offer for `environment`.
    ///
    /// 1. disabled or outside the window: unavailable
    /// 2. commit running: in progress
    /// 3. product licensed by entitlements not derived from this offer: redundant
    /// 4. committed with an expired backing entitlement: expired
    /// 5. otherwise the stored state
    pub fn state_in_environment(
        &self,
        environment: &Environment,
        context: &EvaluationContext,
    ) -> OfferState {
        let now = context.now();
        if !self.is_available_at(now) {
            return OfferState::Unavailable;
        }

        let stored = self.stored_state();
        if stored == OfferState::InProgress {
            return OfferState::InProgress;
        }

        if context.product_authorized_excluding(self.product_id.as_str(), environment, Some(self)) {
            return OfferState::Redundant;
        }

        if stored == OfferState::Committed {
            let backing: Vec<_> = context
                .entitlements_for_product(self.product_id.as_str())
                .into_iter()
                .filter(|e| self.derived(e))
                .collect();
            if !backing.is_empty() && backing.iter().all(|e| e.is_expired_at(now)) {
                return OfferState::Expired;
            }
        }

        stored
    }

    /// Whether the entitlement was obtained through this offer.
    pub fn derived(&self, entitlement: &Entitlement) -> bool {
        entitlement.provider_id == self.provider_id
            && entitlement.offer_id.as_ref() == Some(&self.identifier)
    }

    /// Run the commit flow.
    ///
    /// The offer is in progress while the handler runs. On failure it
    /// reverts to uncommitted until the provider reports otherwise; on
    /// success the provider's next snapshot confirms the result.
    pub async fn commit(self: &Arc<Self>, options: CommitOptions) -> Result<(), CommitError> {
        let handler = self
            .commit_handler
            .clone()
            .ok_or(CommitError::NoCommitHandler)?;

        if !self.is_available_at(self.clock.now_utc()) {
            return Err(CommitError::Unavailable);
        }

        {
            let mut stored = self.lock_state();
            if stored.in_progress {
                return Err(CommitError::AlreadyInProgress);
            }
            stored.in_progress = true;
        }
        self.notify();
        info!(offer = %self.identifier, provider = %self.provider_id, "Offer commit started");

        let result = handler.commit(Arc::clone(self), options).await;

        {
            let mut stored = self.lock_state();
            stored.in_progress = false;
            if result.is_err() {
                stored.reported = OfferState::Uncommitted;
            }
        }
        self.notify();

        match &result {
            Ok(()) => info!(offer = %self.identifier, "Offer commit finished"),
            Err(e) => debug!(offer = %self.identifier, error = %e, "Offer commit failed"),
        }
        result
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoredState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        if let Some(listener) = self.listener.get() {
            listener();
        }
    }
}

/// Identity and effective state of an offer, for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OfferSignature {
    /// Offer identifier.
    pub identifier: OfferId,
    /// Effective or stored state.
    pub state: OfferState,
}
