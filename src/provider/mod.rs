//! Entitlement providers.
//!
//! A [`Provider`] is one source of entitlement truth. Every provider shares
//! the same lifecycle shell:
//! - `stopped -> starting -> providing -> stopping -> stopped`
//! - Start and refresh run the variant's load; stop cancels in-flight loads
//! - Results are published as complete, immutable [`ProviderSnapshot`]s
//!
//! What is loaded depends on the [`ProviderKind`] variant.

pub mod app_store;
pub mod enterprise;
pub mod qa;
pub mod trial;

use crate::cache::file::ProviderStore;
use crate::catalog::{ProductId, ProviderId};
use crate::clock::{Clock, SystemClock};
use crate::entitlement::Entitlement;
use crate::offer::{Offer, OfferSignature, OfferState};
use crate::transaction::Transaction;
use crate::LicensorError;
use once_cell::sync::OnceCell;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

pub use app_store::{AppStoreItem, AppStoreProvider, PaymentQueue};
pub use enterprise::{EmmProvider, EnterpriseProvider};
pub use qa::{QaProvider, QaUnlockDelegate};
pub use trial::TrialProvider;

/// Lifecycle state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderState {
    /// Not providing data.
    Stopped,
    /// First load in progress.
    Starting,
    /// Data loaded and published.
    Providing,
    /// Shutting down.
    Stopping,
}

/// A provider's complete published data set.
#[derive(Debug, Clone, Default)]
pub struct ProviderSnapshot {
    /// Current entitlements.
    pub entitlements: Vec<Arc<Entitlement>>,

    /// Current offers.
    pub offers: Vec<Arc<Offer>>,

    /// Purchase history.
    pub transactions: Vec<Transaction>,

    /// Incremented on every published change.
    pub generation: u64,

    offer_signature: Vec<OfferSignature>,
}

impl ProviderSnapshot {
    /// Build a snapshot, capturing the offers' current stored states.
    pub fn from_parts(
        entitlements: Vec<Arc<Entitlement>>,
        offers: Vec<Arc<Offer>>,
        transactions: Vec<Transaction>,
    ) -> Self {
        let offer_signature = offers
            .iter()
            .map(|offer| OfferSignature {
                identifier: offer.identifier.clone(),
                state: offer.stored_state(),
            })
            .collect();

        Self {
            entitlements,
            offers,
            transactions,
            generation: 0,
            offer_signature,
        }
    }

    /// Products referenced by entitlements or offers.
    pub fn products(&self) -> BTreeSet<ProductId> {
        self.entitlements
            .iter()
            .map(|e| e.product_id.clone())
            .chain(self.offers.iter().map(|o| o.product_id.clone()))
            .collect()
    }

    /// True when the snapshot carries no data.
    pub fn is_empty(&self) -> bool {
        self.entitlements.is_empty() && self.offers.is_empty() && self.transactions.is_empty()
    }

    /// Equality ignoring the generation.
    pub fn same_content(&self, other: &ProviderSnapshot) -> bool {
        self.entitlements == other.entitlements
            && self.offer_signature == other.offer_signature
            && self.transactions == other.transactions
    }
}

/// What a variant's load produced.
///
/// Loads never touch offer state directly; `reported` is applied by
/// [`Provider::install`] together with the rest of the content.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProviderContent {
    pub(crate) entitlements: Vec<Arc<Entitlement>>,
    pub(crate) offers: Vec<Arc<Offer>>,
    pub(crate) transactions: Vec<Transaction>,
    reported: Vec<OfferState>,
}

impl ProviderContent {
    /// Add an offer with the state derived from this load.
    pub(crate) fn push_offer(&mut self, offer: Arc<Offer>, state: OfferState) {
        self.offers.push(offer);
        self.reported.push(state);
    }
}

/// Source-specific behavior of a provider.
pub enum ProviderKind {
    /// App Store receipts and in-app purchases.
    AppStore(AppStoreProvider),
    /// Static enterprise unlock.
    Enterprise(EnterpriseProvider),
    /// Unlock for EMM builds.
    Emm(EmmProvider),
    /// Claimable time-boxed trial.
    Trial(TrialProvider),
    /// QA override switch.
    Qa(QaProvider),
}

impl ProviderKind {
    /// Short variant name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::AppStore(_) => "app_store",
            ProviderKind::Enterprise(_) => "enterprise",
            ProviderKind::Emm(_) => "emm",
            ProviderKind::Trial(_) => "trial",
            ProviderKind::Qa(_) => "qa",
        }
    }

    async fn load(&self, provider: &Arc<Provider>) -> Result<ProviderContent, LicensorError> {
        match self {
            ProviderKind::AppStore(p) => p.load(provider).await,
            ProviderKind::Enterprise(p) => Ok(p.load(provider)),
            ProviderKind::Emm(p) => Ok(p.load(provider)),
            ProviderKind::Trial(p) => p.load(provider).await,
            ProviderKind::Qa(p) => Ok(p.load(provider)),
        }
    }
}

impl fmt::Debug for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<AppStoreProvider> for ProviderKind {
    fn from(p: AppStoreProvider) -> Self {
        ProviderKind::AppStore(p)
    }
}

impl From<EnterpriseProvider> for ProviderKind {
    fn from(p: EnterpriseProvider) -> Self {
        ProviderKind::Enterprise(p)
    }
}

impl From<EmmProvider> for ProviderKind {
    fn from(p: EmmProvider) -> Self {
        ProviderKind::Emm(p)
    }
}

impl From<TrialProvider> for ProviderKind {
    fn from(p: TrialProvider) -> Self {
        ProviderKind::Trial(p)
    }
}

impl From<QaProvider> for ProviderKind {
    fn from(p: QaProvider) -> Self {
        ProviderKind::Qa(p)
    }
}

static NEXT_CONTEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Services a provider gets from the manager it is added to.
#[derive(Clone)]
pub struct ProviderContext {
    /// Time source for expiry and trial dates.
    pub clock: Arc<dyn Clock>,
    /// Persistent storage; `None` keeps provider state in memory only.
    pub store: Option<ProviderStore>,
    owner: u64,
}

impl ProviderContext {
    /// Create a context. Clones share its identity; separately created
    /// contexts are distinct owners.
    pub fn new(clock: Arc<dyn Clock>, store: Option<ProviderStore>) -> Self {
        Self {
            clock,
            store,
            owner: NEXT_CONTEXT_OWNER.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Tracks one in-flight start or refresh.
///
/// Captures the cancellation epoch when the operation is requested, so a
/// stop issued before the operation runs still cancels it.
pub(crate) struct PendingGuard {
    provider: Arc<Provider>,
    epoch: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.provider
            .pending_tx
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// One source of entitlements, offers and transactions.
pub struct Provider {
    id: ProviderId,
    name: String,
    kind: ProviderKind,
    context: OnceCell<ProviderContext>,

    state_tx: watch::Sender<ProviderState>,
    snapshot_tx: watch::Sender<Arc<ProviderSnapshot>>,
    cancel_tx: watch::Sender<u64>,
    pending_tx: watch::Sender<usize>,

    lifecycle: tokio::sync::Mutex<()>,
    content: Mutex<ProviderContent>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// Create a stopped provider.
    pub fn new(
        id: impl Into<ProviderId>,
        name: impl Into<String>,
        kind: impl Into<ProviderKind>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ProviderState::Stopped);
        let (snapshot_tx, _) = watch::channel(Arc::new(ProviderSnapshot::default()));
        let (cancel_tx, _) = watch::channel(0);
        let (pending_tx, _) = watch::channel(0);

        Arc::new(Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            context: OnceCell::new(),
            state_tx,
            snapshot_tx,
            cancel_tx,
            pending_tx,
            lifecycle: tokio::sync::Mutex::new(()),
            content: Mutex::new(ProviderContent::default()),
        })
    }

    /// Unique identifier.
    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The variant.
    pub fn kind(&self) -> &ProviderKind {
        &self.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProviderState {
        *self.state_tx.borrow()
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<ProviderSnapshot> {
        Arc::clone(&self.snapshot_tx.borrow())
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ProviderSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ProviderState> {
        self.state_tx.subscribe()
    }

    /// True while the first load has been requested but not finished.
    pub fn is_starting(&self) -> bool {
        match self.state() {
            ProviderState::Starting => true,
            ProviderState::Stopped => *self.pending_tx.borrow() > 0,
            ProviderState::Providing | ProviderState::Stopping => false,
        }
    }

    /// Subscribe to the count of in-flight starts and refreshes.
    pub(crate) fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Wait until no start or refresh is in flight.
    pub async fn wait_idle(&self) {
        let mut pending = self.pending_tx.subscribe();
        let _ = pending.wait_for(|count| *count == 0).await;
    }

    /// Bind the provider to a manager's clock and storage.
    ///
    /// Binding again with a clone of the same context is a no-op.
    ///
    /// # Errors
    /// `ProviderConflict` if the provider is bound to another context.
    pub fn attach(&self, context: ProviderContext) -> Result<(), LicensorError> {
        let owner = context.owner;
        let bound = self.context.get_or_init(|| context);
        if bound.owner != owner {
            return Err(LicensorError::ProviderConflict(format!(
                "provider {} is already attached to another manager",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        match self.context.get() {
            Some(context) => Arc::clone(&context.clock),
            None => Arc::new(SystemClock),
        }
    }

    pub(crate) fn store(&self) -> Option<&ProviderStore> {
        self.context.get().and_then(|context| context.store.as_ref())
    }

    /// Register an in-flight operation.
    pub(crate) fn begin_operation(self: &Arc<Self>) -> PendingGuard {
        self.pending_tx.send_modify(|count| *count += 1);
        PendingGuard {
            provider: Arc::clone(self),
            epoch: *self.cancel_tx.borrow(),
        }
    }

    /// Start providing.
    ///
    /// Idempotent: concurrent calls serialize and the variant's load runs
    /// once; calling while already providing returns `Ok` immediately.
    ///
    /// # Errors
    /// - `Cancelled` if the provider was stopped before the load finished
    /// - the variant's load error; the provider is left stopped
    pub async fn start_providing(self: &Arc<Self>) -> Result<(), LicensorError> {
        let guard = self.begin_operation();
        self.start_with(guard).await
    }

    #[instrument(skip(self, guard), fields(provider = %self.id, kind = self.kind.name()))]
    pub(crate) async fn start_with(
        self: &Arc<Self>,
        guard: PendingGuard,
    ) -> Result<(), LicensorError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_not_cancelled(guard.epoch)?;

        if self.state() == ProviderState::Providing {
            debug!("Provider already providing");
            return Ok(());
        }

        self.set_state(ProviderState::Starting);
        match self.load_cancellable(guard.epoch).await {
            Ok(content) => {
                self.install(content);
                self.set_state(ProviderState::Providing);
                info!("Provider started");
                Ok(())
            }
            Err(e) => {
                self.set_state(ProviderState::Stopped);
                warn!(error = %e, "Provider failed to start");
                Err(e)
            }
        }
    }

    /// Reload the variant's data while providing.
    ///
    /// A stopped provider is left alone. On failure the previous snapshot
    /// stays published.
    #[instrument(skip(self), fields(provider = %self.id, kind = self.kind.name()))]
    pub async fn refresh(self: &Arc<Self>) -> Result<(), LicensorError> {
        let guard = self.begin_operation();
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_not_cancelled(guard.epoch)?;

        if self.state() != ProviderState::Providing {
            debug!("Refresh skipped, provider not providing");
            return Ok(());
        }

        match self.load_cancellable(guard.epoch).await {
            Ok(content) => {
                self.install(content);
                debug!("Provider refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Provider refresh failed");
                Err(e)
            }
        }
    }

    /// Stop providing and withdraw all published data.
    ///
    /// In-flight starts and refreshes are cancelled and resolve to
    /// `LicensorError::Cancelled`.
    #[instrument(skip(self), fields(provider = %self.id, kind = self.kind.name()))]
    pub async fn stop_providing(&self) -> Result<(), LicensorError> {
        self.cancel_tx.send_modify(|epoch| *epoch += 1);
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() == ProviderState::Stopped {
            return Ok(());
        }

        self.set_state(ProviderState::Stopping);
        *self.lock_content() = ProviderContent::default();
        self.publish();
        self.set_state(ProviderState::Stopped);
        info!("Provider stopped");
        Ok(())
    }

    /// Restore previous purchases (App Store only; a no-op for other kinds).
    pub async fn restore_purchases(self: &Arc<Self>) -> Result<(), LicensorError> {
        if let ProviderKind::AppStore(store) = &self.kind {
            store.restore().await?;
            self.refresh().await?;
        }
        Ok(())
    }

    /// Whether the device allows purchases; `None` for kinds that do not sell.
    pub fn purchases_allowed(&self) -> Option<bool> {
        match &self.kind {
            ProviderKind::AppStore(store) => Some(store.purchases_allowed()),
            _ => None,
        }
    }

    fn ensure_not_cancelled(&self, epoch: u64) -> Result<(), LicensorError> {
        if *self.cancel_tx.borrow() != epoch {
            debug!(provider = %self.id, "Operation cancelled by stop");
            return Err(LicensorError::Cancelled);
        }
        Ok(())
    }

    async fn load_cancellable(
        self: &Arc<Self>,
        epoch: u64,
    ) -> Result<ProviderContent, LicensorError> {
        let mut cancel = self.cancel_tx.subscribe();
        if *cancel.borrow_and_update() != epoch {
            return Err(LicensorError::Cancelled);
        }

        tokio::select! {
            result = self.kind.load(self) => result,
            _ = cancel.changed() => Err(LicensorError::Cancelled),
        }
    }

    /// Replace the content and publish it as one snapshot.
    fn install(self: &Arc<Self>, mut content: ProviderContent) {
        let reported = std::mem::take(&mut content.reported);
        for (offer, state) in content.offers.iter().zip(reported) {
            offer.set_reported_state(state);
        }

        for offer in &content.offers {
            let provider = Arc::downgrade(self);
            offer.on_state_change(move || {
                if let Some(provider) = provider.upgrade() {
                    provider.publish();
                }
            });
        }
        *self.lock_content() = content;
        self.publish();
    }

    /// Publish the current content; identical content does not bump the generation.
    pub(crate) fn publish(&self) {
        let candidate = {
            let content = self.lock_content();
            ProviderSnapshot::from_parts(
                content.entitlements.clone(),
                content.offers.clone(),
                content.transactions.clone(),
            )
        };

        let changed = self.snapshot_tx.send_if_modified(|current| {
            if current.same_content(&candidate) {
                return false;
            }
            let mut next = candidate;
            next.generation = current.generation + 1;
            *current = Arc::new(next);
            true
        });

        if changed {
            debug!(
                provider = %self.id,
                generation = self.snapshot_tx.borrow().generation,
                "Snapshot published"
            );
        }
    }

    fn set_state(&self, state: ProviderState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn lock_content(&self) -> MutexGuard<'_, ProviderContent> {
        self.content.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::LicenseType;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingDelegate {
        loads: AtomicUsize,
    }

    impl QaUnlockDelegate for CountingDelegate {
        fn unlocks(&self) -> bool {
            self.loads.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn enterprise(products: &[&str]) -> Arc<Provider> {
        Provider::new(
            "enterprise",
            "Enterprise",
            EnterpriseProvider::new(products.iter().copied()),
        )
    }

    #[tokio::test]
    async fn test_start_publishes_snapshot() {
        let provider = enterprise(&["bundle.pro"]);
        assert_eq!(provider.state(), ProviderState::Stopped);

        provider.start_providing().await.unwrap();

        assert_eq!(provider.state(), ProviderState::Providing);
        let snapshot = provider.snapshot();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.entitlements.len(), 1);
        assert_eq!(snapshot.entitlements[0].license_type, LicenseType::None);
    }

    #[tokio::test]
    async fn test_double_start_loads_once() {
        let delegate = Arc::new(CountingDelegate {
            loads: AtomicUsize::new(0),
        });
        let provider = Provider::new(
            "qa",
            "QA",
            QaProvider::new(["bundle.pro"], delegate.clone()),
        );

        let (a, b) = tokio::join!(provider.start_providing(), provider.start_providing());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(delegate.loads.load(Ordering::SeqCst), 1);
        assert_eq!(provider.snapshot().generation, 1);
    }

    #[tokio::test]
    async fn test_identical_refresh_keeps_generation() {
        let provider = enterprise(&["bundle.pro"]);
        provider.start_providing().await.unwrap();
        provider.refresh().await.unwrap();
        assert_eq!(provider.snapshot().generation, 1);
    }

    #[tokio::test]
    async fn test_stop_withdraws_data() {
        let provider = enterprise(&["bundle.pro"]);
        provider.start_providing().await.unwrap();

        provider.stop_providing().await.unwrap();
        assert_eq!(provider.state(), ProviderState::Stopped);
        assert!(provider.snapshot().is_empty());
        assert_eq!(provider.snapshot().generation, 2);

        // Stopping twice completes immediately
        provider.stop_providing().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_start() {
        let provider = enterprise(&["bundle.pro"]);
        let guard = provider.begin_operation();
        assert!(provider.is_starting());

        provider.stop_providing().await.unwrap();
        let result = provider.start_with(guard).await;

        assert_eq!(result, Err(LicensorError::Cancelled));
        assert_eq!(provider.state(), ProviderState::Stopped);
        assert!(!provider.is_starting());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_when_nothing_pending() {
        let provider = enterprise(&["bundle.pro"]);
        tokio::time::timeout(Duration::from_secs(1), provider.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attach_to_second_context_conflicts() {
        let provider = enterprise(&["bundle.pro"]);
        let context = ProviderContext::new(Arc::new(SystemClock), None);
        provider.attach(context.clone()).unwrap();
        provider.attach(context).unwrap();

        let other = ProviderContext::new(Arc::new(SystemClock), None);
        assert!(matches!(
            provider.attach(other),
            Err(LicensorError::ProviderConflict(_))
        ));
    }
}
