//! The manager's dispatcher task.
//!
//! Every provider change reaches observers through this one task, so
//! handlers run sequentially and in the order changes were observed:
//! - A forwarder per provider turns watch notifications into events
//! - The dispatcher reconciles published snapshots by generation
//! - Only observers whose watched products were touched are re-evaluated

use crate::catalog::{Catalog, ProductId, ProviderId};
use crate::manager::ManagerInner;
use crate::observer::Observer;
use crate::provider::Provider;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Slack added to scheduled wake-ups so the boundary instant has passed.
const WAKE_MARGIN_SECS: i64 = 1;

/// Work items for the dispatcher.
#[derive(Debug)]
pub(crate) enum DispatchEvent {
    /// A provider published a snapshot.
    ProviderChanged(ProviderId),
    /// A provider's lifecycle state or pending count moved.
    ProviderStateChanged(ProviderId),
    /// Providers were removed; their products need re-evaluation.
    ProvidersRemoved(BTreeSet<ProductId>),
    /// Catch up an observer registered after its initial evaluation.
    ObserverRegistered(u64),
    /// Re-evaluate every observer.
    Reevaluate,
    /// Reconcile everything, then signal.
    Barrier(oneshot::Sender<()>),
}

/// Which observers an event can affect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scope {
    All,
    Products(BTreeSet<ProductId>),
    Observer(u64),
}

impl Scope {
    fn merge(self, other: Scope) -> Scope {
        match (self, other) {
            (Scope::All, _) | (_, Scope::All) => Scope::All,
            (Scope::Products(mut a), Scope::Products(b)) => {
                a.extend(b);
                Scope::Products(a)
            }
            // Observer scopes never merge with another scope
            (scope, _) => scope,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Scope::Products(products) if products.is_empty())
    }
}

/// Run until the manager is dropped or every sender is gone.
pub(crate) async fn run(
    inner: Weak<ManagerInner>,
    mut events: mpsc::UnboundedReceiver<DispatchEvent>,
) {
    let mut next_change: Option<DateTime<Utc>> = None;
    let mut wake_after: Option<Duration> = None;

    loop {
        let (event, from_timer) = tokio::select! {
            event = events.recv() => match event {
                Some(event) => (event, false),
                None => break,
            },
            _ = sleep_for(wake_after) => {
                debug!("Scheduled status change reached");
                (DispatchEvent::Reevaluate, true)
            }
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };

        // The change instant can pass while another event is ready
        if !from_timer && next_change.is_some_and(|at| at < inner.clock.now_utc()) {
            debug!("Scheduled status change passed, catching up");
            inner.handle(DispatchEvent::Reevaluate);
        }
        inner.handle(event);

        next_change = inner.next_status_change();
        wake_after = next_change.map(|at| inner.delay_until(at));
    }

    debug!("Dispatcher stopped");
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Forward a provider's watch notifications as dispatcher events.
pub(crate) fn spawn_forwarder(
    runtime: &Handle,
    provider: &Arc<Provider>,
    events: mpsc::UnboundedSender<DispatchEvent>,
) -> JoinHandle<()> {
    let id = provider.id().clone();
    let mut snapshots = provider.subscribe();
    let mut states = provider.subscribe_state();
    let mut pending = provider.subscribe_pending();

    runtime.spawn(async move {
        loop {
            let event = tokio::select! {
                changed = snapshots.changed() => match changed {
                    Ok(()) => DispatchEvent::ProviderChanged(id.clone()),
                    Err(_) => break,
                },
                changed = states.changed() => match changed {
                    Ok(()) => DispatchEvent::ProviderStateChanged(id.clone()),
                    Err(_) => break,
                },
                changed = pending.changed() => match changed {
                    Ok(()) => DispatchEvent::ProviderStateChanged(id.clone()),
                    Err(_) => break,
                },
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

/// Products sharing at least one feature with any of `products`.
///
/// An offer's effective state depends on grants through related products,
/// so those observers are re-evaluated too.
fn with_related_products(catalog: &Catalog, products: BTreeSet<ProductId>) -> BTreeSet<ProductId> {
    let mut expanded = products.clone();
    for product in &products {
        let Some(product) = catalog.product(product.as_str()) else {
            continue;
        };
        for feature in &product.contents {
            expanded.extend(
                catalog
                    .products_containing(feature.as_str())
                    .map(|p| p.identifier.clone()),
            );
        }
    }
    expanded
}

impl ManagerInner {
    fn handle(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::ProviderChanged(provider)
            | DispatchEvent::ProviderStateChanged(provider) => {
                trace!(%provider, "Provider moved");
                let scope = self.reconcile();
                self.deliver(scope);
            }
            DispatchEvent::ProvidersRemoved(products) => {
                let scope = self.reconcile().merge(Scope::Products(products));
                self.deliver(scope);
            }
            DispatchEvent::ObserverRegistered(id) => self.deliver(Scope::Observer(id)),
            DispatchEvent::Reevaluate => {
                self.reconcile();
                self.deliver(Scope::All);
            }
            DispatchEvent::Barrier(done) => {
                let scope = self.reconcile();
                self.deliver(scope);
                let _ = done.send(());
            }
        }
    }

    /// Pick up every snapshot not seen yet.
    ///
    /// Affected products are the union of what a provider contributed
    /// before and after. A flip of the "some provider is starting" flag
    /// affects everyone, since it moves statuses in and out of unknown.
    fn reconcile(&self) -> Scope {
        let mut registry = self.lock_registry();
        let mut changed = BTreeSet::new();

        for entry in registry.providers.iter_mut() {
            let snapshot = entry.provider.snapshot();
            if entry.seen_generation == Some(snapshot.generation) {
                continue;
            }
            let products = snapshot.products();
            debug!(
                provider = %entry.provider.id(),
                generation = snapshot.generation,
                products = products.len(),
                "Reconciled provider snapshot"
            );
            changed.extend(entry.seen_products.iter().cloned());
            changed.extend(products.iter().cloned());
            entry.seen_generation = Some(snapshot.generation);
            entry.seen_products = products;
        }

        let pending = registry.providers.iter().any(|e| e.provider.is_starting());
        let pending_flipped = pending != registry.last_pending;
        registry.last_pending = pending;

        if pending_flipped {
            Scope::All
        } else {
            Scope::Products(with_related_products(&registry.catalog, changed))
        }
    }

    /// Evaluate the observers in scope against one fresh context.
    ///
    /// No lock is held while handlers run.
    fn deliver(&self, scope: Scope) {
        if scope.is_empty() {
            return;
        }

        let context = self.evaluation_context();
        let observers: Vec<Arc<Observer>> = {
            let registry = self.lock_registry();
            registry
                .observers
                .values()
                .filter(|observer| match &scope {
                    Scope::All => true,
                    Scope::Products(products) => observer.is_affected_by(context.catalog(), products),
                    Scope::Observer(id) => observer.id() == *id,
                })
                .cloned()
                .collect()
        };

        let mut dead = Vec::new();
        for observer in &observers {
            if !observer.evaluate(&context, false) {
                dead.push(observer.id());
            }
        }

        if !dead.is_empty() {
            debug!(count = dead.len(), "Dropping observers whose owner or environment is gone");
            let mut registry = self.lock_registry();
            for id in dead {
                registry.observers.remove(&id);
            }
        }
    }

    /// Earliest upcoming status change, when scheduling is on.
    fn next_status_change(&self) -> Option<DateTime<Utc>> {
        if !self.config.schedule_status_changes {
            return None;
        }
        let context = self.evaluation_context();
        let now = context.now();
        let next = context
            .entitlements()
            .filter_map(|e| e.upcoming_change(now))
            .min()?;
        trace!(%next, "Scheduled re-evaluation");
        Some(next)
    }

    fn delay_until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.clock.now_utc() + ChronoDuration::seconds(WAKE_MARGIN_SECS))
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
