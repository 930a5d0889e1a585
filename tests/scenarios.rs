//! End-to-end authorization scenarios through the license manager.

use chrono::{Duration, Utc};
use licensor::{
    AppStoreItem, AppStoreProvider, AuthorizationStatus, CommitFuture, CommitOptions,
    EnterpriseProvider, Environment, Feature, LicenseDuration, LicenseManager, LicensorConfig,
    ObservationRequest, OfferState, PaymentQueue, Price, Product, Provider, QaProvider, ReceiptFuture,
    ReceiptRecord, ReceiptSupplier,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct Receipts {
    records: Mutex<Vec<ReceiptRecord>>,
}

impl Receipts {
    fn push(&self, record: ReceiptRecord) {
        self.records.lock().unwrap().push(record);
    }
}

impl ReceiptSupplier for Receipts {
    fn in_app_purchases(&self) -> ReceiptFuture<'_> {
        let records = self.records.lock().unwrap().clone();
        Box::pin(async move { Ok(records) })
    }
}

struct Queue {
    allowed: AtomicBool,
}

impl PaymentQueue for Queue {
    fn purchases_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }

    fn price_for(&self, _app_store_id: &str) -> Option<Price> {
        Some(Price::new(999, "EUR"))
    }

    fn submit(&self, _app_store_id: &str, _options: CommitOptions) -> CommitFuture {
        Box::pin(async { Ok(()) })
    }

    fn restore(&self) -> CommitFuture {
        Box::pin(async { Ok(()) })
    }
}

fn record(app_store_id: &str) -> ReceiptRecord {
    ReceiptRecord {
        product_id: app_store_id.to_string(),
        transaction_id: format!("tx-{}", app_store_id),
        original_transaction_id: None,
        purchase_date: Some(Utc::now() - Duration::days(30)),
        original_purchase_date: None,
        cancellation_date: None,
        subscription_expiration_date: None,
        quantity: 1,
        web_order_line_item_id: None,
        in_intro_offer_period: false,
    }
}

fn manager(dir: &TempDir) -> LicenseManager {
    let config = LicensorConfig::new("scenarios", "licensor-scenarios").with_storage_root(dir.path());
    let manager = LicenseManager::new(config).unwrap();
    manager.register_feature(Feature::new("f1")).unwrap();
    manager.register_feature(Feature::new("f2")).unwrap();
    manager
        .register_product(Product::new("p1", "Product 1", ["f1"]))
        .unwrap();
    manager
        .register_product(Product::new("p2", "Product 2", ["f2"]))
        .unwrap();
    manager
}

fn app_store(receipts: Arc<Receipts>, allowed: bool) -> Arc<Provider> {
    Provider::new(
        "app-store",
        "App Store",
        AppStoreProvider::new(
            vec![
                AppStoreItem::non_consumable("iap.p1", "p1"),
                AppStoreItem::subscription("sub.p2", "p2", LicenseDuration::days(30), None),
            ],
            receipts,
            Arc::new(Queue {
                allowed: AtomicBool::new(allowed),
            }),
        ),
    )
}

fn enterprise(products: &[&str]) -> Arc<Provider> {
    Provider::new(
        "enterprise",
        "Enterprise",
        EnterpriseProvider::new(products.iter().copied()),
    )
}

type Calls = Arc<Mutex<Vec<(bool, AuthorizationStatus)>>>;

fn recorder() -> (Calls, impl Fn(&licensor::Observer, bool, AuthorizationStatus) + Send + Sync) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    (calls, move |_: &licensor::Observer, initial, status| {
        sink.lock().unwrap().push((initial, status))
    })
}

#[tokio::test]
async fn invalid_entitlements_are_never_granted() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let receipts = Arc::new(Receipts::default());
    let mut refunded = record("iap.p1");
    refunded.cancellation_date = Some(Utc::now() - Duration::days(1));
    receipts.push(refunded);
    manager.add_provider(app_store(receipts, true)).unwrap();

    let env = Environment::new();
    let status = manager
        .perform_after_currently_pending_refreshes(|m| m.authorization_status_for_feature("f1", &env))
        .await;
    assert_eq!(status, AuthorizationStatus::Denied);
}

#[tokio::test]
async fn purchased_product_grants_its_features() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let receipts = Arc::new(Receipts::default());
    receipts.push(record("iap.p1"));
    manager.add_provider(app_store(receipts, true)).unwrap();

    let env = Environment::new();
    manager
        .perform_after_currently_pending_refreshes(|m| {
            assert_eq!(
                m.authorization_status_for_feature("f1", &env),
                AuthorizationStatus::Granted
            );
            assert_eq!(
                m.authorization_status_for_product("p1", &env),
                AuthorizationStatus::Granted
            );
            assert_eq!(
                m.authorization_status_for_feature("f2", &env),
                AuthorizationStatus::Denied
            );
            assert_eq!(
                m.offer_state("app-store:iap.p1", &env),
                Some(OfferState::Committed)
            );
        })
        .await;
}

#[tokio::test]
async fn subscription_expired_one_second_ago() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let receipts = Arc::new(Receipts::default());
    let mut lapsed = record("sub.p2");
    lapsed.subscription_expiration_date = Some(Utc::now() - Duration::seconds(1));
    receipts.push(lapsed);
    manager.add_provider(app_store(receipts, true)).unwrap();

    let env = Environment::new();
    manager
        .perform_after_currently_pending_refreshes(|m| {
            assert_eq!(
                m.authorization_status_for_feature("f2", &env),
                AuthorizationStatus::Expired
            );
            assert_eq!(m.offer_state("app-store:sub.p2", &env), Some(OfferState::Expired));
        })
        .await;
}

#[tokio::test]
async fn add_remove_round_trip_restores_status() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let env = Arc::new(Environment::new());
    let owner = Arc::new(());
    let (calls, handler) = recorder();
    let _observer = manager.observe_products(Vec::<&str>::new(), ["f1"], &env, &owner, handler);

    let provider = enterprise(&["p1"]);
    manager.add_provider(provider.clone()).unwrap();
    let granted = manager
        .perform_after_currently_pending_refreshes(|m| m.authorization_status_for_feature("f1", &env))
        .await;
    assert_eq!(granted, AuthorizationStatus::Granted);

    manager.remove_provider("enterprise").await.unwrap();
    let removed = manager
        .perform_after_currently_pending_refreshes(|m| m.authorization_status_for_feature("f1", &env))
        .await;
    assert_eq!(removed, AuthorizationStatus::Denied);

    manager.add_provider(provider).unwrap();
    let restored = manager
        .perform_after_currently_pending_refreshes(|m| m.authorization_status_for_feature("f1", &env))
        .await;
    assert_eq!(restored, AuthorizationStatus::Granted);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.first(), Some(&(true, AuthorizationStatus::Denied)));
    assert_eq!(calls.last(), Some(&(false, AuthorizationStatus::Granted)));
    assert!(calls.contains(&(false, AuthorizationStatus::Denied)));
}

#[tokio::test]
async fn double_start_loads_once() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();
    let provider = Provider::new(
        "qa",
        "QA",
        QaProvider::new(
            ["p1"],
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }),
        ),
    );

    manager.add_provider(provider.clone()).unwrap();
    let (a, b) = tokio::join!(provider.start_providing(), provider.start_providing());
    assert!(a.is_ok());
    assert!(b.is_ok());

    manager.perform_after_currently_pending_refreshes(|_| ()).await;
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn identical_snapshots_do_not_notify() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let provider = enterprise(&["p1"]);
    manager.add_provider(provider.clone()).unwrap();
    manager.perform_after_currently_pending_refreshes(|_| ()).await;

    let env = Arc::new(Environment::new());
    let owner = Arc::new(());
    let (calls, handler) = recorder();
    let _observer = manager.observe_products(["p1"], Vec::<&str>::new(), &env, &owner, handler);

    provider.refresh().await.unwrap();
    provider.refresh().await.unwrap();
    manager.reevaluate();
    manager.perform_after_currently_pending_refreshes(|_| ()).await;

    assert_eq!(
        *calls.lock().unwrap(),
        vec![(true, AuthorizationStatus::Granted)]
    );
}

#[tokio::test]
async fn unrelated_grant_makes_offer_redundant() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager
        .add_provider(app_store(Arc::new(Receipts::default()), true))
        .unwrap();

    let env = Arc::new(Environment::new());
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = deliveries.clone();
    let _observer = manager.observe(
        ObservationRequest::new(&env)
            .products(["p1"])
            .on_offers(move |_, offers| sink.lock().unwrap().push(offers.len())),
    );

    let before = manager
        .perform_after_currently_pending_refreshes(|m| m.offer_state("app-store:iap.p1", &env))
        .await;
    assert_eq!(before, Some(OfferState::Uncommitted));

    manager.add_provider(enterprise(&["p1"])).unwrap();
    let after = manager
        .perform_after_currently_pending_refreshes(|m| m.offer_state("app-store:iap.p1", &env))
        .await;
    assert_eq!(after, Some(OfferState::Redundant));

    // Empty at registration, then uncommitted, then redundant
    let deliveries = deliveries.lock().unwrap();
    assert!(deliveries.len() >= 3);
    assert_eq!(deliveries.last(), Some(&1));
}

#[tokio::test]
async fn dropped_owner_stops_delivery() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let env = Arc::new(Environment::new());
    let owner = Arc::new(String::from("screen"));
    let (calls, handler) = recorder();
    let _observer = manager.observe_products(["p1"], Vec::<&str>::new(), &env, &owner, handler);
    assert_eq!(manager.observer_count(), 1);

    drop(owner);
    manager.add_provider(enterprise(&["p1"])).unwrap();
    manager.perform_after_currently_pending_refreshes(|_| ()).await;

    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(manager.observer_count(), 0);
}

#[tokio::test]
async fn stopped_observer_gets_no_callbacks() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let env = Arc::new(Environment::new());
    let owner = Arc::new(());
    let (calls, handler) = recorder();
    let observer = manager.observe_products(["p1"], Vec::<&str>::new(), &env, &owner, handler);

    manager.stop_observer(&observer);
    manager.add_provider(enterprise(&["p1"])).unwrap();
    manager.perform_after_currently_pending_refreshes(|_| ()).await;

    assert_eq!(*calls.lock().unwrap(), vec![(true, AuthorizationStatus::Denied)]);
}

#[tokio::test]
async fn purchases_disabled_message() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager
        .add_provider(app_store(Arc::new(Receipts::default()), false))
        .unwrap();
    manager.perform_after_currently_pending_refreshes(|_| ()).await;

    assert!(manager.in_app_purchase_message(Some("f1")).is_some());
    assert!(manager.in_app_purchase_message(None).is_some());

    let features: Vec<_> = manager
        .features_with_offers()
        .iter()
        .map(|f| f.identifier.to_string())
        .collect();
    assert_eq!(features, vec!["f1", "f2"]);
    assert_eq!(manager.offers_for_feature("f1").len(), 1);

    let offer = manager.offers_for_feature("f1")[0].clone();
    assert_eq!(
        offer.commit(CommitOptions::new()).await,
        Err(licensor::CommitError::PurchasesNotAllowed)
    );
}

#[tokio::test]
async fn transactions_grouped_by_provider() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let receipts = Arc::new(Receipts::default());
    receipts.push(record("iap.p1"));
    manager.add_provider(app_store(receipts, true)).unwrap();
    manager.add_provider(enterprise(&["p2"])).unwrap();

    let history = manager.retrieve_all_transactions().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].provider_name, "App Store");
    assert_eq!(history[0].transactions[0].identifier, "tx-iap.p1");

    manager.restore_purchases().await.unwrap();
}
