//! Shared fixtures: a store gateway that records calls, signed receipts and
//! a controller wired against them.

use async_trait::async_trait;
use jsonwebtoken::Algorithm;
use purchasekit::{
    error::{InitializationError, InitializationFailureReason, RestoreNotSupportedError},
    models::{
        common::{IAPPlatform, ProductKind},
        product::{PayoutDefinition, PayoutType, ProductDefinition},
        purchase::{Entitlement, PurchaseEvent},
        receipt::{Receipt, ValidatedClaim},
        subscription::IntroductoryPriceInfo,
    },
    services::{
        receipt_validator::{
            AppStoreTransaction, GooglePlayPurchase, GooglePlayVerifier, JwsReceiptVerifier,
        },
        store_gateway::RestoreAccepted,
        Catalog, EntitlementLedger, EntitlementSink, GrantResult, PurchaseController,
        ReceiptSigner, ReceiptValidator, StoreEvent, StoreEventSender, StoreGateway,
        SubscriptionEvaluator, TrustBundle,
    },
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use time::OffsetDateTime;
use tokio::sync::{broadcast, Notify};

pub const SECRET: &str = "test-secret-key-with-minimum-32-characters-required";
pub const FORGER_SECRET: &str = "not-the-store-secret-but-still-32-characters";
pub const APP_ID: &str = "com.example.game";

pub const POTION: &str = "health_potion_medium";
pub const HELM: &str = "gold_helm_rare";
pub const MONTHLY: &str = "monthly_access_auto_renew";

/// Gateway that accepts everything and counts what it was asked to do
pub struct RecordingGateway {
    platform: IAPPlatform,
    pub fail_initialization: Option<InitializationFailureReason>,
    pub initiated: AtomicUsize,
    pub restores: AtomicUsize,
    /// Store id -> introductory offer reported by the store
    pub intro_prices: HashMap<String, IntroductoryPriceInfo>,
    /// Restores wait for `release_restore` before answering
    pub hold_restores: bool,
    release: Notify,
    finished: Mutex<Vec<String>>,
    events: Mutex<Option<StoreEventSender>>,
}

impl RecordingGateway {
    pub fn new(platform: IAPPlatform) -> Self {
        Self {
            platform,
            fail_initialization: None,
            initiated: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
            intro_prices: HashMap::new(),
            hold_restores: false,
            release: Notify::new(),
            finished: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        }
    }

    pub fn initiated(&self) -> usize {
        self.initiated.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    /// Let one held restore answer
    pub fn release_restore(&self) {
        self.release.notify_one();
    }

    /// Transaction ids acknowledged by the controller, in order
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    /// Deliver an event as the store would, from outside the controller
    pub fn send(&self, event: StoreEvent) {
        self.events
            .lock()
            .unwrap()
            .as_ref()
            .expect("gateway not initialized")
            .send(event)
            .expect("controller stopped listening");
    }
}

#[async_trait]
impl StoreGateway for RecordingGateway {
    fn platform(&self) -> IAPPlatform {
        self.platform
    }

    async fn initialize(
        &self,
        _catalog: Vec<ProductDefinition>,
        events: StoreEventSender,
    ) -> Result<(), InitializationError> {
        if let Some(reason) = self.fail_initialization {
            return Err(InitializationError::new(reason));
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn initiate_purchase(&self, _product: &ProductDefinition) -> anyhow::Result<()> {
        self.initiated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restore(&self) -> Result<RestoreAccepted, RestoreNotSupportedError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        if self.hold_restores {
            self.release.notified().await;
        }
        Ok(RestoreAccepted)
    }

    async fn finish_transaction(&self, claim: &ValidatedClaim) {
        self.finished
            .lock()
            .unwrap()
            .push(claim.transaction_id.clone());
    }

    fn introductory_price(&self, store_id: &str) -> Option<IntroductoryPriceInfo> {
        self.intro_prices.get(store_id).cloned()
    }
}

/// Ledger that fails a scripted number of grants before recording normally
pub struct FlakySink {
    pub ledger: Arc<EntitlementLedger>,
    failures_left: AtomicUsize,
}

impl FlakySink {
    pub fn failing(times: usize) -> Self {
        Self {
            ledger: Arc::new(EntitlementLedger::new()),
            failures_left: AtomicUsize::new(times),
        }
    }
}

#[async_trait]
impl EntitlementSink for FlakySink {
    async fn grant(&self, entitlement: &Entitlement) -> anyhow::Result<GrantResult> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("ledger unavailable");
        }
        self.ledger.grant(entitlement).await
    }
}

pub fn catalog() -> Catalog {
    Catalog::from_definitions([
        ProductDefinition::new(POTION, ProductKind::Consumable)
            .with_payout(PayoutDefinition::new(PayoutType::Resource, "health", 50.0)),
        ProductDefinition::new(HELM, ProductKind::NonConsumable)
            .with_payout(PayoutDefinition::new(PayoutType::Item, "gold_helm", 1.0)),
        ProductDefinition::new(MONTHLY, ProductKind::Subscription)
            .with_platform_id(IAPPlatform::GooglePlay, "monthly_access"),
    ])
    .expect("valid catalog")
}

pub fn validator() -> ReceiptValidator {
    let mut validator = ReceiptValidator::new();
    validator.register(
        IAPPlatform::AppStore,
        JwsReceiptVerifier::new(
            TrustBundle::from_secret(Algorithm::HS256, SECRET.as_bytes()),
            Some(APP_ID.to_string()),
        ),
    );
    validator.register(
        IAPPlatform::GooglePlay,
        GooglePlayVerifier::new(
            TrustBundle::from_secret(Algorithm::HS256, SECRET.as_bytes()),
            Some(APP_ID.to_string()),
        ),
    );
    validator
}

pub struct Harness {
    pub controller: PurchaseController,
    pub gateway: Arc<RecordingGateway>,
    pub ledger: Arc<EntitlementLedger>,
}

impl Harness {
    pub fn new(gateway: RecordingGateway) -> Self {
        Self::with_validator(gateway, validator())
    }

    pub fn with_validator(gateway: RecordingGateway, validator: ReceiptValidator) -> Self {
        let ledger = Arc::new(EntitlementLedger::new());
        Self::with_parts(Arc::new(gateway), validator, ledger.clone(), ledger)
    }

    /// Harness whose controller grants through `sink`; `ledger` is what the test inspects
    pub fn with_parts(
        gateway: Arc<RecordingGateway>,
        validator: ReceiptValidator,
        sink: Arc<dyn EntitlementSink>,
        ledger: Arc<EntitlementLedger>,
    ) -> Self {
        let controller = PurchaseController::new(
            Arc::new(catalog()),
            Arc::new(validator),
            SubscriptionEvaluator::default(),
            gateway.clone(),
            sink,
        );
        Self {
            controller,
            gateway,
            ledger,
        }
    }

    /// Harness on `platform` with the controller already initialized
    pub async fn ready(platform: IAPPlatform) -> Self {
        let harness = Self::new(RecordingGateway::new(platform));
        harness
            .controller
            .initialize()
            .await
            .expect("initialization succeeds");
        harness
    }
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn app_store_transaction(product_id: &str, transaction_id: &str) -> AppStoreTransaction {
    AppStoreTransaction {
        transaction_id: transaction_id.to_string(),
        original_transaction_id: Some(transaction_id.to_string()),
        bundle_id: Some(APP_ID.to_string()),
        product_id: product_id.to_string(),
        purchase_date: now_millis(),
        expires_date: None,
        revocation_date: None,
        quantity: Some(1),
        in_app_ownership_type: Some("PURCHASED".to_string()),
        offer_type: None,
        is_trial_period: None,
    }
}

pub fn google_purchase(product_id: &str, order_id: &str) -> GooglePlayPurchase {
    GooglePlayPurchase {
        order_id: Some(order_id.to_string()),
        package_name: Some(APP_ID.to_string()),
        product_id: product_id.to_string(),
        purchase_time: now_millis(),
        purchase_state: 0,
        purchase_token: format!("token-{}", order_id),
        quantity: Some(1),
        auto_renewing: None,
        expiry_time_millis: None,
        user_cancellation_time_millis: None,
    }
}

/// Genuine App Store receipt for a catalog product
pub fn app_store_receipt(product_id: &str, transaction_id: &str) -> Receipt {
    sign_app_store(SECRET, product_id, &app_store_transaction(product_id, transaction_id))
}

pub fn sign_app_store(secret: &str, declared: &str, transaction: &AppStoreTransaction) -> Receipt {
    ReceiptSigner::from_secret(IAPPlatform::AppStore, secret)
        .sign_app_store(declared, transaction)
        .expect("signing succeeds")
}

pub fn sign_google_play(declared: &str, purchase: &GooglePlayPurchase) -> Receipt {
    ReceiptSigner::from_secret(IAPPlatform::GooglePlay, SECRET)
        .sign_google_play(declared, purchase)
        .expect("signing succeeds")
}

/// Wait for the first event matching `predicate`, skipping others
pub async fn wait_for<F>(events: &mut broadcast::Receiver<PurchaseEvent>, predicate: F) -> PurchaseEvent
where
    F: Fn(&PurchaseEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Let spawned store calls run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
