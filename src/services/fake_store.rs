//! Simulated store for local development and tests.
//!
//! Receipts are signed with a development key so they go through the real
//! validation path. Owned non-consumables and subscriptions are remembered
//! and re-delivered on restore (explicit platforms) or on initialization
//! (automatic platforms).

use crate::{
    config::StoreConfig,
    error::{InitializationError, InitializationFailureReason, RestoreNotSupportedError},
    models::{
        common::{IAPPlatform, ProductKind, RestoreCapability},
        product::ProductDefinition,
        purchase::FailureReason,
        receipt::{Receipt, ValidatedClaim},
        subscription::IntroductoryPriceInfo,
    },
    services::{
        receipt_validator::{AppStoreTransaction, GooglePlayEnvelope, GooglePlayPurchase},
        store_gateway::{RestoreAccepted, StoreEvent, StoreEventSender, StoreGateway},
    },
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use std::collections::{HashMap, HashSet};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Length of one simulated subscription period
const SUBSCRIPTION_PERIOD_DAYS: i64 = 30;

/// Produces receipts in the formats the validators understand
pub struct ReceiptSigner {
    platform: IAPPlatform,
    algorithm: Algorithm,
    key: EncodingKey,
    key_id: Option<String>,
}

impl ReceiptSigner {
    pub fn new(platform: IAPPlatform, algorithm: Algorithm, key: EncodingKey) -> Self {
        Self {
            platform,
            algorithm,
            key,
            key_id: None,
        }
    }

    /// HS256 signer for development secrets
    pub fn from_secret(platform: IAPPlatform, secret: &str) -> Self {
        Self::new(platform, Algorithm::HS256, EncodingKey::from_secret(secret.as_bytes()))
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn platform(&self) -> IAPPlatform {
        self.platform
    }

    /// JWS compact transaction, declared as `product_id` by the gateway
    pub fn sign_app_store(
        &self,
        product_id: &str,
        transaction: &AppStoreTransaction,
    ) -> anyhow::Result<Receipt> {
        let mut header = Header::new(self.algorithm);
        header.kid = self.key_id.clone();

        let token = encode(&header, transaction, &self.key).context("Failed to sign transaction")?;
        Ok(Receipt::new(self.platform, product_id, token.into_bytes()))
    }

    /// Purchase JSON plus a standard-base64 signature over it
    pub fn sign_google_play(
        &self,
        product_id: &str,
        purchase: &GooglePlayPurchase,
    ) -> anyhow::Result<Receipt> {
        let json = serde_json::to_string(purchase)?;
        let signature = jsonwebtoken::crypto::sign(json.as_bytes(), &self.key, self.algorithm)
            .context("Failed to sign purchase data")?;
        let signature = STANDARD.encode(URL_SAFE_NO_PAD.decode(signature)?);

        let payload = serde_json::to_vec(&GooglePlayEnvelope { json, signature })?;
        Ok(Receipt::new(self.platform, product_id, payload))
    }
}

/// Scripted outcomes for the fake store
#[derive(Debug, Clone, Default)]
pub struct FakeStoreBehavior {
    pub fail_initialization: Option<InitializationFailureReason>,
    /// Catalog ids whose purchase reports PaymentDeclined
    pub declined_products: HashSet<String>,
    /// Catalog ids whose purchase waits for `approve_deferred`
    pub deferred_products: HashSet<String>,
    /// Store id -> introductory offer
    pub intro_prices: HashMap<String, IntroductoryPriceInfo>,
}

#[derive(Default)]
struct FakeStoreState {
    events: Option<StoreEventSender>,
    products: HashMap<String, ProductDefinition>,
    /// Receipts of non-consumables and subscriptions, in purchase order
    owned: Vec<Receipt>,
    finished: HashSet<String>,
}

pub struct FakeStoreGateway {
    signer: ReceiptSigner,
    app_identifier: Option<String>,
    behavior: FakeStoreBehavior,
    state: Mutex<FakeStoreState>,
}

impl FakeStoreGateway {
    pub fn new(
        signer: ReceiptSigner,
        app_identifier: Option<String>,
        behavior: FakeStoreBehavior,
    ) -> Self {
        Self {
            signer,
            app_identifier,
            behavior,
            state: Mutex::new(FakeStoreState::default()),
        }
    }

    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        let platform = config
            .platform()
            .ok_or_else(|| anyhow!("Unknown store platform: {}", config.platform))?;

        let fail_initialization = match &config.fail_initialization {
            Some(reason) => Some(
                InitializationFailureReason::from_str(reason)
                    .ok_or_else(|| anyhow!("Unknown initialization failure: {}", reason))?,
            ),
            None => None,
        };

        let behavior = FakeStoreBehavior {
            fail_initialization,
            declined_products: config.declined_products.iter().cloned().collect(),
            deferred_products: config.deferred_products.iter().cloned().collect(),
            intro_prices: HashMap::new(),
        };

        Ok(Self::new(
            ReceiptSigner::from_secret(platform, &config.signing_secret),
            config.app_identifier.clone(),
            behavior,
        ))
    }

    /// Complete a purchase that was reported as deferred
    pub async fn approve_deferred(&self, product_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let product = state
            .products
            .get(product_id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown product: {}", product_id))?;
        self.complete_purchase(&mut state, &product)
    }

    /// Transaction ids the controller acknowledged
    pub async fn finished_transactions(&self) -> HashSet<String> {
        self.state.lock().await.finished.clone()
    }

    fn sender(state: &FakeStoreState) -> anyhow::Result<&StoreEventSender> {
        state
            .events
            .as_ref()
            .ok_or_else(|| anyhow!("Fake store is not initialized"))
    }

    fn complete_purchase(
        &self,
        state: &mut FakeStoreState,
        product: &ProductDefinition,
    ) -> anyhow::Result<()> {
        let receipt = self.issue_receipt(product)?;

        if product.kind != ProductKind::Consumable {
            state.owned.push(receipt.clone());
        }

        Self::sender(state)?
            .send(StoreEvent::PurchaseCompleted(receipt))
            .map_err(|_| anyhow!("Store event channel closed"))?;
        Ok(())
    }

    fn issue_receipt(&self, product: &ProductDefinition) -> anyhow::Result<Receipt> {
        let platform = self.signer.platform();
        let store_id = product.store_id(platform).to_string();
        let now = OffsetDateTime::now_utc();
        let now_ms = (now.unix_timestamp_nanos() / 1_000_000) as i64;
        let transaction_id = Uuid::new_v4().to_string();

        let expires_ms = (product.kind == ProductKind::Subscription).then(|| {
            let expires = now + Duration::days(SUBSCRIPTION_PERIOD_DAYS);
            (expires.unix_timestamp_nanos() / 1_000_000) as i64
        });
        let free_trial = self
            .behavior
            .intro_prices
            .get(&store_id)
            .map(IntroductoryPriceInfo::is_free)
            .unwrap_or(false);

        match platform {
            IAPPlatform::GooglePlay => self.signer.sign_google_play(
                &product.id,
                &GooglePlayPurchase {
                    order_id: Some(format!("GPA.{}", transaction_id)),
                    package_name: self.app_identifier.clone(),
                    product_id: store_id,
                    purchase_time: now_ms,
                    purchase_state: 0,
                    purchase_token: Uuid::new_v4().to_string(),
                    quantity: Some(1),
                    auto_renewing: expires_ms.map(|_| true),
                    expiry_time_millis: expires_ms,
                    user_cancellation_time_millis: None,
                },
            ),
            _ => self.signer.sign_app_store(
                &product.id,
                &AppStoreTransaction {
                    transaction_id: transaction_id.clone(),
                    original_transaction_id: Some(transaction_id),
                    bundle_id: self.app_identifier.clone(),
                    product_id: store_id,
                    purchase_date: now_ms,
                    expires_date: expires_ms,
                    revocation_date: None,
                    quantity: Some(1),
                    in_app_ownership_type: Some("PURCHASED".to_string()),
                    offer_type: free_trial.then_some(1),
                    is_trial_period: Some(free_trial),
                },
            ),
        }
    }

    fn redeliver_owned(state: &FakeStoreState) -> anyhow::Result<usize> {
        let sender = Self::sender(state)?;
        for receipt in &state.owned {
            sender
                .send(StoreEvent::PurchaseCompleted(receipt.clone()))
                .map_err(|_| anyhow!("Store event channel closed"))?;
        }
        Ok(state.owned.len())
    }
}

#[async_trait]
impl StoreGateway for FakeStoreGateway {
    fn platform(&self) -> IAPPlatform {
        self.signer.platform()
    }

    #[instrument(skip(self, catalog, events))]
    async fn initialize(
        &self,
        catalog: Vec<ProductDefinition>,
        events: StoreEventSender,
    ) -> Result<(), InitializationError> {
        if let Some(reason) = self.behavior.fail_initialization {
            warn!(reason = reason.as_str(), "Fake store refusing to initialize");
            return Err(InitializationError::new(reason));
        }

        if catalog.is_empty() {
            return Err(InitializationError::new(InitializationFailureReason::NoProducts));
        }

        let mut state = self.state.lock().await;
        state.products = catalog.into_iter().map(|p| (p.id.clone(), p)).collect();
        state.events = Some(events);

        info!(
            platform = %self.platform(),
            products = state.products.len(),
            "Fake store initialized"
        );

        if self.restore_capability() == RestoreCapability::Automatic {
            match Self::redeliver_owned(&state) {
                Ok(count) => debug!(count, "Re-delivered owned purchases on initialization"),
                Err(e) => warn!("Failed to re-deliver owned purchases: {}", e),
            }
        }

        Ok(())
    }

    #[instrument(skip(self, product), fields(product_id = %product.id))]
    async fn initiate_purchase(&self, product: &ProductDefinition) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let sender = Self::sender(&state)?.clone();

        let failure = if !state.products.contains_key(&product.id) {
            Some(FailureReason::ProductUnavailable)
        } else if self.behavior.declined_products.contains(&product.id) {
            Some(FailureReason::PaymentDeclined)
        } else {
            None
        };

        if let Some(reason) = failure {
            debug!(reason = reason.as_str(), "Fake store failing purchase");
            sender
                .send(StoreEvent::PurchaseFailed {
                    product_id: product.id.clone(),
                    reason,
                })
                .map_err(|_| anyhow!("Store event channel closed"))?;
            return Ok(());
        }

        if self.behavior.deferred_products.contains(&product.id) {
            debug!("Fake store deferring purchase");
            sender
                .send(StoreEvent::PurchaseDeferred {
                    product_id: product.id.clone(),
                })
                .map_err(|_| anyhow!("Store event channel closed"))?;
            return Ok(());
        }

        self.complete_purchase(&mut state, product)
    }

    async fn restore(&self) -> Result<RestoreAccepted, RestoreNotSupportedError> {
        let platform = self.platform();
        if self.restore_capability() != RestoreCapability::Explicit {
            return Err(RestoreNotSupportedError { platform });
        }

        let state = self.state.lock().await;
        match Self::redeliver_owned(&state) {
            Ok(count) => {
                info!(count, "Fake store restoring purchases");
                Ok(RestoreAccepted)
            }
            Err(e) => {
                warn!("Fake store restore failed: {}", e);
                Err(RestoreNotSupportedError { platform })
            }
        }
    }

    async fn finish_transaction(&self, claim: &ValidatedClaim) {
        self.state
            .lock()
            .await
            .finished
            .insert(claim.transaction_id.clone());
    }

    fn introductory_price(&self, store_id: &str) -> Option<IntroductoryPriceInfo> {
        self.behavior.intro_prices.get(store_id).cloned()
    }
}
