//! Purchase state machine.
//!
//! All state lives behind one async mutex, so gateway callbacks arriving from
//! any task are applied one at a time. Calls into the store that do not have
//! to finish before the caller gets an answer (initiating a purchase, asking
//! for a restore) are spawned and report back through the same entry points
//! the gateway uses.

use crate::{
    error::{PurchaseError, ReceiptValidationError, Result},
    models::{
        common::{IAPPlatform, ProductKind, RestoreCapability},
        product::ProductDefinition,
        purchase::{
            CompletionOutcome, ControllerPhase, Entitlement, FailureReason, PayoutGrant,
            PurchaseEvent, PurchaseRequest, PurchaseStatus, RestoreOutcome,
        },
        receipt::{Receipt, ValidatedClaim},
    },
    services::{
        catalog::Catalog,
        ledger::{EntitlementSink, GrantResult},
        receipt_validator::ReceiptValidator,
        store_gateway::{StoreEvent, StoreEventReceiver, StoreGateway},
        subscription_evaluator::SubscriptionEvaluator,
    },
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct ControllerState {
    phase: ControllerPhase,
    restoring: bool,
    /// Catalog id -> the single in-flight request for it
    in_flight: HashMap<String, PurchaseRequest>,
    /// Requests that reached a terminal status, oldest first
    history: Vec<PurchaseRequest>,
    /// Transactions already granted this session
    entitled: HashMap<(IAPPlatform, String), Entitlement>,
    /// Non-consumables and subscriptions granted this session
    owned: HashSet<String>,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            phase: ControllerPhase::Uninitialized,
            restoring: false,
            in_flight: HashMap::new(),
            history: Vec::new(),
            entitled: HashMap::new(),
            owned: HashSet::new(),
        }
    }

    /// Move the in-flight request for `product_id` to a terminal status and archive it
    fn archive(&mut self, product_id: &str, status: PurchaseStatus) -> Option<Uuid> {
        let mut request = self.in_flight.remove(product_id)?;
        request.transition(status);
        let request_id = request.request_id;
        self.history.push(request);
        Some(request_id)
    }
}

struct ControllerInner {
    catalog: Arc<Catalog>,
    validator: Arc<ReceiptValidator>,
    evaluator: SubscriptionEvaluator,
    gateway: Arc<dyn StoreGateway>,
    sink: Arc<dyn EntitlementSink>,
    events: broadcast::Sender<PurchaseEvent>,
    state: Mutex<ControllerState>,
}

/// Orchestrates purchases against a [`StoreGateway`].
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct PurchaseController {
    inner: Arc<ControllerInner>,
}

impl PurchaseController {
    pub fn new(
        catalog: Arc<Catalog>,
        validator: Arc<ReceiptValidator>,
        evaluator: SubscriptionEvaluator,
        gateway: Arc<dyn StoreGateway>,
        sink: Arc<dyn EntitlementSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ControllerInner {
                catalog,
                validator,
                evaluator,
                gateway,
                sink,
                events,
                state: Mutex::new(ControllerState::new()),
            }),
        }
    }

    /// Subscribe to controller notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PurchaseEvent> {
        self.inner.events.subscribe()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn platform(&self) -> IAPPlatform {
        self.inner.gateway.platform()
    }

    fn emit(&self, event: PurchaseEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    async fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().await
    }

    /// Register the catalog with the store and start consuming its events.
    ///
    /// A failure is reported once and not retried; calling again after a
    /// failure makes a fresh attempt.
    #[instrument(skip(self), fields(platform = %self.platform()))]
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.lock().await;
        if state.phase == ControllerPhase::Ready {
            debug!("Already initialized");
            return Ok(());
        }

        let products: Vec<ProductDefinition> = self.inner.catalog.products().cloned().collect();
        let (tx, rx) = mpsc::unbounded_channel();

        match self.inner.gateway.initialize(products, tx).await {
            Ok(()) => {
                state.phase = ControllerPhase::Ready;
                drop(state);

                tokio::spawn(self.clone().run(rx));
                info!(products = self.inner.catalog.len(), "Purchasing initialized");
                self.emit(PurchaseEvent::Initialized);
                Ok(())
            }
            Err(e) => {
                state.phase = ControllerPhase::InitializationFailed(e.clone());
                warn!(reason = e.reason.as_str(), "Purchasing failed to initialize");
                self.emit(PurchaseEvent::InitializationFailed(e.clone()));
                Err(e.into())
            }
        }
    }

    /// Start buying a catalog product.
    ///
    /// Returns as soon as the request is recorded; the outcome is delivered
    /// later through the store's completion or failure callback.
    #[instrument(skip(self))]
    pub async fn purchase(&self, product_id: &str) -> Result<Uuid> {
        let (request_id, product) = {
            let mut state = self.lock().await;
            if state.phase != ControllerPhase::Ready {
                return Err(PurchaseError::NotReady);
            }

            let product = self
                .inner
                .catalog
                .lookup(product_id)
                .map_err(|_| PurchaseError::UnknownProduct(product_id.to_string()))?
                .clone();

            if state.in_flight.contains_key(product_id) {
                warn!("Purchase already in flight");
                return Err(PurchaseError::DuplicatePurchaseInFlight(product_id.to_string()));
            }

            let request = PurchaseRequest::new(product_id);
            let request_id = request.request_id;
            state.in_flight.insert(product_id.to_string(), request);
            (request_id, product)
        };

        info!(request_id = %request_id, "Purchase started");
        self.emit(PurchaseEvent::PurchaseStarted {
            request_id,
            product_id: product.id.clone(),
        });

        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.inner.gateway.initiate_purchase(&product).await {
                warn!(product_id = %product.id, "Store did not accept purchase: {:#}", e);
                controller
                    .on_purchase_failed(&product.id, FailureReason::Unknown)
                    .await;
            }
        });

        Ok(request_id)
    }

    /// Handle a completed transaction reported by the store.
    ///
    /// Nothing is granted or acknowledged unless the receipt validates. A
    /// transaction that was already granted is acknowledged again without a
    /// second grant.
    #[instrument(skip(self, receipt), fields(platform = %receipt.platform, product_id = %receipt.product_id))]
    pub async fn on_purchase_completed(&self, receipt: Receipt) -> Result<CompletionOutcome> {
        let mut state = self.lock().await;
        let declared = receipt.product_id.clone();

        if let Some(request) = state.in_flight.get_mut(&declared) {
            request.transition(PurchaseStatus::AwaitingValidation);
        }

        let claim = match self.inner.validator.validate(receipt) {
            Ok(claim) => claim,
            Err(e) => return Err(self.reject(&mut state, &declared, e)),
        };

        let product = match self
            .inner
            .catalog
            .resolve_store_id(claim.platform, &claim.product_id)
        {
            Ok(product) if product.id == declared => product.clone(),
            Ok(product) => {
                let error = ReceiptValidationError::tampered(format!(
                    "receipt is for {} but was delivered as {}",
                    product.id, declared
                ));
                return Err(self.reject(&mut state, &declared, error));
            }
            Err(_) if self.inner.catalog.lookup(&declared).is_err() => {
                warn!(store_product_id = %claim.product_id, "Completion for a product outside the catalog");
                return Err(PurchaseError::UnknownProduct(declared));
            }
            Err(_) => {
                let error = ReceiptValidationError::tampered(format!(
                    "receipt product {} does not belong to {}",
                    claim.product_id, declared
                ));
                return Err(self.reject(&mut state, &declared, error));
            }
        };

        let key = claim.transaction_key();
        if state.entitled.contains_key(&key) {
            return Ok(self.acknowledge_duplicate(&mut state, &product, &claim).await);
        }

        if claim.is_pending() {
            debug!(transaction_id = %claim.transaction_id, "Payment still pending");
            Self::mark_deferred(&mut state, &product.id);
            self.emit(PurchaseEvent::Deferred {
                product_id: product.id.clone(),
            });
            return Ok(CompletionOutcome::Deferred {
                product_id: product.id,
            });
        }

        let subscription = match product.kind {
            ProductKind::Subscription => {
                let intro = self
                    .inner
                    .gateway
                    .introductory_price(product.store_id(claim.platform));
                Some(self.inner.evaluator.evaluate(&claim, product.kind, intro.as_ref())?)
            }
            _ => None,
        };

        let entitlement = Entitlement {
            request_id: state.in_flight.get(&product.id).map(|r| r.request_id),
            product_id: product.id.clone(),
            kind: product.kind,
            platform: claim.platform,
            transaction_id: claim.transaction_id.clone(),
            payout: product
                .payout
                .as_ref()
                .map(|payout| PayoutGrant::from_definition(payout, claim.quantity)),
            subscription,
            granted_at: OffsetDateTime::now_utc(),
        };

        match self.inner.sink.grant(&entitlement).await {
            Ok(GrantResult::Granted) => {}
            Ok(GrantResult::AlreadyGranted) => {
                state.entitled.insert(key, entitlement);
                return Ok(self.acknowledge_duplicate(&mut state, &product, &claim).await);
            }
            Err(e) => {
                // Not acknowledged, so the store delivers it again
                if let Some(request) = state.in_flight.get_mut(&product.id) {
                    request.transition(PurchaseStatus::Pending);
                }
                return Err(PurchaseError::EntitlementGrant(e));
            }
        }

        state.entitled.insert(key, entitlement.clone());
        if !product.kind.is_repurchasable() {
            state.owned.insert(product.id.clone());
        }
        if let Some(request) = state.in_flight.get_mut(&product.id) {
            request.transaction_id = Some(claim.transaction_id.clone());
        }
        state.archive(&product.id, PurchaseStatus::Entitled);

        self.inner.gateway.finish_transaction(&claim).await;
        drop(state);

        info!(
            transaction_id = %entitlement.transaction_id,
            request_id = ?entitlement.request_id,
            "Purchase entitled"
        );
        self.emit(PurchaseEvent::Entitled(entitlement.clone()));

        Ok(CompletionOutcome::Entitled(entitlement))
    }

    /// The store gave up on a purchase
    #[instrument(skip(self))]
    pub async fn on_purchase_failed(&self, product_id: &str, reason: FailureReason) {
        let request_id = {
            let mut state = self.lock().await;
            if let Some(request) = state.in_flight.get_mut(product_id) {
                request.failure = Some(reason);
            }
            state.archive(product_id, PurchaseStatus::Failed)
        };

        match request_id {
            Some(request_id) => {
                info!(request_id = %request_id, reason = reason.as_str(), "Purchase failed")
            }
            None => warn!(reason = reason.as_str(), "Failure for a product with no purchase in flight"),
        }

        self.emit(PurchaseEvent::Failed {
            request_id,
            product_id: product_id.to_string(),
            reason,
        });
    }

    /// The store is waiting on external approval; the request stays in flight
    #[instrument(skip(self))]
    pub async fn on_purchase_deferred(&self, product_id: &str) {
        Self::mark_deferred(&mut *self.lock().await, product_id);
        info!("Purchase deferred");
        self.emit(PurchaseEvent::Deferred {
            product_id: product_id.to_string(),
        });
    }

    /// Ask the store to re-deliver earlier purchases.
    ///
    /// Restored items arrive as ordinary completions.
    #[instrument(skip(self), fields(platform = %self.platform()))]
    pub async fn restore(&self) -> Result<RestoreOutcome> {
        let mut state = self.lock().await;
        if state.phase != ControllerPhase::Ready {
            return Err(PurchaseError::NotReady);
        }

        match self.inner.gateway.restore_capability() {
            RestoreCapability::Explicit => {}
            RestoreCapability::Automatic => {
                debug!("Platform restores purchases automatically on initialization");
                return Ok(RestoreOutcome::HandledAutomatically);
            }
            RestoreCapability::Unsupported => {
                return Err(PurchaseError::RestoreNotSupported {
                    platform: self.platform(),
                });
            }
        }

        if state.restoring {
            return Err(PurchaseError::RestoreInProgress);
        }
        state.restoring = true;
        drop(state);

        info!("Restoring purchases");
        let controller = self.clone();
        tokio::spawn(async move {
            let accepted = match controller.inner.gateway.restore().await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Store refused restore: {}", e);
                    false
                }
            };
            controller.on_restore_finished(accepted).await;
        });

        Ok(RestoreOutcome::Requested)
    }

    pub async fn on_restore_finished(&self, accepted: bool) {
        self.lock().await.restoring = false;
        if accepted {
            // Restored items, if any, come as completions
            info!("Restore finished");
        } else {
            warn!("Restore failed");
        }
        self.emit(PurchaseEvent::RestoreFinished { accepted });
    }

    /// Apply store events until the gateway drops its sender
    pub async fn run(self, mut events: StoreEventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_store_event(event).await;
        }
        debug!("Store event channel closed");
    }

    pub async fn handle_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::PurchaseCompleted(receipt) => {
                let product_id = receipt.product_id.clone();
                // Rejections and grants are already published as events
                if let Err(e) = self.on_purchase_completed(receipt).await {
                    debug!(%product_id, code = e.code(), "Completion not entitled: {}", e);
                }
            }
            StoreEvent::PurchaseFailed { product_id, reason } => {
                self.on_purchase_failed(&product_id, reason).await
            }
            StoreEvent::PurchaseDeferred { product_id } => {
                self.on_purchase_deferred(&product_id).await
            }
            StoreEvent::RestoreFinished { accepted } => self.on_restore_finished(accepted).await,
        }
    }

    pub async fn phase(&self) -> ControllerPhase {
        self.lock().await.phase.clone()
    }

    pub async fn is_restoring(&self) -> bool {
        self.lock().await.restoring
    }

    /// Look up a request, in flight or archived
    pub async fn request(&self, request_id: Uuid) -> Option<PurchaseRequest> {
        let state = self.lock().await;
        state
            .in_flight
            .values()
            .chain(state.history.iter().rev())
            .find(|r| r.request_id == request_id)
            .cloned()
    }

    pub async fn in_flight(&self, product_id: &str) -> Option<PurchaseRequest> {
        self.lock().await.in_flight.get(product_id).cloned()
    }

    pub async fn history(&self) -> Vec<PurchaseRequest> {
        self.lock().await.history.clone()
    }

    /// Whether a non-consumable or subscription was granted this session
    pub async fn is_entitled(&self, product_id: &str) -> bool {
        self.lock().await.owned.contains(product_id)
    }

    pub async fn entitlement(&self, platform: IAPPlatform, transaction_id: &str) -> Option<Entitlement> {
        self.lock()
            .await
            .entitled
            .get(&(platform, transaction_id.to_string()))
            .cloned()
    }

    fn reject(
        &self,
        state: &mut ControllerState,
        product_id: &str,
        error: ReceiptValidationError,
    ) -> PurchaseError {
        let request_id = state.archive(product_id, PurchaseStatus::Rejected);
        warn!(
            request_id = ?request_id,
            kind = error.kind.code(),
            "Purchase rejected: {}",
            error.detail
        );
        self.emit(PurchaseEvent::Rejected {
            request_id,
            product_id: product_id.to_string(),
            error: error.clone(),
        });
        PurchaseError::ReceiptValidation(error)
    }

    async fn acknowledge_duplicate(
        &self,
        state: &mut ControllerState,
        product: &ProductDefinition,
        claim: &ValidatedClaim,
    ) -> CompletionOutcome {
        // A re-delivered old transaction does not settle a newer request
        if let Some(request) = state.in_flight.get_mut(&product.id) {
            if request.status == PurchaseStatus::AwaitingValidation {
                request.transition(PurchaseStatus::Pending);
            }
        }
        if !product.kind.is_repurchasable() {
            state.owned.insert(product.id.clone());
        }

        self.inner.gateway.finish_transaction(claim).await;
        info!(transaction_id = %claim.transaction_id, "Transaction already entitled; acknowledged");

        CompletionOutcome::AlreadyEntitled {
            transaction_id: claim.transaction_id.clone(),
        }
    }

    fn mark_deferred(state: &mut ControllerState, product_id: &str) {
        if let Some(request) = state.in_flight.get_mut(product_id) {
            request.deferred = true;
            request.transition(PurchaseStatus::Pending);
        }
    }
}
