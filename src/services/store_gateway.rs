//! Port to the remote purchasing backend.
//!
//! The gateway owns everything platform-specific about talking to a store.
//! Outcomes of purchases and restores are not returned from the calls that
//! start them; they arrive later as [`StoreEvent`]s on the channel handed to
//! [`StoreGateway::initialize`].

use crate::{
    error::{InitializationError, RestoreNotSupportedError},
    models::{
        common::{IAPPlatform, RestoreCapability},
        product::ProductDefinition,
        purchase::FailureReason,
        receipt::{Receipt, ValidatedClaim},
        subscription::IntroductoryPriceInfo,
    },
};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub type StoreEventSender = mpsc::UnboundedSender<StoreEvent>;
pub type StoreEventReceiver = mpsc::UnboundedReceiver<StoreEvent>;

/// Asynchronous notifications from the store
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A transaction completed (new, restored or delivered out of band)
    PurchaseCompleted(Receipt),
    PurchaseFailed {
        product_id: String,
        reason: FailureReason,
    },
    /// Waiting on external approval; a completion or failure follows later
    PurchaseDeferred { product_id: String },
    /// The store answered a restore request; items come as completions
    RestoreFinished { accepted: bool },
}

/// The store took the restore request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreAccepted;

/// Port for platform purchasing backends.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    fn platform(&self) -> IAPPlatform;

    fn restore_capability(&self) -> RestoreCapability {
        self.platform().restore_capability()
    }

    fn supports_explicit_restore(&self) -> bool {
        self.restore_capability() == RestoreCapability::Explicit
    }

    /// Connect to the store and register the catalog.
    ///
    /// Events for this session are sent on `events`.
    async fn initialize(
        &self,
        catalog: Vec<ProductDefinition>,
        events: StoreEventSender,
    ) -> Result<(), InitializationError>;

    /// Ask the store to start a purchase. An error means the request never
    /// reached the store.
    async fn initiate_purchase(&self, product: &ProductDefinition) -> anyhow::Result<()>;

    async fn restore(&self) -> Result<RestoreAccepted, RestoreNotSupportedError>;

    /// Acknowledge a processed transaction so the store stops redelivering it
    async fn finish_transaction(&self, claim: &ValidatedClaim);

    /// Introductory offer for a store-specific product id, if the store reports one
    fn introductory_price(&self, _store_id: &str) -> Option<IntroductoryPriceInfo> {
        None
    }
}
