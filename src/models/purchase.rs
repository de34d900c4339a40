use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    common::{IAPPlatform, ProductKind},
    product::{PayoutDefinition, PayoutType},
    subscription::SubscriptionStatus,
};
use crate::error::{InitializationError, ReceiptValidationError};

/// Lifecycle status of a single purchase request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    /// Submitted to the store, waiting for completion or failure
    Pending,
    /// Receipt received, being validated
    AwaitingValidation,
    Entitled,
    /// Receipt failed validation; nothing granted
    Rejected,
    /// Store reported a failure; request discarded
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub request_id: Uuid,
    pub product_id: String,
    pub status: PurchaseStatus,
    /// Store is waiting on external approval (e.g. Ask to Buy)
    pub deferred: bool,
    pub transaction_id: Option<String>,
    pub failure: Option<FailureReason>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PurchaseRequest {
    pub fn new(product_id: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            request_id: Uuid::new_v4(),
            product_id: product_id.into(),
            status: PurchaseStatus::Pending,
            deferred: false,
            transaction_id: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn transition(&mut self, status: PurchaseStatus) {
        self.status = status;
        self.updated_at = OffsetDateTime::now_utc();
    }
}

/// Why the store gave up on a purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    PaymentDeclined,
    ProductUnavailable,
    Unknown,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentDeclined => "payment_declined",
            Self::ProductUnavailable => "product_unavailable",
            Self::Unknown => "unknown",
        }
    }
}

/// Payout actually granted for one transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutGrant {
    pub payout_type: PayoutType,
    pub subtype: String,
    pub quantity: f64,
    pub data: Option<String>,
}

impl PayoutGrant {
    /// Scale a definition by the number of units bought in the transaction
    pub fn from_definition(definition: &PayoutDefinition, units: u32) -> Self {
        Self {
            payout_type: definition.payout_type,
            subtype: definition.subtype.clone(),
            quantity: definition.quantity * f64::from(units.max(1)),
            data: definition.data.clone(),
        }
    }
}

/// Durable grant produced by a successfully validated purchase
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    /// None when the completion arrived without an explicit purchase (restore, external)
    pub request_id: Option<Uuid>,
    pub product_id: String,
    pub kind: ProductKind,
    pub platform: IAPPlatform,
    pub transaction_id: String,
    pub payout: Option<PayoutGrant>,
    pub subscription: Option<SubscriptionStatus>,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
}

/// Result of handling a completion callback
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Entitled(Entitlement),
    /// Transaction was entitled earlier; acknowledged again, nothing granted
    AlreadyEntitled { transaction_id: String },
    /// Verified, but the store has not collected payment yet
    Deferred { product_id: String },
}

/// Result of a restore request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Sent to the store; restored items arrive as completions
    Requested,
    /// Platform re-delivers purchases on initialization
    HandledAutomatically,
}

/// Controller lifecycle phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerPhase {
    Uninitialized,
    Ready,
    InitializationFailed(InitializationError),
}

/// Notifications published by the purchase controller
#[derive(Debug, Clone)]
pub enum PurchaseEvent {
    Initialized,
    InitializationFailed(InitializationError),
    PurchaseStarted {
        request_id: Uuid,
        product_id: String,
    },
    Deferred {
        product_id: String,
    },
    Entitled(Entitlement),
    Rejected {
        request_id: Option<Uuid>,
        product_id: String,
        error: ReceiptValidationError,
    },
    Failed {
        request_id: Option<Uuid>,
        product_id: String,
        reason: FailureReason,
    },
    RestoreFinished {
        accepted: bool,
    },
}
