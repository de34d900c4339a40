use crate::models::common::IAPPlatform;

#[derive(Debug, thiserror::Error)]
pub enum PurchaseError {
    #[error("Store is not initialized")]
    NotReady,

    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    #[error("A purchase of {0} is already in flight")]
    DuplicatePurchaseInFlight(String),

    #[error(transparent)]
    Initialization(#[from] InitializationError),

    #[error(transparent)]
    ReceiptValidation(#[from] ReceiptValidationError),

    #[error("Restore is not supported on {platform}")]
    RestoreNotSupported { platform: IAPPlatform },

    #[error("A restore is already in progress")]
    RestoreInProgress,

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("Failed to grant entitlement: {0}")]
    EntitlementGrant(anyhow::Error),
}

impl PurchaseError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            PurchaseError::NotReady => "NOT_READY",
            PurchaseError::UnknownProduct(_) => "UNKNOWN_PRODUCT",
            PurchaseError::DuplicatePurchaseInFlight(_) => "DUPLICATE_PURCHASE_IN_FLIGHT",
            PurchaseError::Initialization(_) => "INITIALIZATION_FAILED",
            PurchaseError::ReceiptValidation(ref e) => e.kind.code(),
            PurchaseError::RestoreNotSupported { .. } => "RESTORE_NOT_SUPPORTED",
            PurchaseError::RestoreInProgress => "RESTORE_IN_PROGRESS",
            PurchaseError::Subscription(_) => "NOT_A_SUBSCRIPTION",
            PurchaseError::EntitlementGrant(ref e) => {
                tracing::error!("Entitlement grant error: {:?}", e);
                "ENTITLEMENT_GRANT_FAILED"
            }
        }
    }

    /// Request errors are rejected locally before the store is contacted
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            PurchaseError::NotReady
                | PurchaseError::UnknownProduct(_)
                | PurchaseError::DuplicatePurchaseInFlight(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("Duplicate product: {0}")]
    DuplicateProduct(String),

    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    #[error("Store id {store_id} on {platform} is already used by {existing}")]
    DuplicateStoreId {
        platform: IAPPlatform,
        store_id: String,
        existing: String,
    },

    #[error("Invalid product definition {id}: {reason}")]
    InvalidDefinition { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitializationFailureReason {
    /// App is not configured on the publishing platform
    AppNotKnown,
    ServiceUnavailable,
    NoProducts,
}

impl InitializationFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppNotKnown => "app_not_known",
            Self::ServiceUnavailable => "service_unavailable",
            Self::NoProducts => "no_products",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "app_not_known" => Some(Self::AppNotKnown),
            "service_unavailable" => Some(Self::ServiceUnavailable),
            "no_products" => Some(Self::NoProducts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Store initialization failed: {}", reason.as_str())]
pub struct InitializationError {
    pub reason: InitializationFailureReason,
}

impl InitializationError {
    pub fn new(reason: InitializationFailureReason) -> Self {
        Self { reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationErrorKind {
    /// No trust bundle configured for the receipt's platform
    MissingSecret,
    /// Signature, algorithm or app identifier did not check out
    TamperedOrForged,
    MalformedPayload,
}

impl ValidationErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingSecret => "MISSING_SECRET",
            Self::TamperedOrForged => "TAMPERED_OR_FORGED",
            Self::MalformedPayload => "MALFORMED_PAYLOAD",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid receipt ({}): {detail}", kind.code())]
pub struct ReceiptValidationError {
    pub kind: ValidationErrorKind,
    pub detail: String,
}

impl ReceiptValidationError {
    pub fn missing_secret(platform: IAPPlatform) -> Self {
        Self {
            kind: ValidationErrorKind::MissingSecret,
            detail: format!("no trust bundle configured for {}", platform),
        }
    }

    pub fn tampered(detail: impl Into<String>) -> Self {
        Self {
            kind: ValidationErrorKind::TamperedOrForged,
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: ValidationErrorKind::MalformedPayload,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Product {0} is not a subscription")]
    NotASubscription(String),
}

/// Returned by a gateway that cannot restore
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Restore is not supported on {platform}")]
pub struct RestoreNotSupportedError {
    pub platform: IAPPlatform,
}

// Helper type for results
pub type Result<T> = std::result::Result<T, PurchaseError>;
