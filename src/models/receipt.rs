use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use super::common::IAPPlatform;

/// Platform-issued proof of a transaction, as handed over by the gateway.
///
/// `product_id` is what the gateway claims was bought. It is not trusted;
/// validation reads the product from the signed payload instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub platform: IAPPlatform,
    pub product_id: String,
    pub payload: Vec<u8>,
}

impl Receipt {
    pub fn new(platform: IAPPlatform, product_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            platform,
            product_id: product_id.into(),
            payload: payload.into(),
        }
    }

    /// SHA256 of the payload, safe to put in logs
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.payload);
        format!("{:x}", hasher.finalize())
    }
}

/// Claims extracted from a receipt whose signature checked out
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedClaim {
    pub platform: IAPPlatform,
    /// Store-specific product id from the signed payload
    pub product_id: String,
    pub transaction_id: String,
    pub purchase_date: OffsetDateTime,
    pub expires_date: Option<OffsetDateTime>,
    pub cancellation_date: Option<OffsetDateTime>,
    pub quantity: u32,
    pub details: PlatformDetails,
}

impl ValidatedClaim {
    /// Key used to recognise re-delivery of the same transaction
    pub fn transaction_key(&self) -> (IAPPlatform, String) {
        (self.platform, self.transaction_id.clone())
    }

    /// True when the platform still waits on payment (e.g. Google pending purchases)
    pub fn is_pending(&self) -> bool {
        matches!(
            self.details,
            PlatformDetails::GooglePlay {
                purchase_state: GooglePurchaseState::Pending,
                ..
            }
        )
    }

    /// Platform's own auto-renew flag, when it reports one
    pub fn auto_renewing(&self) -> Option<bool> {
        match &self.details {
            PlatformDetails::GooglePlay { auto_renewing, .. } => *auto_renewing,
            PlatformDetails::AppStore { .. } => None,
        }
    }

    pub fn in_trial_period(&self) -> bool {
        match &self.details {
            PlatformDetails::AppStore {
                in_trial_period, ..
            } => *in_trial_period,
            PlatformDetails::GooglePlay { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformDetails {
    AppStore {
        original_transaction_id: Option<String>,
        bundle_id: Option<String>,
        /// "PURCHASED" or "FAMILY_SHARED"
        ownership_type: Option<String>,
        offer_type: Option<u8>,
        in_trial_period: bool,
    },
    GooglePlay {
        order_id: Option<String>,
        package_name: Option<String>,
        purchase_token: String,
        purchase_state: GooglePurchaseState,
        auto_renewing: Option<bool>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GooglePurchaseState {
    Purchased,
    Canceled,
    Pending,
}

impl GooglePurchaseState {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Purchased),
            1 => Some(Self::Canceled),
            2 => Some(Self::Pending),
            _ => None,
        }
    }
}
