use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

use super::common::{IAPPlatform, ProductKind};

/// A purchasable catalog item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProductDefinition {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    pub kind: ProductKind,
    /// Store-specific ids; platforms not listed use `id`
    #[serde(default)]
    pub platform_ids: HashMap<IAPPlatform, String>,
    #[serde(default)]
    #[validate(nested)]
    pub payout: Option<PayoutDefinition>,
}

impl ProductDefinition {
    pub fn new(id: impl Into<String>, kind: ProductKind) -> Self {
        Self {
            id: id.into(),
            kind,
            platform_ids: HashMap::new(),
            payout: None,
        }
    }

    pub fn with_platform_id(mut self, platform: IAPPlatform, store_id: impl Into<String>) -> Self {
        self.platform_ids.insert(platform, store_id.into());
        self
    }

    pub fn with_payout(mut self, payout: PayoutDefinition) -> Self {
        self.payout = Some(payout);
        self
    }

    /// The id this product is known by on `platform`
    pub fn store_id(&self, platform: IAPPlatform) -> &str {
        self.platform_ids
            .get(&platform)
            .map(String::as_str)
            .unwrap_or(&self.id)
    }
}

/// Payout type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutType {
    Currency,
    Item,
    Resource,
    Other,
}

/// What a purchase pays out on top of the entitlement itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PayoutDefinition {
    pub payout_type: PayoutType,
    #[validate(length(max = 64))]
    pub subtype: String,
    #[validate(range(min = 0.0))]
    pub quantity: f64,
    #[serde(default)]
    #[validate(length(max = 1024))]
    pub data: Option<String>,
}

impl PayoutDefinition {
    pub fn new(payout_type: PayoutType, subtype: impl Into<String>, quantity: f64) -> Self {
        Self {
            payout_type,
            subtype: subtype.into(),
            quantity,
            data: None,
        }
    }
}
