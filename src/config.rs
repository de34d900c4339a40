use serde::Deserialize;
use std::collections::HashMap;

use crate::{
    error::CatalogError,
    models::{
        common::{IAPPlatform, ProductKind},
        product::{PayoutDefinition, PayoutType, ProductDefinition},
    },
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub validation: ValidationConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub catalog: Vec<CatalogEntryConfig>,
}

/// Settings for the simulated store used in development
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Platform the fake store impersonates (app_store, google_play, ...)
    pub platform: String,
    /// Identifier written into simulated receipts (bundle id / package name)
    #[serde(default)]
    pub app_identifier: Option<String>,
    pub signing_secret: String,
    /// app_not_known | service_unavailable | no_products
    #[serde(default)]
    pub fail_initialization: Option<String>,
    #[serde(default)]
    pub declined_products: Vec<String>,
    #[serde(default)]
    pub deferred_products: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Expected bundle id / package name; unchecked when absent
    #[serde(default)]
    pub app_identifier: Option<String>,
    #[serde(default)]
    pub apple: Option<TrustBundleConfig>,
    #[serde(default)]
    pub google: Option<TrustBundleConfig>,
    #[serde(default)]
    pub fake: Option<TrustBundleConfig>,
}

/// Key material for one platform. Exactly one of `secret`, `public_key_pem`
/// or `jwks_path` is expected.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustBundleConfig {
    /// JWS algorithm name, e.g. ES256, RS256, HS256
    pub algorithm: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub public_key_pem: Option<String>,
    #[serde(default)]
    pub jwks_path: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    /// Days after expiry during which access is kept
    #[serde(default = "default_grace_period_days")]
    pub grace_period_days: i64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            grace_period_days: default_grace_period_days(),
        }
    }
}

fn default_grace_period_days() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntryConfig {
    pub id: String,
    pub kind: String,
    /// Platform name -> store-specific id
    #[serde(default)]
    pub platform_ids: HashMap<String, String>,
    #[serde(default)]
    pub payout: Option<PayoutConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayoutConfig {
    pub payout_type: String,
    pub subtype: String,
    pub quantity: f64,
    #[serde(default)]
    pub data: Option<String>,
}

impl CatalogEntryConfig {
    pub fn to_definition(&self) -> Result<ProductDefinition, CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidDefinition {
            id: self.id.clone(),
            reason,
        };

        let kind = ProductKind::from_str(&self.kind)
            .ok_or_else(|| invalid(format!("unknown product kind '{}'", self.kind)))?;

        let mut definition = ProductDefinition::new(self.id.clone(), kind);

        for (platform_name, store_id) in &self.platform_ids {
            let platform = IAPPlatform::from_str(platform_name)
                .ok_or_else(|| invalid(format!("unknown platform '{}'", platform_name)))?;
            definition = definition.with_platform_id(platform, store_id.clone());
        }

        if let Some(payout) = &self.payout {
            let payout_type = match payout.payout_type.to_lowercase().as_str() {
                "currency" => PayoutType::Currency,
                "item" => PayoutType::Item,
                "resource" => PayoutType::Resource,
                "other" => PayoutType::Other,
                other => return Err(invalid(format!("unknown payout type '{}'", other))),
            };
            let mut payout_definition =
                PayoutDefinition::new(payout_type, payout.subtype.clone(), payout.quantity);
            payout_definition.data = payout.data.clone();
            definition = definition.with_payout(payout_definition);
        }

        Ok(definition)
    }
}

impl StoreConfig {
    pub fn platform(&self) -> Option<IAPPlatform> {
        IAPPlatform::from_str(&self.platform)
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for environment variable overrides)
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(true))
            .add_source(
                config::Environment::with_prefix("PURCHASEKIT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Parse a YAML document without touching the filesystem or environment
    pub fn from_yaml(yaml: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()
    }

    pub fn product_definitions(&self) -> Result<Vec<ProductDefinition>, CatalogError> {
        self.catalog.iter().map(CatalogEntryConfig::to_definition).collect()
    }
}
