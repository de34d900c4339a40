use crate::{
    config::{TrustBundleConfig, ValidationConfig},
    error::{ReceiptValidationError, ValidationErrorKind},
    models::{
        common::IAPPlatform,
        receipt::{GooglePurchaseState, PlatformDetails, Receipt, ValidatedClaim},
    },
};
use anyhow::{anyhow, bail, Context};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use jsonwebtoken::{
    decode, decode_header, errors::ErrorKind, jwk::JwkSet, Algorithm, DecodingKey, Validation,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

/// Verifies one platform's receipt format
pub trait ReceiptVerifier: Send + Sync {
    fn verify(&self, receipt: &Receipt) -> Result<ValidatedClaim, ReceiptValidationError>;
}

/// Platform key material a receipt signature must chain to
#[derive(Clone)]
pub struct TrustBundle {
    algorithm: Algorithm,
    keys: Vec<TrustedKey>,
}

#[derive(Clone)]
struct TrustedKey {
    key_id: Option<String>,
    key: DecodingKey,
}

impl TrustBundle {
    pub fn new(algorithm: Algorithm, key: DecodingKey) -> Self {
        Self {
            algorithm,
            keys: vec![TrustedKey { key_id: None, key }],
        }
    }

    pub fn from_secret(algorithm: Algorithm, secret: &[u8]) -> Self {
        Self::new(algorithm, DecodingKey::from_secret(secret))
    }

    /// Every key in the set that can be turned into a decoding key, addressed by `kid`
    pub fn from_jwks(algorithm: Algorithm, jwks: &JwkSet) -> anyhow::Result<Self> {
        let keys = jwks
            .keys
            .iter()
            .map(|jwk| {
                Ok(TrustedKey {
                    key_id: jwk.common.key_id.clone(),
                    key: DecodingKey::from_jwk(jwk)?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        if keys.is_empty() {
            bail!("JWKS contains no keys");
        }

        Ok(Self { algorithm, keys })
    }

    pub fn from_config(config: &TrustBundleConfig) -> anyhow::Result<Self> {
        let algorithm = Algorithm::from_str(&config.algorithm)
            .map_err(|e| anyhow!("Unknown algorithm {}: {}", config.algorithm, e))?;

        let mut bundle = if let Some(secret) = &config.secret {
            Self::from_secret(algorithm, secret.as_bytes())
        } else if let Some(pem) = &config.public_key_pem {
            let pem = pem.as_bytes();
            let key = match algorithm {
                Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem)?,
                Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem)?,
                Algorithm::EdDSA => DecodingKey::from_ed_pem(pem)?,
                Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                    bail!("HMAC algorithms take a secret, not a public key")
                }
            };
            Self::new(algorithm, key)
        } else if let Some(path) = &config.jwks_path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read JWKS from {}", path))?;
            let jwks: JwkSet = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid JWKS in {}", path))?;
            Self::from_jwks(algorithm, &jwks)?
        } else {
            bail!("Trust bundle needs one of secret, public_key_pem or jwks_path");
        };

        if let Some(key_id) = &config.key_id {
            bundle = bundle.with_key_id(key_id.clone());
        }

        Ok(bundle)
    }

    /// Name the single key in this bundle
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        let key_id = key_id.into();
        if let [only] = self.keys.as_mut_slice() {
            only.key_id = Some(key_id);
        }
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// An unnamed key matches any `kid`; a named key only its own
    fn key_for(&self, key_id: Option<&str>) -> Option<&DecodingKey> {
        match key_id {
            Some(kid) => self
                .keys
                .iter()
                .find(|k| k.key_id.as_deref() == Some(kid))
                .or_else(|| self.keys.iter().find(|k| k.key_id.is_none()))
                .map(|k| &k.key),
            None => self.keys.first().map(|k| &k.key),
        }
    }
}

/// Signed transaction payload carried by App Store style receipts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStoreTransaction {
    pub transaction_id: String,
    #[serde(default)]
    pub original_transaction_id: Option<String>,
    #[serde(default)]
    pub bundle_id: Option<String>,
    pub product_id: String,
    /// Milliseconds since the epoch
    pub purchase_date: i64,
    #[serde(default)]
    pub expires_date: Option<i64>,
    #[serde(default)]
    pub revocation_date: Option<i64>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub in_app_ownership_type: Option<String>, // "PURCHASED" or "FAMILY_SHARED"
    #[serde(default)]
    pub offer_type: Option<u8>,
    #[serde(default)]
    pub is_trial_period: Option<bool>,
}

/// Google Play purchase data, the `json` half of a Play receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GooglePlayPurchase {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub package_name: Option<String>,
    pub product_id: String,
    pub purchase_time: i64,
    #[serde(default)]
    pub purchase_state: i32,
    pub purchase_token: String,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub auto_renewing: Option<bool>,
    #[serde(default)]
    pub expiry_time_millis: Option<i64>,
    #[serde(default)]
    pub user_cancellation_time_millis: Option<i64>,
}

/// Play receipt envelope: purchase JSON plus its base64 signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GooglePlayEnvelope {
    pub json: String,
    pub signature: String,
}

/// Verifies JWS-signed transactions (App Store, Mac App Store, fake store)
pub struct JwsReceiptVerifier {
    bundle: TrustBundle,
    app_identifier: Option<String>,
}

impl JwsReceiptVerifier {
    pub fn new(bundle: TrustBundle, app_identifier: Option<String>) -> Self {
        Self {
            bundle,
            app_identifier,
        }
    }
}

impl ReceiptVerifier for JwsReceiptVerifier {
    fn verify(&self, receipt: &Receipt) -> Result<ValidatedClaim, ReceiptValidationError> {
        let token = std::str::from_utf8(&receipt.payload)
            .map_err(|_| ReceiptValidationError::malformed("receipt is not UTF-8"))?
            .trim();

        // 1. Read the header to find the key ID (kid)
        let header = decode_header(token)
            .map_err(|e| ReceiptValidationError::malformed(format!("invalid JWS header: {}", e)))?;

        // 2. Find the matching key
        let key = self.bundle.key_for(header.kid.as_deref()).ok_or_else(|| {
            ReceiptValidationError::tampered(format!(
                "key id {:?} is not in the trust bundle",
                header.kid
            ))
        })?;

        // 3. Signature only; transactions carry no exp/aud
        let mut validation = Validation::new(self.bundle.algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        // 4. Decode and verify
        let transaction = decode::<AppStoreTransaction>(token, key, &validation)
            .map_err(|e| jws_error(&e))?
            .claims;

        check_app_identifier(self.app_identifier.as_deref(), transaction.bundle_id.as_deref())?;

        let in_trial_period = transaction.is_trial_period.unwrap_or(false);
        Ok(ValidatedClaim {
            platform: receipt.platform,
            product_id: transaction.product_id,
            transaction_id: transaction.transaction_id,
            purchase_date: from_millis(transaction.purchase_date)?,
            expires_date: transaction.expires_date.map(from_millis).transpose()?,
            cancellation_date: transaction.revocation_date.map(from_millis).transpose()?,
            quantity: transaction.quantity.unwrap_or(1),
            details: PlatformDetails::AppStore {
                original_transaction_id: transaction.original_transaction_id,
                bundle_id: transaction.bundle_id,
                ownership_type: transaction.in_app_ownership_type,
                offer_type: transaction.offer_type,
                in_trial_period,
            },
        })
    }
}

/// Verifies Google Play receipts (purchase JSON signed with the app's key)
pub struct GooglePlayVerifier {
    bundle: TrustBundle,
    app_identifier: Option<String>,
}

impl GooglePlayVerifier {
    pub fn new(bundle: TrustBundle, app_identifier: Option<String>) -> Self {
        Self {
            bundle,
            app_identifier,
        }
    }
}

impl ReceiptVerifier for GooglePlayVerifier {
    fn verify(&self, receipt: &Receipt) -> Result<ValidatedClaim, ReceiptValidationError> {
        let envelope: GooglePlayEnvelope = serde_json::from_slice(&receipt.payload)
            .map_err(|e| ReceiptValidationError::malformed(format!("invalid receipt envelope: {}", e)))?;

        let signature = STANDARD
            .decode(envelope.signature.trim())
            .map_err(|e| ReceiptValidationError::malformed(format!("invalid signature encoding: {}", e)))?;

        let key = self
            .bundle
            .key_for(None)
            .ok_or_else(|| ReceiptValidationError::missing_secret(receipt.platform))?;

        let verified = jsonwebtoken::crypto::verify(
            &URL_SAFE_NO_PAD.encode(signature),
            envelope.json.as_bytes(),
            key,
            self.bundle.algorithm,
        )
        .map_err(|e| ReceiptValidationError::tampered(format!("signature check failed: {}", e)))?;

        if !verified {
            return Err(ReceiptValidationError::tampered("signature mismatch"));
        }

        let purchase: GooglePlayPurchase = serde_json::from_str(&envelope.json)
            .map_err(|e| ReceiptValidationError::malformed(format!("invalid purchase data: {}", e)))?;

        check_app_identifier(self.app_identifier.as_deref(), purchase.package_name.as_deref())?;

        let purchase_state = GooglePurchaseState::from_code(purchase.purchase_state).ok_or_else(|| {
            ReceiptValidationError::malformed(format!(
                "unknown purchase state {}",
                purchase.purchase_state
            ))
        })?;

        // Test purchases have no order id; the token is unique either way
        let transaction_id = purchase
            .order_id
            .clone()
            .unwrap_or_else(|| purchase.purchase_token.clone());

        Ok(ValidatedClaim {
            platform: receipt.platform,
            product_id: purchase.product_id,
            transaction_id,
            purchase_date: from_millis(purchase.purchase_time)?,
            expires_date: purchase.expiry_time_millis.map(from_millis).transpose()?,
            cancellation_date: purchase
                .user_cancellation_time_millis
                .map(from_millis)
                .transpose()?,
            quantity: purchase.quantity.unwrap_or(1),
            details: PlatformDetails::GooglePlay {
                order_id: purchase.order_id,
                package_name: purchase.package_name,
                purchase_token: purchase.purchase_token,
                purchase_state,
                auto_renewing: purchase.auto_renewing,
            },
        })
    }
}

/// Dispatches receipts to the verifier registered for their platform
#[derive(Default)]
pub struct ReceiptValidator {
    verifiers: HashMap<IAPPlatform, Arc<dyn ReceiptVerifier>>,
}

impl ReceiptValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ValidationConfig) -> anyhow::Result<Self> {
        let mut validator = Self::new();
        let app_identifier = config.app_identifier.clone();

        if let Some(apple) = &config.apple {
            let verifier: Arc<dyn ReceiptVerifier> = Arc::new(JwsReceiptVerifier::new(
                TrustBundle::from_config(apple).context("apple trust bundle")?,
                app_identifier.clone(),
            ));
            validator.register_shared(IAPPlatform::AppStore, verifier.clone());
            validator.register_shared(IAPPlatform::MacAppStore, verifier);
        }

        if let Some(google) = &config.google {
            validator.register(
                IAPPlatform::GooglePlay,
                GooglePlayVerifier::new(
                    TrustBundle::from_config(google).context("google trust bundle")?,
                    app_identifier.clone(),
                ),
            );
        }

        if let Some(fake) = &config.fake {
            validator.register(
                IAPPlatform::Fake,
                JwsReceiptVerifier::new(
                    TrustBundle::from_config(fake).context("fake store trust bundle")?,
                    app_identifier,
                ),
            );
        }

        info!(
            platforms = ?validator.verifiers.keys().collect::<Vec<_>>(),
            "Configured receipt verifiers"
        );

        Ok(validator)
    }

    pub fn register(&mut self, platform: IAPPlatform, verifier: impl ReceiptVerifier + 'static) {
        self.register_shared(platform, Arc::new(verifier));
    }

    pub fn register_shared(&mut self, platform: IAPPlatform, verifier: Arc<dyn ReceiptVerifier>) {
        self.verifiers.insert(platform, verifier);
    }

    /// Verify a receipt and extract its claims
    #[instrument(skip(self, receipt), fields(platform = %receipt.platform, product_id = %receipt.product_id))]
    pub fn validate(&self, receipt: Receipt) -> Result<ValidatedClaim, ReceiptValidationError> {
        let verifier = self.verifiers.get(&receipt.platform).ok_or_else(|| {
            warn!("No trust bundle for platform; refusing receipt");
            ReceiptValidationError::missing_secret(receipt.platform)
        })?;

        match verifier.verify(&receipt) {
            Ok(claim) => {
                debug!(
                    transaction_id = %claim.transaction_id,
                    store_product_id = %claim.product_id,
                    purchase_date = %claim.purchase_date,
                    "Receipt verified"
                );
                Ok(claim)
            }
            Err(e) => {
                warn!(
                    fingerprint = %receipt.fingerprint(),
                    kind = e.kind.code(),
                    "Receipt rejected: {}",
                    e.detail
                );
                Err(e)
            }
        }
    }
}

fn jws_error(error: &jsonwebtoken::errors::Error) -> ReceiptValidationError {
    match error.kind() {
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => ReceiptValidationError::malformed(error.to_string()),
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidAlgorithmName
        | ErrorKind::InvalidKeyFormat => ReceiptValidationError::tampered(error.to_string()),
        _ => ReceiptValidationError {
            kind: ValidationErrorKind::TamperedOrForged,
            detail: format!("JWS verification failed: {}", error),
        },
    }
}

fn check_app_identifier(
    expected: Option<&str>,
    actual: Option<&str>,
) -> Result<(), ReceiptValidationError> {
    match expected {
        Some(expected) if actual != Some(expected) => Err(ReceiptValidationError::tampered(format!(
            "receipt issued for {:?}, expected {}",
            actual, expected
        ))),
        _ => Ok(()),
    }
}

fn from_millis(ms: i64) -> Result<OffsetDateTime, ReceiptValidationError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| ReceiptValidationError::malformed(format!("invalid timestamp {}: {}", ms, e)))
}
