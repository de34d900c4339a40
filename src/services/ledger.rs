use crate::models::{common::IAPPlatform, purchase::Entitlement};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantResult {
    Granted,
    /// The transaction was already granted earlier
    AlreadyGranted,
}

/// Receives entitlements once their receipt has been validated
#[async_trait]
pub trait EntitlementSink: Send + Sync {
    async fn grant(&self, entitlement: &Entitlement) -> anyhow::Result<GrantResult>;
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Transaction {transaction_id} already recorded at {recorded_at}")]
    Conflict {
        transaction_id: String,
        recorded_at: OffsetDateTime,
    },
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub entitlement: Entitlement,
    pub recorded_at: OffsetDateTime,
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    by_transaction: HashMap<(IAPPlatform, String), usize>,
    // payout subtype -> accumulated quantity
    balances: HashMap<String, f64>,
    owned: HashSet<String>,
}

/// In-memory record of granted entitlements and payout balances
#[derive(Default)]
pub struct EntitlementLedger {
    state: RwLock<LedgerState>,
}

impl EntitlementLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entitlement; a transaction can only be recorded once.
    ///
    /// Returns the entry id and the new balance of the payout subtype (0 without payout).
    #[instrument(skip(self, entitlement), fields(product_id = %entitlement.product_id, transaction_id = %entitlement.transaction_id))]
    pub async fn record(&self, entitlement: Entitlement) -> Result<(Uuid, f64), LedgerError> {
        let mut state = self.state.write().await;
        let key = (entitlement.platform, entitlement.transaction_id.clone());

        if let Some(&index) = state.by_transaction.get(&key) {
            return Err(LedgerError::Conflict {
                transaction_id: entitlement.transaction_id,
                recorded_at: state.entries[index].recorded_at,
            });
        }

        let entry_id = Uuid::new_v4();
        let balance = match &entitlement.payout {
            Some(payout) => {
                let balance = state.balances.entry(payout.subtype.clone()).or_insert(0.0);
                *balance += payout.quantity;
                *balance
            }
            None => 0.0,
        };

        if !entitlement.kind.is_repurchasable() {
            state.owned.insert(entitlement.product_id.clone());
        }

        let index = state.entries.len();
        state.entries.push(LedgerEntry {
            entry_id,
            entitlement,
            recorded_at: OffsetDateTime::now_utc(),
        });
        state.by_transaction.insert(key, index);

        info!(entry_id = %entry_id, balance, "Recorded entitlement");

        Ok((entry_id, balance))
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.state.read().await.entries.clone()
    }

    pub async fn grant_count(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn balance(&self, subtype: &str) -> f64 {
        self.state
            .read()
            .await
            .balances
            .get(subtype)
            .copied()
            .unwrap_or(0.0)
    }

    /// Non-consumables and subscriptions ever granted
    pub async fn owns(&self, product_id: &str) -> bool {
        self.state.read().await.owned.contains(product_id)
    }
}

#[async_trait]
impl EntitlementSink for EntitlementLedger {
    async fn grant(&self, entitlement: &Entitlement) -> anyhow::Result<GrantResult> {
        match self.record(entitlement.clone()).await {
            Ok(_) => Ok(GrantResult::Granted),
            Err(LedgerError::Conflict { recorded_at, .. }) => {
                debug!(%recorded_at, "Entitlement already in ledger");
                Ok(GrantResult::AlreadyGranted)
            }
        }
    }
}
