use crate::{
    config::SubscriptionConfig,
    error::SubscriptionError,
    models::{
        common::ProductKind,
        receipt::ValidatedClaim,
        subscription::{IntroductoryPriceInfo, SubscriptionState, SubscriptionStatus},
    },
};
use time::{Duration, OffsetDateTime};

/// Derives renewal and expiry status from validated subscription claims
#[derive(Debug, Clone)]
pub struct SubscriptionEvaluator {
    grace_period: Duration,
}

impl Default for SubscriptionEvaluator {
    fn default() -> Self {
        Self::new(&SubscriptionConfig::default())
    }
}

impl SubscriptionEvaluator {
    pub fn new(config: &SubscriptionConfig) -> Self {
        Self {
            grace_period: Duration::days(config.grace_period_days.max(0)),
        }
    }

    pub fn evaluate(
        &self,
        claim: &ValidatedClaim,
        kind: ProductKind,
        intro_price: Option<&IntroductoryPriceInfo>,
    ) -> Result<SubscriptionStatus, SubscriptionError> {
        self.evaluate_at(claim, kind, intro_price, OffsetDateTime::now_utc())
    }

    /// Same as [`evaluate`](Self::evaluate) with an explicit evaluation time
    pub fn evaluate_at(
        &self,
        claim: &ValidatedClaim,
        kind: ProductKind,
        intro_price: Option<&IntroductoryPriceInfo>,
        now: OffsetDateTime,
    ) -> Result<SubscriptionStatus, SubscriptionError> {
        if kind != ProductKind::Subscription {
            return Err(SubscriptionError::NotASubscription(claim.product_id.clone()));
        }

        let cancelled = claim
            .cancellation_date
            .map(|cancelled_at| cancelled_at <= now)
            .unwrap_or(false);

        let is_auto_renewing = !cancelled && claim.auto_renewing().unwrap_or(true);

        let is_free_trial = match intro_price {
            // A window too long to represent is store noise, not a trial
            Some(info) => {
                info.is_free()
                    && info
                        .duration()
                        .and_then(|window| claim.purchase_date.checked_add(window))
                        .map(|trial_end| now < trial_end)
                        .unwrap_or(false)
            }
            None => claim.in_trial_period(),
        };

        let state = if cancelled {
            SubscriptionState::Cancelled
        } else {
            match claim.expires_date {
                Some(expires) if expires > now => SubscriptionState::Active,
                // Keep access for a while after a missed renewal
                Some(expires)
                    if expires
                        .checked_add(self.grace_period)
                        .map_or(true, |grace_end| now < grace_end) =>
                {
                    SubscriptionState::GracePeriod
                }
                Some(_) => SubscriptionState::Expired,
                None => SubscriptionState::Active,
            }
        };

        Ok(SubscriptionStatus {
            purchase_date: claim.purchase_date,
            expire_date: claim.expires_date,
            cancel_date: claim.cancellation_date,
            is_auto_renewing,
            is_free_trial,
            state,
        })
    }
}
