use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Derived renewal/expiry status of a subscription purchase
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    #[serde(with = "time::serde::rfc3339")]
    pub purchase_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expire_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_date: Option<OffsetDateTime>,
    pub is_auto_renewing: bool,
    pub is_free_trial: bool,
    pub state: SubscriptionState,
}

impl SubscriptionStatus {
    /// Whether the subscriber should currently have access
    pub fn is_subscribed(&self) -> bool {
        matches!(
            self.state,
            SubscriptionState::Active | SubscriptionState::GracePeriod
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    GracePeriod,
    Expired,
    Cancelled,
}

/// Introductory offer metadata as reported by the store for one product
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntroductoryPriceInfo {
    /// Decimal price string, "0" for a free trial
    pub introductory_price: String,
    #[serde(default)]
    pub introductory_price_locale: Option<String>,
    pub introductory_price_number_of_periods: u32,
    pub number_of_units: u32,
    pub unit: SubscriptionPeriodUnit,
}

impl IntroductoryPriceInfo {
    pub fn free_trial(number_of_units: u32, unit: SubscriptionPeriodUnit) -> Self {
        Self {
            introductory_price: "0".to_string(),
            introductory_price_locale: None,
            introductory_price_number_of_periods: 1,
            number_of_units,
            unit,
        }
    }

    pub fn is_free(&self) -> bool {
        self.introductory_price
            .trim()
            .parse::<f64>()
            .map(|price| price == 0.0)
            .unwrap_or(false)
    }

    /// Total length of the introductory window, None if it does not fit a `Duration`
    pub fn duration(&self) -> Option<Duration> {
        let units = i64::from(self.number_of_units)
            .checked_mul(i64::from(self.introductory_price_number_of_periods))?;
        self.unit
            .approximate_length()
            .checked_mul(i32::try_from(units).ok()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPeriodUnit {
    Day,
    Week,
    Month,
    Year,
}

impl SubscriptionPeriodUnit {
    fn approximate_length(&self) -> Duration {
        match self {
            Self::Day => Duration::days(1),
            Self::Week => Duration::weeks(1),
            Self::Month => Duration::days(30),
            Self::Year => Duration::days(365),
        }
    }
}
