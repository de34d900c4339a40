use serde::{Deserialize, Serialize};

/// IAP Platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IAPPlatform {
    AppStore,
    MacAppStore,
    GooglePlay,
    WindowsStore,
    Fake,
}

impl IAPPlatform {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "app_store" | "appstore" | "apple" => Some(Self::AppStore),
            "mac_app_store" | "macappstore" => Some(Self::MacAppStore),
            "google_play" | "googleplay" | "google" => Some(Self::GooglePlay),
            "windows_store" | "windowsstore" | "windows" => Some(Self::WindowsStore),
            "fake" => Some(Self::Fake),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppStore => "app_store",
            Self::MacAppStore => "mac_app_store",
            Self::GooglePlay => "google_play",
            Self::WindowsStore => "windows_store",
            Self::Fake => "fake",
        }
    }

    /// How previously granted purchases come back on this platform
    pub fn restore_capability(&self) -> RestoreCapability {
        match self {
            Self::AppStore | Self::MacAppStore => RestoreCapability::Explicit,
            Self::GooglePlay | Self::WindowsStore => RestoreCapability::Automatic,
            Self::Fake => RestoreCapability::Unsupported,
        }
    }
}

impl std::fmt::Display for IAPPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Consumable,
    NonConsumable,
    Subscription,
}

impl ProductKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "consumable" => Some(Self::Consumable),
            "non_consumable" | "nonconsumable" => Some(Self::NonConsumable),
            "subscription" => Some(Self::Subscription),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consumable => "consumable",
            Self::NonConsumable => "non_consumable",
            Self::Subscription => "subscription",
        }
    }

    /// Consumables can be bought again; everything else is owned once granted
    pub fn is_repurchasable(&self) -> bool {
        matches!(self, Self::Consumable)
    }
}

/// Restore behaviour reported by a store gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreCapability {
    /// The platform exposes a restore call; restored items arrive as completions
    Explicit,
    /// The platform re-delivers owned items on initialization by itself
    Automatic,
    Unsupported,
}
