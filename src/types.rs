use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dom::NodeId;

// ---------------------------------------------------------------------------
// Conversion table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionKind {
    Fiat,
    Token,
}

impl std::fmt::Display for ConversionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConversionKind::Fiat => "fiat",
            ConversionKind::Token => "token",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionSpec {
    pub key: &'static str,
    pub kind: ConversionKind,
    pub symbol: &'static str,
    pub display_name: &'static str,
    /// Only set for `ConversionKind::Token`.
    pub token_address: Option<&'static str>,
}

/// Selectable display currencies. Keys are unique across both kinds.
pub const CONVERSIONS: &[ConversionSpec] = &[
    ConversionSpec { key: "usd", kind: ConversionKind::Fiat, symbol: "$", display_name: "US Dollar", token_address: None },
    ConversionSpec { key: "eur", kind: ConversionKind::Fiat, symbol: "€", display_name: "Euro", token_address: None },
    ConversionSpec { key: "gbp", kind: ConversionKind::Fiat, symbol: "£", display_name: "British Pound", token_address: None },
    ConversionSpec { key: "brl", kind: ConversionKind::Fiat, symbol: "R$", display_name: "Brazilian Real", token_address: None },
    ConversionSpec { key: "jpy", kind: ConversionKind::Fiat, symbol: "¥", display_name: "Japanese Yen", token_address: None },
    ConversionSpec {
        key: "sol",
        kind: ConversionKind::Token,
        symbol: "◎",
        display_name: "Solana",
        token_address: Some("So11111111111111111111111111111111111111112"),
    },
    ConversionSpec {
        key: "usdc",
        kind: ConversionKind::Token,
        symbol: "USDC ",
        display_name: "USD Coin",
        token_address: Some("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"),
    },
];

pub const DEFAULT_CONVERSION: &str = "usd";

pub fn conversion_spec(key: &str) -> Option<&'static ConversionSpec> {
    CONVERSIONS.iter().find(|c| c.key == key)
}

pub fn all_conversion_keys() -> Vec<String> {
    CONVERSIONS.iter().map(|c| c.key.to_string()).collect()
}

/// token address → currency code → rate. Replaced wholesale, never patched.
pub type RateSnapshot = HashMap<String, HashMap<String, f64>>;

// ---------------------------------------------------------------------------
// Marketplaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    Official,
    MagicEden,
    Tensor,
}

impl Marketplace {
    pub const ALL: [Marketplace; 3] = [Marketplace::Official, Marketplace::MagicEden, Marketplace::Tensor];

    pub fn label(&self) -> &'static str {
        match self {
            Marketplace::Official => "Market",
            Marketplace::MagicEden => "ME",
            Marketplace::Tensor => "TNSR",
        }
    }

    /// Listing URL for one item. `collection` comes from [`collection_slug`].
    pub fn listing_url(&self, official_base: &str, item_id: &str, collection: &str) -> String {
        match self {
            Marketplace::Official => format!("{official_base}/marketplace/{collection}/{item_id}"),
            Marketplace::MagicEden => {
                format!("https://magiceden.io/marketplace/stable_{collection}?search={item_id}")
            }
            Marketplace::Tensor => {
                format!("https://www.tensor.trade/trade/stable_{collection}?search={item_id}")
            }
        }
    }
}

impl std::fmt::Display for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Marketplace::Official => "official",
            Marketplace::MagicEden => "magiceden",
            Marketplace::Tensor => "tensor",
        };
        write!(f, "{s}")
    }
}

/// Generation 0 horses are listed under the genesis collection, offspring per generation.
pub fn collection_slug(generation: u32) -> String {
    if generation == 0 {
        "genesis".to_string()
    } else {
        format!("gen-{generation}")
    }
}

// ---------------------------------------------------------------------------
// Decorations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecorationKind {
    Balance,
    MarketLinks,
    EnergyInfo,
}

impl DecorationKind {
    pub fn marker(&self) -> &'static str {
        use crate::config::*;
        match self {
            DecorationKind::Balance => BALANCE_MARKER,
            DecorationKind::MarketLinks => MARKET_LINKS_MARKER,
            DecorationKind::EnergyInfo => ENERGY_MARKER,
        }
    }
}

impl std::fmt::Display for DecorationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecorationKind::Balance => "balance",
            DecorationKind::MarketLinks => "market_links",
            DecorationKind::EnergyInfo => "energy_info",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Item records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ItemStatus {
    #[default]
    Idle,
    Working,
    Racing,
    Resting,
    Other(String),
}

impl ItemStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" | "" => ItemStatus::Idle,
            "working" | "at work" => ItemStatus::Working,
            "racing" => ItemStatus::Racing,
            "resting" => ItemStatus::Resting,
            other => ItemStatus::Other(other.to_string()),
        }
    }

    /// Busy items consume energy instead of recovering it.
    pub fn is_active(&self) -> bool {
        matches!(self, ItemStatus::Working | ItemStatus::Racing)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Idle => write!(f, "idle"),
            ItemStatus::Working => write!(f, "working"),
            ItemStatus::Racing => write!(f, "racing"),
            ItemStatus::Resting => write!(f, "resting"),
            ItemStatus::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatPair {
    pub base: f64,
    pub bonus: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Energy {
    pub current: f64,
    pub max: f64,
}

/// Parsed snapshot of one item card. Disposable: recomputed on every scan,
/// the DOM text stays the source of truth.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemRecord {
    pub id: String,
    pub name: String,
    pub level: u32,
    pub power: f64,
    pub spirit: StatPair,
    pub speed: StatPair,
    pub energy: Energy,
    pub status: ItemStatus,
    pub generation: u32,
    pub breeds_used: u32,
    pub breeds_total: u32,
    pub items: Vec<String>,
    /// Non-owning reference to the card; may stop resolving at any time.
    pub dom_node: Option<NodeId>,
}

// ---------------------------------------------------------------------------
// Channel message types
// ---------------------------------------------------------------------------

/// Routed to the item decorator's loop.
#[derive(Debug, Clone)]
pub enum DecoratorCommand {
    /// Run one full reconciliation pass now.
    Reconcile,
    /// Re-extract and re-decorate a single card.
    Refresh(NodeId),
    /// Strip every decoration of these kinds.
    Detach(Vec<DecorationKind>),
}

/// Routed to the balance watcher's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherCommand {
    /// Suspected navigation: look the balance element up again.
    Rediscover,
    /// Feature settings changed: rebuild or remove the decoration.
    SettingsChanged,
    /// A new rate snapshot replaced the old one.
    RatesUpdated,
}
