use crate::error::{OverlayError, Result};

pub const RELAY_URL: &str = "http://127.0.0.1:8787/rates";

/// Mint address of the game's own token; every balance on the page is denominated in it.
pub const BASE_TOKEN_ADDRESS: &str = "StbLx9Vq4kQZ1uGQ3dm8nXhP2zYb7wRcT5eJfA6sHoof";

pub const MARKETPLACE_BASE_URL: &str = "https://play.stable.gg";

// ---------------------------------------------------------------------------
// Host DOM contract
// ---------------------------------------------------------------------------

/// Fixed id of the balance element.
pub const BALANCE_ELEMENT_ID: &str = "wallet-balance";

/// Repeating item cards carry a CSS-module class starting with this prefix.
pub const ITEM_CLASS_PREFIX: &str = "HorseCard_card__";

// ---------------------------------------------------------------------------
// Decoration markers
// ---------------------------------------------------------------------------

/// Every node we inject carries a class starting with this prefix.
pub const MARKER_PREFIX: &str = "so-";

/// Shared class on every injected node, nested ones included.
pub const DECORATION_CLASS: &str = "so-decoration";

pub const BALANCE_MARKER: &str = "so-balance";
pub const BALANCE_SELECT_CLASS: &str = "so-currency-select";
pub const BALANCE_VALUE_CLASS: &str = "so-balance-value";
pub const BALANCE_SYMBOL_CLASS: &str = "so-balance-symbol";
pub const BALANCE_ERROR_CLASS: &str = "so-balance-error";
pub const MARKET_LINKS_MARKER: &str = "so-market-links";
pub const ENERGY_MARKER: &str = "so-energy-delta";

/// Inline style reapplied to the balance decoration on every discovery.
pub const BALANCE_STYLE: &str = "margin-left:6px;display:inline-flex;gap:4px;align-items:center";

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Bounded wait for a single element to appear.
pub const DISCOVERY_TIMEOUT_MS: u64 = 5_000;

/// Quiet period before a suspected navigation triggers re-initialization.
pub const NAV_DEBOUNCE_MS: u64 = 500;

/// Consecutive observer faults before the supervisor disconnects.
pub const OBSERVER_ERROR_THRESHOLD: u32 = 5;

/// Delay before a tripped supervisor reconnects.
pub const OBSERVER_RECONNECT_MS: u64 = 30_000;

/// Full reconciliation cadence for item decorations.
pub const RECONCILE_INTERVAL_MS: u64 = 1_000;

/// Energy value poll cadence.
pub const POLL_INTERVAL_MS: u64 = 2_000;

/// Delay before the single retry of a failed balance render.
pub const RENDER_RETRY_MS: u64 = 3_000;

/// Timeout imposed on the rate relay, independent of the relay's own.
pub const RATE_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Channel capacity for internal command routing.
pub const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Energy model
// ---------------------------------------------------------------------------

pub mod energy_defaults {
    /// Energy restored per recovery cycle while idle.
    pub const RECOVERY: f64 = 10.0;
    /// Energy consumed per cycle while working.
    pub const WORK_DRAIN: f64 = 8.0;
}

#[derive(Debug, Clone)]
pub struct Config {
    pub relay_url: String,
    pub base_token_address: String,
    pub marketplace_base_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// JSON page fixture loaded into the harness DOM (PAGE_FIXTURE). Empty page when unset.
    pub page_fixture: Option<String>,
    /// Energy recovered per cycle (ENERGY_RECOVERY)
    pub energy_recovery: f64,
    /// Energy drained per cycle while working (ENERGY_WORK_DRAIN)
    pub energy_work_drain: f64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            relay_url: std::env::var("RELAY_URL").unwrap_or_else(|_| RELAY_URL.to_string()),
            base_token_address: std::env::var("BASE_TOKEN_ADDRESS")
                .unwrap_or_else(|_| BASE_TOKEN_ADDRESS.to_string()),
            marketplace_base_url: std::env::var("MARKETPLACE_BASE_URL")
                .unwrap_or_else(|_| MARKETPLACE_BASE_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "overlay.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| OverlayError::Config("API_PORT must be a valid port number".to_string()))?,
            page_fixture: std::env::var("PAGE_FIXTURE").ok().filter(|s| !s.is_empty()),
            energy_recovery: parse_energy("ENERGY_RECOVERY", energy_defaults::RECOVERY)?,
            energy_work_drain: parse_energy("ENERGY_WORK_DRAIN", energy_defaults::WORK_DRAIN)?,
        })
    }
}

fn parse_energy(var: &str, default: f64) -> Result<f64> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
            _ => Err(OverlayError::Config(format!(
                "{var} must be a non-negative number, got {raw:?}"
            ))),
        },
    }
}
