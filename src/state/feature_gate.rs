use std::sync::RwLock;

use serde::Serialize;
use tracing::info;

use crate::settings::{keys, read_or, SettingsStore};
use crate::types::{all_conversion_keys, DecorationKind, Marketplace};

/// Effective feature toggles, read from the settings collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateSettings {
    pub converter_enabled: bool,
    pub enabled_currencies: Vec<String>,
    pub marketplace_enabled: bool,
    pub enabled_marketplaces: Vec<Marketplace>,
    pub energy_info_enabled: bool,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            converter_enabled: true,
            enabled_currencies: all_conversion_keys(),
            marketplace_enabled: true,
            enabled_marketplaces: Marketplace::ALL.to_vec(),
            energy_info_enabled: true,
        }
    }
}

impl GateSettings {
    pub async fn load(store: &dyn SettingsStore) -> Self {
        let d = Self::default();
        Self {
            converter_enabled: read_or(store, keys::CONVERTER_ENABLED, d.converter_enabled).await,
            enabled_currencies: read_or(store, keys::ENABLED_CURRENCIES, d.enabled_currencies).await,
            marketplace_enabled: read_or(store, keys::MARKETPLACE_ENABLED, d.marketplace_enabled).await,
            enabled_marketplaces: read_or(store, keys::ENABLED_MARKETPLACES, d.enabled_marketplaces).await,
            energy_info_enabled: read_or(store, keys::ENERGY_INFO_ENABLED, d.energy_info_enabled).await,
        }
    }

    /// Should decorations of `kind` currently be on the page?
    pub fn wants(&self, kind: DecorationKind) -> bool {
        match kind {
            DecorationKind::Balance => self.converter_enabled,
            DecorationKind::MarketLinks => {
                self.marketplace_enabled && !self.enabled_marketplaces.is_empty()
            }
            DecorationKind::EnergyInfo => self.energy_info_enabled,
        }
    }

    /// Kinds that must be stripped when moving from `self` to `next`: toggled
    /// off, or still on but rendered from a different configuration.
    pub fn to_detach(&self, next: &GateSettings) -> Vec<DecorationKind> {
        let mut out = Vec::new();
        for kind in [DecorationKind::Balance, DecorationKind::MarketLinks, DecorationKind::EnergyInfo] {
            let was = self.wants(kind);
            let now = next.wants(kind);
            let reconfigured = match kind {
                DecorationKind::MarketLinks => self.enabled_marketplaces != next.enabled_marketplaces,
                _ => false,
            };
            if was && (!now || reconfigured) {
                out.push(kind);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct GateTransition {
    pub previous: GateSettings,
    pub current: GateSettings,
}

impl GateTransition {
    pub fn to_detach(&self) -> Vec<DecorationKind> {
        self.previous.to_detach(&self.current)
    }

    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Answers "what should be decorated right now". Never touches the DOM.
pub struct FeatureGate {
    current: RwLock<GateSettings>,
}

impl FeatureGate {
    pub fn new(settings: GateSettings) -> Self {
        Self { current: RwLock::new(settings) }
    }

    pub async fn load(store: &dyn SettingsStore) -> Self {
        Self::new(GateSettings::load(store).await)
    }

    pub fn current(&self) -> GateSettings {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn wants(&self, kind: DecorationKind) -> bool {
        self.current.read().unwrap_or_else(|e| e.into_inner()).wants(kind)
    }

    /// Re-reads every toggle and swaps the effective settings.
    pub async fn refresh(&self, store: &dyn SettingsStore) -> GateTransition {
        self.apply(GateSettings::load(store).await)
    }

    /// Swaps in `next` and reports what changed.
    pub fn apply(&self, next: GateSettings) -> GateTransition {
        let previous = {
            let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, next.clone())
        };
        let transition = GateTransition { previous, current: next };
        if transition.changed() {
            info!(detach = ?transition.to_detach(), "[GATE] feature settings changed");
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;
    use serde_json::json;

    #[tokio::test]
    async fn defaults_enable_everything() {
        let gate = FeatureGate::load(&MemorySettings::new()).await;
        assert!(gate.wants(DecorationKind::Balance));
        assert!(gate.wants(DecorationKind::MarketLinks));
        assert!(gate.wants(DecorationKind::EnergyInfo));
        assert_eq!(gate.current().enabled_currencies, all_conversion_keys());
    }

    #[tokio::test]
    async fn empty_marketplace_list_disables_links() {
        let store = MemorySettings::with_values([(keys::ENABLED_MARKETPLACES, json!([]))]);
        let gate = FeatureGate::load(&store).await;
        assert!(!gate.wants(DecorationKind::MarketLinks));
    }

    #[tokio::test]
    async fn refresh_reports_switched_off_kinds() {
        let store = MemorySettings::new();
        let gate = FeatureGate::load(&store).await;
        store.set(keys::MARKETPLACE_ENABLED, json!(false)).await.unwrap();
        store.set(keys::ENERGY_INFO_ENABLED, json!(false)).await.unwrap();

        let t = gate.refresh(&store).await;
        assert!(t.changed());
        assert_eq!(t.to_detach(), vec![DecorationKind::MarketLinks, DecorationKind::EnergyInfo]);
        assert!(!gate.wants(DecorationKind::EnergyInfo));
    }

    #[tokio::test]
    async fn marketplace_reconfiguration_detaches_links() {
        let store = MemorySettings::new();
        let gate = FeatureGate::load(&store).await;
        store.set(keys::ENABLED_MARKETPLACES, json!(["tensor"])).await.unwrap();
        let t = gate.refresh(&store).await;
        assert_eq!(t.to_detach(), vec![DecorationKind::MarketLinks]);
        assert!(gate.wants(DecorationKind::MarketLinks));
    }

    #[tokio::test]
    async fn unchanged_refresh_detaches_nothing() {
        let store = MemorySettings::new();
        let gate = FeatureGate::load(&store).await;
        let t = gate.refresh(&store).await;
        assert!(!t.changed());
        assert!(t.to_detach().is_empty());
    }
}
