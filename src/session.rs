//! One page session: cold start, task wiring and teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::health::StatusBoard;
use crate::api::latency::LatencyStats;
use crate::config::{Config, CHANNEL_CAPACITY, RATE_FETCH_TIMEOUT_MS};
use crate::decorator::ItemDecorator;
use crate::dom::Dom;
use crate::error::{OverlayError, Result};
use crate::poller::ValuePoller;
use crate::rates::{RateCache, RateRelay};
use crate::settings::{keys, read_or, SettingsStore};
use crate::state::{ConversionState, FeatureGate, GateTransition};
use crate::supervisor::{NavigationSupervisor, ObserverHealth};
use crate::types::{DecoratorCommand, WatcherCommand, DEFAULT_CONVERSION};
use crate::watcher::BalanceWatcher;

/// Everything a running session shares with the API.
pub struct PageSession {
    pub dom: Arc<dyn Dom>,
    pub settings: Arc<dyn SettingsStore>,
    pub cache: Arc<RateCache>,
    pub conversion: Arc<ConversionState>,
    pub gate: Arc<FeatureGate>,
    pub health: Arc<ObserverHealth>,
    pub status: Arc<StatusBoard>,
    pub latency: Arc<LatencyStats>,
    poller: ValuePoller,
    decorator_tx: mpsc::Sender<DecoratorCommand>,
    watcher_tx: mpsc::Sender<WatcherCommand>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PageSession {
    pub async fn start(
        cfg: &Config,
        dom: Arc<dyn Dom>,
        settings: Arc<dyn SettingsStore>,
        relay: Arc<dyn RateRelay>,
    ) -> Result<Self> {
        // Subscribe before reading so no write between load and listen is lost.
        let changes = settings.changes();

        let gate = Arc::new(FeatureGate::load(settings.as_ref()).await);
        let conversion = Arc::new(ConversionState::load(Arc::clone(&settings)).await);
        let active = conversion.ensure_enabled(&gate.current().enabled_currencies);
        info!(%active, "[SESSION] settings loaded");

        let cache = Arc::new(RateCache::new(
            relay,
            cfg.base_token_address.clone(),
            Duration::from_millis(RATE_FETCH_TIMEOUT_MS),
        ));
        if let Err(e) = cache.fetch_all().await {
            warn!("[SESSION] initial rate fetch failed, converter will retry: {e}");
        }

        let status = Arc::new(StatusBoard::new());
        let latency = Arc::new(LatencyStats::new());
        let health = Arc::new(ObserverHealth::new());

        let (decorator_tx, decorator_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (watcher_tx, watcher_rx) = mpsc::channel(CHANNEL_CAPACITY);
        // One pending re-initialization is enough; extra signals coalesce.
        let (reinit_tx, reinit_rx) = mpsc::channel(1);

        let poller = ValuePoller::new(Arc::clone(&dom), decorator_tx.clone());

        let decorator = ItemDecorator::new(Arc::clone(&dom), Arc::clone(&gate), poller.clone())
            .with_metrics(Arc::clone(&status), Arc::clone(&latency))
            .with_energy(cfg.energy_recovery, cfg.energy_work_drain)
            .with_marketplace_base(cfg.marketplace_base_url.clone());

        let watcher = BalanceWatcher::new(
            Arc::clone(&dom),
            Arc::clone(&cache),
            Arc::clone(&conversion),
            Arc::clone(&gate),
        )
        .with_status(Arc::clone(&status));

        let supervisor = NavigationSupervisor::new(Arc::clone(&dom), Arc::clone(&health), reinit_tx);

        let mut tasks = vec![
            decorator.start(decorator_rx),
            watcher.start(watcher_rx),
            supervisor.start(),
        ];

        tasks.push(tokio::spawn(fan_out_reinit(reinit_rx, watcher_tx.clone(), decorator_tx.clone())));

        let listener = SettingsListener {
            settings: Arc::clone(&settings),
            gate: Arc::clone(&gate),
            conversion: Arc::clone(&conversion),
            decorator_tx: decorator_tx.clone(),
            watcher_tx: watcher_tx.clone(),
        };
        tasks.push(tokio::spawn(listener.run(changes)));

        info!("[SESSION] started");
        Ok(Self {
            dom,
            settings,
            cache,
            conversion,
            gate,
            health,
            status,
            latency,
            poller,
            decorator_tx,
            watcher_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Explicit rate refresh; the balance re-renders on success.
    pub async fn refresh_rates(&self) -> Result<usize> {
        let snapshot = self.cache.fetch_all().await?;
        if let Err(e) = self.watcher_tx.send(WatcherCommand::RatesUpdated).await {
            warn!("[SESSION] watcher unavailable: {e}");
        }
        Ok(snapshot.len())
    }

    /// Queues one full reconciliation pass.
    pub async fn reconcile_now(&self) {
        if let Err(e) = self.decorator_tx.send(DecoratorCommand::Reconcile).await {
            warn!("[SESSION] decorator unavailable: {e}");
        }
    }

    pub fn tracked_values(&self) -> usize {
        self.poller.tracked_count()
    }

    /// Idempotent; safe while the API still holds the session.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in &tasks {
            task.abort();
        }
        self.poller.stop();
        self.cache.invalidate();
        info!("[SESSION] stopped");
    }
}

async fn fan_out_reinit(
    mut reinit_rx: mpsc::Receiver<()>,
    watcher_tx: mpsc::Sender<WatcherCommand>,
    decorator_tx: mpsc::Sender<DecoratorCommand>,
) {
    while reinit_rx.recv().await.is_some() {
        debug!("[SESSION] re-initializing after suspected navigation");
        if watcher_tx.send(WatcherCommand::Rediscover).await.is_err()
            || decorator_tx.send(DecoratorCommand::Reconcile).await.is_err()
        {
            break;
        }
    }
}

struct SettingsListener {
    settings: Arc<dyn SettingsStore>,
    gate: Arc<FeatureGate>,
    conversion: Arc<ConversionState>,
    decorator_tx: mpsc::Sender<DecoratorCommand>,
    watcher_tx: mpsc::Sender<WatcherCommand>,
}

impl SettingsListener {
    async fn run(self, mut changes: broadcast::Receiver<String>) {
        loop {
            match changes.recv().await {
                Ok(key) => {
                    if let Err(e) = self.on_change(Some(&key)).await {
                        warn!(%key, "[SETTINGS] change not applied: {e}");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "[SETTINGS] change listener lagged, reloading everything");
                    if self.on_change(None).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// `None` means "unknown key": treat as a change to everything.
    async fn on_change(&self, key: Option<&str>) -> Result<()> {
        if key.is_none() || key == Some(keys::ACTIVE_CURRENCY) {
            // While our own write is pending the store lags memory; memory wins.
            if self.conversion.is_persisting() {
                debug!("[SETTINGS] active currency write in flight, keeping in-memory choice");
            } else {
                self.adopt_stored_currency().await;
            }
            if key.is_some() {
                return Ok(());
            }
        }

        let transition = self.gate.refresh(self.settings.as_ref()).await;
        self.conversion.ensure_enabled(&transition.current.enabled_currencies);
        if !transition.changed() {
            return Ok(());
        }

        let detach = transition.to_detach();
        if !detach.is_empty() {
            self.decorator_tx
                .send(DecoratorCommand::Detach(detach))
                .await
                .map_err(|e| OverlayError::ChannelSend(e.to_string()))?;
        }
        self.decorator_tx
            .send(DecoratorCommand::Reconcile)
            .await
            .map_err(|e| OverlayError::ChannelSend(e.to_string()))?;

        if balance_affected(&transition) {
            self.watcher_tx
                .send(WatcherCommand::SettingsChanged)
                .await
                .map_err(|e| OverlayError::ChannelSend(e.to_string()))?;
        }
        Ok(())
    }

    async fn adopt_stored_currency(&self) {
        let wanted: String =
            read_or(self.settings.as_ref(), keys::ACTIVE_CURRENCY, DEFAULT_CONVERSION.to_string()).await;
        if wanted != self.conversion.get() {
            if let Err(e) = self.conversion.set(&wanted) {
                warn!(%wanted, "[SETTINGS] ignoring stored currency: {e}");
            }
            self.conversion.ensure_enabled(&self.gate.current().enabled_currencies);
        }
    }
}

fn balance_affected(t: &GateTransition) -> bool {
    t.previous.converter_enabled != t.current.converter_enabled
        || t.previous.enabled_currencies != t.current.enabled_currencies
}
