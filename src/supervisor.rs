//! Coarse document-wide observer that turns host re-renders into debounced
//! re-initialization signals, with a circuit breaker on repeated faults.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{MARKER_PREFIX, NAV_DEBOUNCE_MS, OBSERVER_ERROR_THRESHOLD, OBSERVER_RECONNECT_MS};
use crate::dom::{Dom, MutationBatch, MutationKind, Subscription};
use crate::error::{OverlayError, Result};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Decides whether a batch looks like host-page churn worth re-initializing for.
pub trait BatchClassifier: Send + Sync {
    fn is_relevant(&self, batch: &MutationBatch) -> Result<bool>;
}

/// Relevant iff some added or removed node is not one of ours. A record whose
/// target is one of our nodes is ours entirely, which covers text nodes
/// swapped inside a decoration.
pub struct MarkerFilter {
    prefix: &'static str,
}

impl MarkerFilter {
    pub fn new() -> Self {
        Self { prefix: MARKER_PREFIX }
    }
}

impl Default for MarkerFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchClassifier for MarkerFilter {
    fn is_relevant(&self, batch: &MutationBatch) -> Result<bool> {
        for record in batch.records.iter().filter(|r| r.kind == MutationKind::ChildList) {
            if record.added.is_empty() && record.removed.is_empty() {
                return Err(OverlayError::ObserverFault(format!(
                    "empty child-list record on {}",
                    record.target.id
                )));
            }
            if record.target.has_class_prefix(self.prefix) {
                continue;
            }
            let foreign = record
                .added
                .iter()
                .chain(record.removed.iter())
                .any(|n| !n.has_class_prefix(self.prefix));
            if foreign {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Idle,
    Watching,
    Debounced,
    Tripped,
}

impl SupervisorPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SupervisorPhase::Watching,
            2 => SupervisorPhase::Debounced,
            3 => SupervisorPhase::Tripped,
            _ => SupervisorPhase::Idle,
        }
    }
}

/// Shared counters for one supervising observer. Updated by the supervisor, read by the API.
#[derive(Default)]
pub struct ObserverHealth {
    consecutive_errors: AtomicU32,
    tripped: AtomicBool,
    phase: AtomicU8,
    reinits: AtomicU64,
    trips: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub phase: SupervisorPhase,
    pub consecutive_errors: u32,
    pub tripped: bool,
    pub reinits: u64,
    pub trips: u64,
}

impl ObserverHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> SupervisorPhase {
        SupervisorPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            phase: self.phase(),
            consecutive_errors: self.consecutive_errors(),
            tripped: self.tripped(),
            reinits: self.reinits.load(Ordering::Relaxed),
            trips: self.trips.load(Ordering::Relaxed),
        }
    }

    fn set_phase(&self, phase: SupervisorPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    /// Returns the new consecutive count.
    fn record_error(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn trip(&self) {
        self.tripped.store(true, Ordering::Relaxed);
        self.trips.fetch_add(1, Ordering::Relaxed);
        self.set_phase(SupervisorPhase::Tripped);
    }

    fn reset(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.tripped.store(false, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct NavigationSupervisor {
    dom: Arc<dyn Dom>,
    classifier: Arc<dyn BatchClassifier>,
    health: Arc<ObserverHealth>,
    reinit_tx: mpsc::Sender<()>,
    debounce: Duration,
    threshold: u32,
    reconnect_delay: Duration,
}

impl NavigationSupervisor {
    pub fn new(dom: Arc<dyn Dom>, health: Arc<ObserverHealth>, reinit_tx: mpsc::Sender<()>) -> Self {
        Self {
            dom,
            classifier: Arc::new(MarkerFilter::new()),
            health,
            reinit_tx,
            debounce: Duration::from_millis(NAV_DEBOUNCE_MS),
            threshold: OBSERVER_ERROR_THRESHOLD,
            reconnect_delay: Duration::from_millis(OBSERVER_RECONNECT_MS),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn BatchClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_timing(mut self, debounce: Duration, threshold: u32, reconnect_delay: Duration) -> Self {
        self.debounce = debounce;
        self.threshold = threshold.max(1);
        self.reconnect_delay = reconnect_delay;
        self
    }

    /// Subscribes immediately, then watches on a spawned task.
    pub fn start(self) -> JoinHandle<()> {
        let sub = self.dom.observe();
        self.health.set_phase(SupervisorPhase::Watching);
        tokio::spawn(self.run(sub))
    }

    async fn run(self, sub: Subscription) {
        let mut sub = Some(sub);
        let mut debounce_at: Option<Instant> = None;
        let mut reconnect_at: Option<Instant> = None;

        loop {
            tokio::select! {
                batch = next_batch(&mut sub) => {
                    let Some(batch) = batch else {
                        info!("[SUPERVISOR] document closed, stopping");
                        break;
                    };
                    match self.classify(&batch) {
                        Ok(true) => {
                            self.health.record_success();
                            // Last qualifying batch wins.
                            debounce_at = Some(Instant::now() + self.debounce);
                            if !self.health.tripped() {
                                self.health.set_phase(SupervisorPhase::Debounced);
                            }
                        }
                        Ok(false) => self.health.record_success(),
                        Err(e) => {
                            let errors = self.health.record_error();
                            warn!(errors, "[SUPERVISOR] batch classification failed: {e}");
                            if errors >= self.threshold {
                                sub = None;
                                self.health.trip();
                                reconnect_at = Some(Instant::now() + self.reconnect_delay);
                                error!(
                                    errors,
                                    reconnect_in_ms = self.reconnect_delay.as_millis() as u64,
                                    "[SUPERVISOR] circuit open, observer disconnected"
                                );
                            }
                        }
                    }
                }

                _ = sleep_until_opt(debounce_at) => {
                    debounce_at = None;
                    self.health.reinits.fetch_add(1, Ordering::Relaxed);
                    if !self.health.tripped() {
                        self.health.set_phase(SupervisorPhase::Watching);
                    }
                    debug!("[SUPERVISOR] quiet period elapsed, requesting re-initialization");
                    if self.reinit_tx.try_send(()).is_err() {
                        debug!("[SUPERVISOR] re-initialization already pending");
                    }
                }

                _ = sleep_until_opt(reconnect_at) => {
                    reconnect_at = None;
                    sub = Some(self.dom.observe());
                    self.health.reset();
                    self.health.set_phase(if debounce_at.is_some() {
                        SupervisorPhase::Debounced
                    } else {
                        SupervisorPhase::Watching
                    });
                    info!("[SUPERVISOR] observer reconnected, error counter reset");
                }
            }
        }

        self.health.set_phase(SupervisorPhase::Idle);
    }

    /// A panicking classifier counts as a fault instead of killing the task.
    fn classify(&self, batch: &MutationBatch) -> Result<bool> {
        match catch_unwind(AssertUnwindSafe(|| self.classifier.is_relevant(batch))) {
            Ok(verdict) => verdict,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                Err(OverlayError::ObserverFault(msg))
            }
        }
    }
}

async fn next_batch(sub: &mut Option<Subscription>) -> Option<MutationBatch> {
    match sub {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
