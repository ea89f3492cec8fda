//! Polls values the host rewrites without a usable mutation signal.
//!
//! The energy counter on a card is updated in place by the host's own timers,
//! so instead of trusting notifications the poller diffs the rendered number
//! against the last one it saw and asks the decorator to refresh that one card.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::POLL_INTERVAL_MS;
use crate::decorator::extract::read_energy;
use crate::dom::{Dom, NodeId};
use crate::types::DecoratorCommand;

#[derive(Debug, Clone)]
struct Tracked {
    item_id: String,
    last: f64,
}

struct Inner {
    dom: Arc<dyn Dom>,
    cmd_tx: mpsc::Sender<DecoratorCommand>,
    period: Duration,
    /// card node → last seen value. Keyed by node so cards sharing an id are
    /// each followed.
    tracked: DashMap<NodeId, Tracked>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ValuePoller {
    inner: Arc<Inner>,
}

impl ValuePoller {
    pub fn new(dom: Arc<dyn Dom>, cmd_tx: mpsc::Sender<DecoratorCommand>) -> Self {
        Self::with_period(dom, cmd_tx, Duration::from_millis(POLL_INTERVAL_MS))
    }

    pub fn with_period(dom: Arc<dyn Dom>, cmd_tx: mpsc::Sender<DecoratorCommand>, period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                dom,
                cmd_tx,
                period,
                tracked: DashMap::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Starts following the card at `node`. The first tracked card starts the timer.
    pub fn track(&self, item_id: &str, node: NodeId, value: f64) {
        self.inner.tracked.insert(node, Tracked { item_id: item_id.to_string(), last: value });

        let mut task = self.inner.task_slot();
        let running = task.as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            debug!("[POLLER] starting");
            *task = Some(tokio::spawn(Inner::run(Arc::clone(&self.inner))));
        }
    }

    pub fn is_tracking(&self, node: NodeId) -> bool {
        self.inner.tracked.contains_key(&node)
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.task_slot().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancels the timer and forgets every value.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.task_slot().take() {
            handle.abort();
        }
        self.inner.tracked.clear();
    }
}

impl Inner {
    fn task_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate; values were just recorded

        loop {
            ticker.tick().await;
            self.poll_once();

            if self.tracked.is_empty() {
                // `track` inserts before it checks the slot, so re-checking under the
                // lock means a concurrent insert either sees us running or restarts us.
                let mut slot = self.task_slot();
                if self.tracked.is_empty() {
                    *slot = None;
                    info!("[POLLER] nothing left to watch, stopping");
                    return;
                }
            }
        }
    }

    fn poll_once(&self) {
        let mut gone = Vec::new();
        let mut changed = Vec::new();

        for mut entry in self.tracked.iter_mut() {
            let node = *entry.key();
            if !self.dom.contains(node) {
                gone.push(node);
                continue;
            }
            match read_energy(self.dom.as_ref(), node) {
                None => gone.push(node),
                Some(v) if v != entry.last => {
                    debug!(item_id = %entry.item_id, from = entry.last, to = v, "[POLLER] value changed");
                    entry.last = v;
                    changed.push(node);
                }
                Some(_) => {}
            }
        }

        for node in gone {
            self.tracked.remove(&node);
        }
        for node in changed {
            if let Err(e) = self.cmd_tx.try_send(DecoratorCommand::Refresh(node)) {
                warn!(%node, "[POLLER] refresh not delivered: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{FragmentNode, MemoryDom};

    fn card(energy: &str) -> FragmentNode {
        FragmentNode::element("div")
            .with_class("HorseCard_card__a1")
            .with_child(FragmentNode::element("p").with_text("ID: 9"))
            .with_child(FragmentNode::element("p").with_text(energy))
    }

    fn setup() -> (Arc<MemoryDom>, NodeId, ValuePoller, mpsc::Receiver<DecoratorCommand>) {
        let dom = Arc::new(MemoryDom::new());
        let node = dom.mount(dom.root(), &card("Energy: 40/100")).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let poller = ValuePoller::with_period(dom.clone(), tx, Duration::from_secs(2));
        (dom, node, poller, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn changed_value_requests_single_refresh() {
        let (dom, node, poller, mut rx) = setup();
        poller.track("9", node, 40.0);
        assert!(poller.is_running());

        let energy_line = dom.children(node)[1];
        dom.set_text(energy_line, "Energy: 38/100").unwrap();

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(matches!(rx.try_recv(), Ok(DecoratorCommand::Refresh(n)) if n == node));

        // unchanged on the next tick
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_itself_once_items_disappear() {
        let (dom, node, poller, _rx) = setup();
        poller.track("9", node, 40.0);
        dom.remove(node).unwrap();

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        tokio::task::yield_now().await;
        assert_eq!(poller.tracked_count(), 0);
        assert!(!poller.is_running());

        // tracking again restarts the timer
        let again = dom.mount(dom.root(), &card("Energy: 1/100")).unwrap();
        poller.track("9", again, 1.0);
        assert!(poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_cache_and_timer() {
        let (_dom, node, poller, _rx) = setup();
        poller.track("9", node, 40.0);
        poller.stop();
        assert!(!poller.is_running());
        assert!(!poller.is_tracking(node));
    }

    #[tokio::test(start_paused = true)]
    async fn cards_sharing_an_id_are_polled_separately() {
        let (dom, first, poller, mut rx) = setup();
        let second = dom.mount(dom.root(), &card("Energy: 70/100")).unwrap();
        poller.track("9", first, 40.0);
        poller.track("9", second, 70.0);
        assert_eq!(poller.tracked_count(), 2);

        dom.set_text(dom.children(first)[1], "Energy: 39/100").unwrap();
        dom.set_text(dom.children(second)[1], "Energy: 69/100").unwrap();
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        let mut refreshed = Vec::new();
        while let Ok(DecoratorCommand::Refresh(n)) = rx.try_recv() {
            refreshed.push(n);
        }
        refreshed.sort_by_key(|n| n.0);
        assert_eq!(refreshed, vec![first, second]);
    }
}
