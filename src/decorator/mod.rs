//! Item card decoration loop.
//!
//! Cards are found two ways: mutation batches (new cards, rebuilt card
//! content) and a fixed-interval reconciliation pass over every card on the
//! page. The second exists because the host can rewrite a card's inner markup
//! without any structurally distinguishable mutation. Both paths funnel into
//! [`ItemDecorator::decorate_item`], which is idempotent: the markers present in
//! the document decide whether anything is attached.

pub mod energy;
pub mod extract;
pub mod links;
pub mod marks;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::health::StatusBoard;
use crate::api::latency::LatencyStats;
use crate::config::{energy_defaults, ITEM_CLASS_PREFIX, MARKER_PREFIX, MARKETPLACE_BASE_URL, RECONCILE_INTERVAL_MS};
use crate::dom::{Dom, Fragment, FragmentNode, MutationBatch, MutationKind, NodeId, Subscription};
use crate::error::Result;
use crate::poller::ValuePoller;
use crate::state::{FeatureGate, GateSettings};
use crate::types::{DecorationKind, DecoratorCommand};

use self::extract::extract_item;
use self::marks::DecorationMarks;

/// Outcome of one pass over a set of cards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub scanned: usize,
    pub attached: usize,
    pub failed: usize,
}

impl PassReport {
    fn absorb(&mut self, outcome: Result<usize>) {
        self.scanned += 1;
        match outcome {
            Ok(n) => self.attached += n,
            Err(_) => self.failed += 1,
        }
    }
}

pub struct ItemDecorator {
    dom: Arc<dyn Dom>,
    gate: Arc<FeatureGate>,
    marks: Arc<DecorationMarks>,
    poller: ValuePoller,
    status: Arc<StatusBoard>,
    latency: Arc<LatencyStats>,
    marketplace_base: String,
    recovery: f64,
    work_drain: f64,
    period: Duration,
}

impl ItemDecorator {
    pub fn new(dom: Arc<dyn Dom>, gate: Arc<FeatureGate>, poller: ValuePoller) -> Self {
        Self {
            dom,
            gate,
            marks: Arc::new(DecorationMarks::new()),
            poller,
            status: Arc::new(StatusBoard::new()),
            latency: Arc::new(LatencyStats::new()),
            marketplace_base: MARKETPLACE_BASE_URL.to_string(),
            recovery: energy_defaults::RECOVERY,
            work_drain: energy_defaults::WORK_DRAIN,
            period: Duration::from_millis(RECONCILE_INTERVAL_MS),
        }
    }

    pub fn with_metrics(mut self, status: Arc<StatusBoard>, latency: Arc<LatencyStats>) -> Self {
        self.status = status;
        self.latency = latency;
        self
    }

    pub fn with_energy(mut self, recovery: f64, work_drain: f64) -> Self {
        self.recovery = recovery;
        self.work_drain = work_drain;
        self
    }

    pub fn with_marketplace_base(mut self, base: impl Into<String>) -> Self {
        self.marketplace_base = base.into();
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Subscribes immediately so nothing between start and the first poll is missed.
    pub fn start(self, cmd_rx: mpsc::Receiver<DecoratorCommand>) -> JoinHandle<()> {
        let sub = self.dom.observe();
        tokio::spawn(self.run(sub, cmd_rx))
    }

    async fn run(self, mut sub: Subscription, mut cmd_rx: mpsc::Receiver<DecoratorCommand>) {
        let first = self.reconcile();
        info!(items = first.scanned, attached = first.attached, "[DECORATOR] initial pass");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                batch = sub.recv() => {
                    let Some(batch) = batch else {
                        info!("[DECORATOR] document closed, stopping");
                        break;
                    };
                    let report = self.scan_batch(&batch);
                    if report.attached > 0 {
                        debug!(attached = report.attached, "[DECORATOR] decorated from mutations");
                    }
                }

                _ = ticker.tick() => {
                    self.reconcile();
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(DecoratorCommand::Reconcile) => {
                            let report = self.reconcile();
                            debug!(?report, "[DECORATOR] forced pass");
                        }
                        Some(DecoratorCommand::Refresh(node)) => self.refresh(node),
                        Some(DecoratorCommand::Detach(kinds)) => {
                            self.detach(&kinds);
                        }
                        None => {
                            info!("[DECORATOR] command channel closed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Full pass over every card currently in the document, in document order.
    pub fn reconcile(&self) -> PassReport {
        let started = Instant::now();
        let gate = self.gate.current();
        let mut report = PassReport::default();

        for item in self.dom.elements_by_class_prefix(None, ITEM_CLASS_PREFIX) {
            report.absorb(self.decorate_logged(item, &gate));
        }

        let pruned = self.marks.prune(|n| self.dom.contains(n));
        if pruned > 0 {
            debug!(pruned, "[DECORATOR] forgot discarded cards");
        }

        self.finish(&report);
        self.status.inc_passes();
        self.latency.record(started.elapsed());
        report
    }

    /// Decorates cards reachable from one mutation batch. Records about our
    /// own nodes are skipped.
    pub fn scan_batch(&self, batch: &MutationBatch) -> PassReport {
        let mut candidates: Vec<NodeId> = Vec::new();
        let mut push = |n: NodeId| {
            if !candidates.contains(&n) {
                candidates.push(n);
            }
        };

        for record in &batch.records {
            if record.kind != MutationKind::ChildList || record.target.has_class_prefix(MARKER_PREFIX) {
                continue;
            }
            let foreign_added: Vec<_> = record.added.iter().filter(|n| !n.has_class_prefix(MARKER_PREFIX)).collect();
            let foreign_removed = record.removed.iter().any(|n| !n.has_class_prefix(MARKER_PREFIX));
            if foreign_added.is_empty() && !foreign_removed {
                continue;
            }
            for added in foreign_added.iter().filter(|n| !n.is_text()) {
                if self.dom.contains(added.id) {
                    self.dom.elements_by_class_prefix(Some(added.id), ITEM_CLASS_PREFIX).into_iter().for_each(&mut push);
                }
            }
            // Content rebuilt inside a card
            if let Some(item) = self.enclosing_item(record.target.id) {
                push(item);
            }
        }

        let gate = self.gate.current();
        let mut report = PassReport::default();
        for item in candidates {
            report.absorb(self.decorate_logged(item, &gate));
        }
        if report.scanned > 0 {
            self.finish(&report);
        }
        report
    }

    /// Re-extracts and re-decorates a single card.
    pub fn refresh(&self, item: NodeId) {
        if !self.dom.contains(item) {
            debug!(%item, "[DECORATOR] refresh target gone");
            return;
        }
        let report = {
            let mut r = PassReport::default();
            r.absorb(self.decorate_logged(item, &self.gate.current()));
            r
        };
        self.finish(&report);
    }

    /// Strips every decoration of `kinds`, restoring the markup captured before
    /// each was attached. Returns how many decorations were removed.
    pub fn detach(&self, kinds: &[DecorationKind]) -> usize {
        let mut removed = 0;
        for &kind in kinds {
            if kind == DecorationKind::Balance {
                continue;
            }
            for node in self.dom.elements_by_class(None, kind.marker()) {
                // An earlier restore in the same anchor may have taken it already.
                if !self.dom.contains(node) {
                    continue;
                }
                let parent = self.dom.parent(node);
                let original = parent.and_then(|p| self.marks.take_original(p, kind).map(|f| (p, f)));
                let outcome = match original {
                    Some((anchor, children)) if self.anchor_untouched(anchor, kind, &children) => {
                        self.dom.replace_children(anchor, &children)
                    }
                    Some((anchor, _)) => {
                        debug!(%anchor, %kind, "[DECORATOR] host rewrote anchor since decorating, keeping its content");
                        self.dom.remove(node)
                    }
                    None => self.dom.remove(node),
                };
                match outcome {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(%node, %kind, "[DECORATOR] failed to remove decoration: {e}"),
                }
            }
            self.marks.clear_kind(kind);
            if kind == DecorationKind::EnergyInfo {
                self.poller.stop();
            }
            info!(%kind, removed, "[DECORATOR] detached");
        }
        self.status.add_removed(removed);
        self.status.set_decorated_items(self.marks.len());
        removed
    }

    /// Whether the anchor, minus our own markers, still matches what it held
    /// before decorating. If not, the captured copy is stale.
    fn anchor_untouched(&self, anchor: NodeId, kind: DecorationKind, original: &Fragment) -> bool {
        let Ok(mut current) = self.dom.snapshot_children(anchor) else {
            return false;
        };
        current.retain(|n| !n.has_class(kind.marker()));
        current == *original
    }

    fn finish(&self, report: &PassReport) {
        self.status.add_attached(report.attached);
        self.status.add_item_failures(report.failed);
        self.status.set_decorated_items(self.marks.len());
    }

    fn decorate_logged(&self, item: NodeId, gate: &GateSettings) -> Result<usize> {
        let outcome = self.decorate_item(item, gate);
        if let Err(e) = &outcome {
            warn!(%item, "[DECORATOR] item skipped: {e}");
        }
        outcome
    }

    /// Brings one card in line with `gate`. Returns the number of decorations attached.
    pub fn decorate_item(&self, item: NodeId, gate: &GateSettings) -> Result<usize> {
        let ex = extract_item(self.dom.as_ref(), item);
        let record = &ex.record;
        if record.id.is_empty() {
            return Ok(0);
        }
        let mut attached = 0;

        if gate.wants(DecorationKind::MarketLinks) {
            if let Some(anchor) = ex.id_anchor {
                let markets = &gate.enabled_marketplaces;
                let key = links::links_key(record, markets);
                if self.ensure(item, anchor, &record.id, DecorationKind::MarketLinks, &key, || {
                    links::link_block(record, markets, &self.marketplace_base)
                })? {
                    attached += 1;
                }
            }
        }

        if gate.wants(DecorationKind::EnergyInfo) {
            if let Some(anchor) = ex.energy_anchor {
                let outlook = energy::outlook(record, self.recovery, self.work_drain);
                let key = energy::annotation_key(record);
                if self.ensure(item, anchor, &record.id, DecorationKind::EnergyInfo, &key, || {
                    energy::annotation(record, &outlook)
                })? {
                    attached += 1;
                }
                self.poller.track(&record.id, item, record.energy.current);
            }
        }

        Ok(attached)
    }

    /// Idempotent attach of one decoration inside `anchor`.
    ///
    /// Exactly one marker carrying `key` means nothing to do. Anything else
    /// (missing, duplicated, rendered from stale data) is cleared and rebuilt.
    fn ensure(
        &self,
        item: NodeId,
        anchor: NodeId,
        item_id: &str,
        kind: DecorationKind,
        key: &str,
        build: impl FnOnce() -> FragmentNode,
    ) -> Result<bool> {
        let existing = self.dom.elements_by_class(Some(anchor), kind.marker());
        if let [only] = existing.as_slice() {
            if self.dom.attr(*only, "data-so-key").as_deref() == Some(key) {
                self.marks.mark(item, item_id, kind);
                return Ok(false);
            }
        }

        if existing.is_empty() && self.marks.was_decorated(item, kind) {
            debug!(%item_id, %kind, "[DECORATOR] decoration wiped by host, re-attaching");
        }
        for stale in existing {
            self.dom.remove(stale)?;
        }

        self.marks.remember_original(anchor, kind, self.dom.snapshot_children(anchor)?);
        let node = self.dom.create(&build());
        self.dom.append_child(anchor, node)?;
        self.marks.mark(item, item_id, kind);
        Ok(true)
    }

    fn enclosing_item(&self, node: NodeId) -> Option<NodeId> {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if self.dom.info(n).is_some_and(|i| i.has_class_prefix(ITEM_CLASS_PREFIX)) {
                return Some(n);
            }
            cur = self.dom.parent(n);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DECORATION_CLASS, ENERGY_MARKER, MARKET_LINKS_MARKER};
    use crate::dom::MemoryDom;
    use crate::types::Marketplace;

    fn card(id: &str, energy: &str, status: &str) -> FragmentNode {
        FragmentNode::element("div")
            .with_class("HorseCard_card__k2")
            .with_child(FragmentNode::element("h3").with_text("Name: Dusty"))
            .with_child(FragmentNode::element("p").with_class("HorseCard_id__z").with_text(format!("ID: {id}")))
            .with_child(FragmentNode::element("p").with_text(format!("Energy: {energy}")))
            .with_child(FragmentNode::element("p").with_text(format!("Status: {status}")))
            .with_child(FragmentNode::element("p").with_text("Generation: 0"))
    }

    struct Harness {
        dom: Arc<MemoryDom>,
        gate: Arc<FeatureGate>,
        decorator: ItemDecorator,
        cmd_rx: mpsc::Receiver<DecoratorCommand>,
    }

    fn harness(settings: GateSettings) -> Harness {
        let dom = Arc::new(MemoryDom::new());
        let gate = Arc::new(FeatureGate::new(settings));
        let (tx, cmd_rx) = mpsc::channel(16);
        let poller = ValuePoller::with_period(dom.clone(), tx, Duration::from_secs(2));
        let decorator = ItemDecorator::new(dom.clone(), gate.clone(), poller)
            .with_marketplace_base("https://play.test")
            .with_energy(10.0, 8.0);
        Harness { dom, gate, decorator, cmd_rx }
    }

    fn count(dom: &MemoryDom, class: &str) -> usize {
        dom.elements_by_class(None, class).len()
    }

    #[tokio::test]
    async fn second_pass_on_unchanged_page_is_a_no_op() {
        let h = harness(GateSettings::default());
        h.dom.mount(h.dom.root(), &card("1", "40/100", "Idle")).unwrap();
        h.dom.mount(h.dom.root(), &card("2", "100/100", "Working")).unwrap();

        let first = h.decorator.reconcile();
        assert_eq!(first, PassReport { scanned: 2, attached: 4, failed: 0 });
        let markup = h.dom.markup(h.dom.root());

        let second = h.decorator.reconcile();
        assert_eq!(second.attached, 0);
        assert_eq!(h.dom.markup(h.dom.root()), markup);
        assert_eq!(count(&h.dom, MARKET_LINKS_MARKER), 2);
        assert_eq!(count(&h.dom, ENERGY_MARKER), 2);
    }

    #[tokio::test]
    async fn full_energy_card_shows_waste_of_whole_recovery() {
        let h = harness(GateSettings::default());
        h.dom.mount(h.dom.root(), &card("7", "100/100", "Idle")).unwrap();
        h.decorator.reconcile();

        let delta = h.dom.elements_by_class(None, ENERGY_MARKER)[0];
        assert_eq!(h.dom.text_content(delta), " (10 wasted)");
        assert!(h.dom.has_class(delta, "so-delta-waste"));
        assert!(h.dom.attr(delta, "title").unwrap().contains("10 is wasted"));
    }

    #[tokio::test]
    async fn toggling_links_off_restores_id_field_exactly() {
        let h = harness(GateSettings::default());
        let a = h.dom.mount(h.dom.root(), &card("10442", "40/100", "Idle")).unwrap();
        let b = h.dom.mount(h.dom.root(), &card("77", "40/100", "Idle")).unwrap();
        let id_field = |item: NodeId| h.dom.children(item)[1];
        let before = [h.dom.markup(id_field(a)), h.dom.markup(id_field(b))];

        h.decorator.reconcile();
        assert_ne!(h.dom.markup(id_field(a)), before[0]);

        h.gate.apply(GateSettings { marketplace_enabled: false, ..GateSettings::default() });
        let removed = h.decorator.detach(&[DecorationKind::MarketLinks]);
        assert_eq!(removed, 2);
        assert_eq!(count(&h.dom, MARKET_LINKS_MARKER), 0);
        assert_eq!([h.dom.markup(id_field(a)), h.dom.markup(id_field(b))], before);

        // stays off on later passes, energy untouched
        h.decorator.reconcile();
        assert_eq!(count(&h.dom, MARKET_LINKS_MARKER), 0);
        assert_eq!(count(&h.dom, ENERGY_MARKER), 2);
    }

    #[tokio::test]
    async fn detach_keeps_host_text_changed_since_decorating() {
        let h = harness(GateSettings { marketplace_enabled: false, ..GateSettings::default() });
        let item = h.dom.mount(h.dom.root(), &card("5", "40/100", "Idle")).unwrap();
        h.decorator.reconcile();
        let field = h.dom.children(item)[2];
        assert_eq!(count(&h.dom, ENERGY_MARKER), 1);

        // Host ticks the counter in place before the next pass.
        let text = h.dom.children(field)[0];
        h.dom.set_data(text, "Energy: 55/100").unwrap();

        h.gate.apply(GateSettings { marketplace_enabled: false, energy_info_enabled: false, ..GateSettings::default() });
        assert_eq!(h.decorator.detach(&[DecorationKind::EnergyInfo]), 1);
        assert_eq!(count(&h.dom, ENERGY_MARKER), 0);
        assert_eq!(h.dom.text_content(field), "Energy: 55/100");
    }

    #[tokio::test]
    async fn wiped_decoration_is_reattached_once() {
        let h = harness(GateSettings { energy_info_enabled: false, ..GateSettings::default() });
        let item = h.dom.mount(h.dom.root(), &card("5", "1/100", "Idle")).unwrap();
        h.decorator.reconcile();

        // Host rewrites the id field's content wholesale.
        let field = h.dom.children(item)[1];
        h.dom.replace_children(field, &vec![FragmentNode::text("ID: 5")]).unwrap();
        assert_eq!(count(&h.dom, MARKET_LINKS_MARKER), 0);

        assert_eq!(h.decorator.reconcile().attached, 1);
        assert_eq!(h.decorator.reconcile().attached, 0);
        assert_eq!(count(&h.dom, MARKET_LINKS_MARKER), 1);
    }

    #[tokio::test]
    async fn duplicated_markers_collapse_to_one() {
        let h = harness(GateSettings { energy_info_enabled: false, ..GateSettings::default() });
        let item = h.dom.mount(h.dom.root(), &card("5", "1/100", "Idle")).unwrap();
        h.decorator.reconcile();
        let field = h.dom.children(item)[1];
        let dup = links::link_block(
            &extract_item(h.dom.as_ref(), item).record,
            &Marketplace::ALL,
            "https://play.test",
        );
        h.dom.mount(field, &dup).unwrap();
        assert_eq!(count(&h.dom, MARKET_LINKS_MARKER), 2);

        h.decorator.reconcile();
        assert_eq!(count(&h.dom, MARKET_LINKS_MARKER), 1);
    }

    #[tokio::test]
    async fn marketplace_selection_change_rebuilds_block() {
        let h = harness(GateSettings::default());
        h.dom.mount(h.dom.root(), &card("5", "1/100", "Idle")).unwrap();
        h.decorator.reconcile();
        assert_eq!(count(&h.dom, "so-market-link"), 3);

        h.gate.apply(GateSettings { enabled_marketplaces: vec![Marketplace::Tensor], ..GateSettings::default() });
        h.decorator.detach(&[DecorationKind::MarketLinks]);
        h.decorator.reconcile();
        assert_eq!(count(&h.dom, "so-market-link"), 1);
        assert_eq!(count(&h.dom, MARKET_LINKS_MARKER), 1);
    }

    #[tokio::test]
    async fn cards_without_id_are_left_alone() {
        let h = harness(GateSettings::default());
        h.dom
            .mount(h.dom.root(), &FragmentNode::element("div").with_class("HorseCard_card__k2").with_text("Loading"))
            .unwrap();
        let report = h.decorator.reconcile();
        assert_eq!(report, PassReport { scanned: 1, attached: 0, failed: 0 });
        assert_eq!(count(&h.dom, DECORATION_CLASS), 0);
    }

    #[tokio::test]
    async fn batch_scan_picks_up_new_cards_and_ignores_own_churn() {
        let h = harness(GateSettings::default());
        let mut sub = h.dom.observe();
        h.dom.mount(h.dom.root(), &FragmentNode::element("section").with_child(card("3", "5/100", "Idle"))).unwrap();

        let batch = sub.try_recv().unwrap();
        assert_eq!(h.decorator.scan_batch(&batch).attached, 2);

        // our own appends come back as batches that decorate nothing new
        while let Some(own) = sub.try_recv() {
            assert_eq!(h.decorator.scan_batch(&own).attached, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn energy_change_flows_through_poller_refresh() {
        let mut h = harness(GateSettings { marketplace_enabled: false, ..GateSettings::default() });
        let item = h.dom.mount(h.dom.root(), &card("8", "50/100", "Idle")).unwrap();
        h.decorator.reconcile();

        let energy_line = h.dom.children(item)[2];
        h.dom.set_text(energy_line, "Energy: 95/100").unwrap();
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        let Ok(DecoratorCommand::Refresh(node)) = h.cmd_rx.try_recv() else { panic!("expected refresh") };
        h.decorator.refresh(node);
        let delta = h.dom.elements_by_class(None, ENERGY_MARKER);
        assert_eq!(delta.len(), 1);
        assert_eq!(h.dom.text_content(delta[0]), " (+5, 5 wasted)");
    }

    #[tokio::test(start_paused = true)]
    async fn running_loop_applies_commands() {
        let h = harness(GateSettings::default());
        let (tx, rx) = mpsc::channel(8);
        let dom = h.dom.clone();
        let handle = h.decorator.start(rx);

        dom.mount(dom.root(), &card("12", "10/100", "Idle")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count(&dom, MARKET_LINKS_MARKER), 1);

        h.gate.apply(GateSettings { energy_info_enabled: false, ..GateSettings::default() });
        tx.send(DecoratorCommand::Detach(vec![DecorationKind::EnergyInfo])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count(&dom, ENERGY_MARKER), 0);

        handle.abort();
    }
}
