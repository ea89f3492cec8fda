use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::health::StatusBoard;
use crate::config::{BALANCE_ELEMENT_ID, BALANCE_MARKER, BALANCE_STYLE, RENDER_RETRY_MS};
use crate::dom::{Dom, MutationBatch, MutationKind, NodeId, Subscription};
use crate::error::{OverlayError, Result};
use crate::finder::ElementFinder;
use crate::rates::RateCache;
use crate::state::{ConversionState, FeatureGate};
use crate::types::{DecorationKind, WatcherCommand};
use crate::watcher::view::{self, BalanceView};

/// Balance element plus the decoration sitting right after it.
#[derive(Debug, Clone, Copy)]
struct Attached {
    balance: NodeId,
    view: BalanceView,
}

/// Keeps the converted balance beside the host's balance element.
pub struct BalanceWatcher {
    dom: Arc<dyn Dom>,
    finder: ElementFinder,
    cache: Arc<RateCache>,
    conversion: Arc<ConversionState>,
    gate: Arc<FeatureGate>,
    status: Arc<StatusBoard>,
    retry_delay: Duration,

    attached: Option<Attached>,
    /// `key|text` of the last render attempt.
    last_input: Option<String>,
    retry_at: Option<Instant>,
    /// The single retry for `last_input` has been spent.
    retried: bool,
}

impl BalanceWatcher {
    pub fn new(
        dom: Arc<dyn Dom>,
        cache: Arc<RateCache>,
        conversion: Arc<ConversionState>,
        gate: Arc<FeatureGate>,
    ) -> Self {
        Self {
            finder: ElementFinder::new(Arc::clone(&dom)),
            dom,
            cache,
            conversion,
            gate,
            status: Arc::new(StatusBoard::new()),
            retry_delay: Duration::from_millis(RENDER_RETRY_MS),
            attached: None,
            last_input: None,
            retry_at: None,
            retried: false,
        }
    }

    pub fn with_status(mut self, status: Arc<StatusBoard>) -> Self {
        self.status = status;
        self
    }

    pub fn with_finder(mut self, finder: ElementFinder) -> Self {
        self.finder = finder;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn start(self, cmd_rx: mpsc::Receiver<WatcherCommand>) -> JoinHandle<()> {
        let sub = self.dom.observe();
        let currency_rx = self.conversion.subscribe();
        tokio::spawn(self.run(sub, currency_rx, cmd_rx))
    }

    async fn run(
        mut self,
        mut sub: Subscription,
        mut currency_rx: watch::Receiver<String>,
        mut cmd_rx: mpsc::Receiver<WatcherCommand>,
    ) {
        let _ = currency_rx.borrow_and_update();
        self.attach().await;

        loop {
            tokio::select! {
                batch = sub.recv() => {
                    let Some(batch) = batch else {
                        info!("[BALANCE] document closed, stopping");
                        break;
                    };
                    self.on_batch(&batch).await;
                }

                changed = currency_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let key = currency_rx.borrow_and_update().clone();
                    debug!(%key, "[BALANCE] active currency changed");
                    self.render(true).await;
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(WatcherCommand::Rediscover) => self.attach().await,
                        Some(WatcherCommand::SettingsChanged) => {
                            self.teardown();
                            self.attach().await;
                        }
                        Some(WatcherCommand::RatesUpdated) => self.render(true).await,
                        None => break,
                    }
                }

                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.retried = true;
                    if !self.cache.is_populated() {
                        // A failed fetch is already logged by the cache.
                        let _ = self.cache.fetch_all().await;
                    }
                    self.render(true).await;
                }
            }
        }
    }

    /// Finds the balance element and makes sure exactly one decoration follows it.
    pub async fn attach(&mut self) {
        if !self.gate.wants(DecorationKind::Balance) {
            self.teardown();
            return;
        }
        if let Some(a) = self.attached {
            if self.is_intact(&a) {
                return;
            }
        }

        let balance = match self.finder.find(BALANCE_ELEMENT_ID).await {
            Ok(node) => node,
            Err(e) => {
                info!("[BALANCE] balance element not found, converter skipped: {e}");
                self.attached = None;
                return;
            }
        };

        match self.decorate(balance) {
            Ok(view) => {
                self.attached = Some(Attached { balance, view });
                self.status.set_balance_attached(true);
                self.last_input = None;
                self.render(true).await;
            }
            Err(e) => {
                warn!("[BALANCE] could not attach decoration: {e}");
                self.attached = None;
            }
        }
    }

    fn decorate(&self, balance: NodeId) -> Result<BalanceView> {
        let sibling = self
            .dom
            .next_sibling(balance)
            .filter(|n| self.dom.has_class(*n, BALANCE_MARKER));

        // Stray containers left next to a balance element that no longer exists.
        for stray in self.dom.elements_by_class(None, BALANCE_MARKER) {
            if Some(stray) != sibling {
                self.dom.remove(stray)?;
            }
        }

        if let Some(existing) = sibling {
            if let Some(view) = BalanceView::locate(self.dom.as_ref(), existing) {
                debug!("[BALANCE] decoration survived, reusing it");
                self.dom.set_attr(existing, "style", BALANCE_STYLE)?;
                return Ok(view);
            }
            self.dom.remove(existing)?;
        }

        let enabled = self.gate.current().enabled_currencies;
        let node = self.dom.create(&view::container(&enabled, &self.conversion.get()));
        self.dom.insert_after(balance, node)?;
        info!("[BALANCE] decoration attached");
        BalanceView::locate(self.dom.as_ref(), node)
            .ok_or_else(|| OverlayError::Config("balance decoration is missing its parts".into()))
    }

    /// Removes the decoration, if any.
    pub fn teardown(&mut self) {
        for node in self.dom.elements_by_class(None, BALANCE_MARKER) {
            if let Err(e) = self.dom.remove(node) {
                warn!("[BALANCE] failed to remove decoration: {e}");
            }
        }
        if self.attached.take().is_some() {
            info!("[BALANCE] decoration removed");
        }
        self.status.set_balance_attached(false);
        self.last_input = None;
        self.retry_at = None;
    }

    fn is_intact(&self, a: &Attached) -> bool {
        self.dom.contains(a.balance)
            && a.view.is_connected(self.dom.as_ref())
            && self.dom.next_sibling(a.balance) == Some(a.view.container)
    }

    async fn on_batch(&mut self, batch: &MutationBatch) {
        let Some(a) = self.attached else { return };
        if !self.is_intact(&a) {
            debug!("[BALANCE] balance or decoration replaced, re-attaching");
            self.attach().await;
            return;
        }

        let mut text_changed = false;
        for record in &batch.records {
            match record.kind {
                MutationKind::Attributes if record.target.id == a.view.select => {
                    if record.attribute.as_deref() == Some("value") {
                        self.on_selection(a.view.select);
                    }
                }
                MutationKind::CharacterData | MutationKind::ChildList => {
                    let target = record.target.id;
                    let inside = target == a.balance || self.dom.is_inclusive_ancestor(a.balance, target);
                    text_changed |= inside;
                }
                _ => {}
            }
        }
        if text_changed {
            self.render(false).await;
        }
    }

    /// The selector was changed from the page.
    fn on_selection(&self, select: NodeId) {
        let Some(picked) = self.dom.attr(select, "value") else { return };
        if picked == self.conversion.get() {
            return;
        }
        if let Err(e) = self.conversion.set(&picked) {
            warn!(%picked, "[BALANCE] rejected selection: {e}");
            let _ = self.dom.set_attr(select, "value", &self.conversion.get());
        }
    }

    /// Recomputes the converted value. Unless `force`d, an unchanged balance
    /// text and currency skip the DOM write.
    async fn render(&mut self, force: bool) {
        let Some(a) = self.attached else { return };
        let text = self.dom.text_content(a.balance);
        let key = self.conversion.get();
        let input = format!("{key}|{}", text.trim());
        let same_input = self.last_input.as_deref() == Some(input.as_str());
        if !force && same_input {
            return;
        }
        if !same_input {
            self.retried = false;
        }
        self.last_input = Some(input);

        let outcome = self.cache.convert(&key, &text).and_then(|c| {
            a.view.show(self.dom.as_ref(), &c)?;
            Ok(c)
        });

        match outcome {
            Ok(c) => {
                debug!(%key, value = %c.display(), "[BALANCE] rendered");
                self.retry_at = None;
                self.status.inc_balance_renders();
            }
            Err(e) => {
                self.status.inc_balance_errors();
                if let Err(dom_err) = a.view.show_error(self.dom.as_ref()) {
                    warn!("[BALANCE] could not show error marker: {dom_err}");
                }
                if self.retried {
                    warn!(%key, "[BALANCE] render failed after retry: {e}");
                } else if self.retry_at.is_none() {
                    warn!(%key, retry_ms = self.retry_delay.as_millis() as u64, "[BALANCE] render failed, retrying: {e}");
                    self.retry_at = Some(Instant::now() + self.retry_delay);
                }
            }
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BALANCE_ERROR_CLASS, BALANCE_SELECT_CLASS, BALANCE_VALUE_CLASS};
    use crate::dom::{FragmentNode, MemoryDom};
    use crate::rates::cache::tests::{cache_with, snapshot};
    use crate::settings::MemorySettings;
    use crate::state::GateSettings;
    use crate::types::RateSnapshot;

    struct Harness {
        dom: Arc<MemoryDom>,
        cache: Arc<RateCache>,
        conversion: Arc<ConversionState>,
        gate: Arc<FeatureGate>,
    }

    fn page(balance: &str) -> FragmentNode {
        FragmentNode::element("header")
            .with_id("top-bar")
            .with_child(FragmentNode::element("span").with_id(BALANCE_ELEMENT_ID).with_text(balance))
    }

    async fn harness(outcomes: Vec<Option<Result<RateSnapshot>>>, prefetch: bool) -> Harness {
        let dom = Arc::new(MemoryDom::new());
        dom.mount(dom.root(), &page("123.45")).unwrap();
        let (cache, _) = cache_with(outcomes);
        if prefetch {
            cache.fetch_all().await.unwrap();
        }
        Harness {
            dom,
            cache: Arc::new(cache),
            conversion: Arc::new(ConversionState::new(Arc::new(MemorySettings::new()))),
            gate: Arc::new(FeatureGate::new(GateSettings::default())),
        }
    }

    fn watcher(h: &Harness) -> BalanceWatcher {
        BalanceWatcher::new(h.dom.clone(), h.cache.clone(), h.conversion.clone(), h.gate.clone())
            .with_finder(ElementFinder::new(h.dom.clone()).with_timeout(Duration::from_millis(200)))
    }

    fn value_text(dom: &MemoryDom) -> String {
        let value = dom.elements_by_class(None, BALANCE_VALUE_CLASS)[0];
        dom.text_content(value)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn renders_converted_balance() {
        let h = harness(vec![Some(Ok(snapshot(0.02)))], true).await;
        let mut w = watcher(&h);
        w.attach().await;

        assert_eq!(value_text(&h.dom), "2.47");
        let balance = h.dom.element_by_id(BALANCE_ELEMENT_ID).unwrap();
        let container = h.dom.next_sibling(balance).unwrap();
        assert!(h.dom.has_class(container, BALANCE_MARKER));
    }

    #[tokio::test(start_paused = true)]
    async fn surviving_decoration_is_reused_and_restyled() {
        let h = harness(vec![Some(Ok(snapshot(0.02)))], true).await;
        watcher(&h).attach().await;
        let container = h.dom.elements_by_class(None, BALANCE_MARKER)[0];
        h.dom.set_attr(container, "style", "display:none").unwrap();

        // a fresh instance after re-initialization
        watcher(&h).attach().await;
        assert_eq!(h.dom.elements_by_class(None, BALANCE_MARKER), vec![container]);
        assert_eq!(h.dom.attr(container, "style").as_deref(), Some(BALANCE_STYLE));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_balance_element_is_skipped() {
        let h = harness(vec![], false).await;
        let bar = h.dom.element_by_id("top-bar").unwrap();
        h.dom.remove(bar).unwrap();
        let mut w = watcher(&h);
        w.attach().await;
        assert!(h.dom.elements_by_class(None, BALANCE_MARKER).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn balance_text_and_selection_changes_rerender() {
        let h = harness(vec![Some(Ok(snapshot(0.02)))], true).await;
        let (_tx, rx) = mpsc::channel(4);
        let handle = watcher(&h).start(rx);
        settle().await;
        assert_eq!(value_text(&h.dom), "2.47");

        let balance = h.dom.element_by_id(BALANCE_ELEMENT_ID).unwrap();
        h.dom.set_text(balance, "1,000").unwrap();
        settle().await;
        assert_eq!(value_text(&h.dom), "20.00");

        let select = h.dom.elements_by_class(None, BALANCE_SELECT_CLASS)[0];
        h.dom.set_attr(select, "value", "eur").unwrap();
        settle().await;
        assert_eq!(h.conversion.get(), "eur");
        assert_eq!(value_text(&h.dom), "10.00");

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_balance_gets_exactly_one_decoration() {
        let h = harness(vec![Some(Ok(snapshot(0.02)))], true).await;
        let (_tx, rx) = mpsc::channel(4);
        let handle = watcher(&h).start(rx);
        settle().await;

        let bar = h.dom.element_by_id("top-bar").unwrap();
        h.dom.replace_with(bar, &page("50")).unwrap();
        settle().await;

        assert_eq!(h.dom.elements_by_class(None, BALANCE_MARKER).len(), 1);
        assert_eq!(value_text(&h.dom), "1.00");
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cache_shows_error_then_retries_once() {
        let h = harness(vec![Some(Ok(snapshot(0.02)))], false).await;
        let status = Arc::new(StatusBoard::new());
        let (_tx, rx) = mpsc::channel(4);
        let handle = watcher(&h).with_status(status.clone()).with_retry_delay(Duration::from_secs(3)).start(rx);
        settle().await;

        let value = h.dom.elements_by_class(None, BALANCE_VALUE_CLASS)[0];
        assert_eq!(h.dom.text_content(value), "error");
        assert!(h.dom.has_class(value, BALANCE_ERROR_CLASS));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(value_text(&h.dom), "2.47");
        assert!(!h.dom.has_class(value, BALANCE_ERROR_CLASS));
        assert_eq!(status.snapshot().balance_errors, 1);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn second_failure_is_reported_not_retried() {
        let h = harness(vec![Some(Err(OverlayError::Network("down".into())))], false).await;
        let status = Arc::new(StatusBoard::new());
        let (_tx, rx) = mpsc::channel(4);
        let handle = watcher(&h).with_status(status.clone()).with_retry_delay(Duration::from_secs(3)).start(rx);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(status.snapshot().balance_errors, 2);
        assert_eq!(value_text(&h.dom), "error");
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_converter_removes_decoration() {
        let h = harness(vec![Some(Ok(snapshot(0.02)))], true).await;
        let (tx, rx) = mpsc::channel(4);
        let handle = watcher(&h).start(rx);
        settle().await;
        assert_eq!(h.dom.elements_by_class(None, BALANCE_MARKER).len(), 1);

        h.gate.apply(GateSettings { converter_enabled: false, ..GateSettings::default() });
        tx.send(WatcherCommand::SettingsChanged).await.unwrap();
        settle().await;
        assert!(h.dom.elements_by_class(None, BALANCE_MARKER).is_empty());

        h.gate.apply(GateSettings::default());
        tx.send(WatcherCommand::SettingsChanged).await.unwrap();
        settle().await;
        assert_eq!(h.dom.elements_by_class(None, BALANCE_MARKER).len(), 1);
        handle.abort();
    }
}
