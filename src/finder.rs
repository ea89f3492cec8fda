use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::DISCOVERY_TIMEOUT_MS;
use crate::dom::{Dom, NodeId};
use crate::error::{OverlayError, Result};

/// Bounded-wait lookup of a single element by id.
///
/// Resolves at most once. The mutation subscription lives inside the returned
/// future, so success, timeout and the caller dropping the future all
/// unsubscribe.
#[derive(Clone)]
pub struct ElementFinder {
    dom: Arc<dyn Dom>,
    timeout: Duration,
}

impl ElementFinder {
    pub fn new(dom: Arc<dyn Dom>) -> Self {
        Self { dom, timeout: Duration::from_millis(DISCOVERY_TIMEOUT_MS) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn find(&self, id: &str) -> Result<NodeId> {
        if let Some(node) = self.dom.element_by_id(id) {
            return Ok(node);
        }

        let mut sub = self.dom.observe();
        // The element may have landed between the first lookup and subscribing.
        if let Some(node) = self.dom.element_by_id(id) {
            return Ok(node);
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                batch = sub.recv() => {
                    if batch.is_none() {
                        break;
                    }
                    if let Some(node) = self.dom.element_by_id(id) {
                        debug!(%id, "[FINDER] element appeared");
                        return Ok(node);
                    }
                }
                _ = &mut deadline => break,
            }
        }

        debug!(%id, timeout_ms = self.timeout.as_millis() as u64, "[FINDER] gave up");
        Err(OverlayError::DiscoveryTimeout(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{FragmentNode, MemoryDom};

    fn balance() -> FragmentNode {
        FragmentNode::element("span").with_id("wallet-balance").with_text("10")
    }

    #[tokio::test]
    async fn present_element_resolves_without_subscribing() {
        let dom = Arc::new(MemoryDom::new());
        let node = dom.mount(dom.root(), &balance()).unwrap();
        let finder = ElementFinder::new(dom.clone());
        assert_eq!(finder.find("wallet-balance").await.unwrap(), node);
        assert_eq!(dom.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_element_resolves_and_unsubscribes() {
        let dom = Arc::new(MemoryDom::new());
        let finder = ElementFinder::new(dom.clone());

        let writer = dom.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_200)).await;
            writer.mount(writer.root(), &FragmentNode::element("div")).unwrap();
            writer.mount(writer.root(), &balance()).unwrap();
        });

        let node = finder.find("wallet-balance").await.unwrap();
        assert_eq!(dom.element_by_id("wallet-balance"), Some(node));
        assert_eq!(dom.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_element_times_out_and_unsubscribes() {
        let dom = Arc::new(MemoryDom::new());
        let finder = ElementFinder::new(dom.clone()).with_timeout(Duration::from_secs(5));
        let started = tokio::time::Instant::now();

        let err = finder.find("wallet-balance").await.unwrap_err();
        assert!(matches!(err, OverlayError::DiscoveryTimeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(dom.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_unsubscribes() {
        let dom = Arc::new(MemoryDom::new());
        let finder = ElementFinder::new(dom.clone());
        let outcome = tokio::time::timeout(Duration::from_millis(100), finder.find("wallet-balance")).await;
        assert!(outcome.is_err());
        assert_eq!(dom.subscriber_count(), 0);
    }
}
