//! Harness pages: JSON-serialized fragment trees loaded into a [`MemoryDom`].

use std::path::Path;

use tracing::info;

use super::{Dom, Fragment, MemoryDom};
use crate::error::Result;

/// Parses a page fixture (a JSON array of fragment nodes) into a fresh document.
pub fn parse_page(json: &str) -> Result<MemoryDom> {
    let fragment: Fragment = serde_json::from_str(json)?;
    let dom = MemoryDom::new();
    let root = dom.root();
    for node in &fragment {
        dom.mount(root, node)?;
    }
    Ok(dom)
}

pub fn load_page(path: impl AsRef<Path>) -> Result<MemoryDom> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)?;
    let dom = parse_page(&json)?;
    info!("Loaded page fixture from {}", path.display());
    Ok(dom)
}
