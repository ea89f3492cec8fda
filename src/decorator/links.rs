use crate::config::{DECORATION_CLASS, MARKET_LINKS_MARKER};
use crate::dom::FragmentNode;
use crate::types::{collection_slug, ItemRecord, Marketplace};

/// Identifies one rendered link block; a block with another key is stale.
pub fn links_key(record: &ItemRecord, marketplaces: &[Marketplace]) -> String {
    let names: Vec<String> = marketplaces.iter().map(|m| m.to_string()).collect();
    format!("{}:{}:{}", record.id, collection_slug(record.generation), names.join(","))
}

pub fn link_block(record: &ItemRecord, marketplaces: &[Marketplace], official_base: &str) -> FragmentNode {
    let collection = collection_slug(record.generation);
    let mut block = FragmentNode::element("span")
        .with_class(DECORATION_CLASS)
        .with_class(MARKET_LINKS_MARKER)
        .with_attr("data-so-key", links_key(record, marketplaces))
        .with_attr("data-so-item", record.id.clone());

    for market in marketplaces {
        block = block.with_child(
            FragmentNode::element("a")
                .with_class(DECORATION_CLASS)
                .with_class("so-market-link")
                .with_attr("href", market.listing_url(official_base, &record.id, &collection))
                .with_attr("target", "_blank")
                .with_attr("rel", "noopener noreferrer")
                .with_attr("title", format!("View on {}", market.label()))
                .with_text(market.label()),
        );
    }
    block
}
