//! Label-prefixed line parser for item cards.
//!
//! Each rule maps a verbatim host label to a field setter. Lines that match no
//! rule are ignored, values that do not parse leave the field at its default.

use crate::config::DECORATION_CLASS;
use crate::dom::{Dom, NodeId};
use crate::types::{Energy, ItemRecord, ItemStatus, StatPair};

/// Lines whose element later receives a decoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Id,
    Energy,
}

struct Rule {
    label: &'static str,
    apply: fn(&mut ItemRecord, &str),
    anchor: Option<Anchor>,
}

const RULES: &[Rule] = &[
    Rule { label: "Name:", apply: |r, v| r.name = v.to_string(), anchor: None },
    Rule { label: "ID:", apply: |r, v| r.id = v.trim_start_matches('#').trim().to_string(), anchor: Some(Anchor::Id) },
    Rule { label: "Level:", apply: |r, v| r.level = leading_number(v) as u32, anchor: None },
    Rule { label: "Power:", apply: |r, v| r.power = leading_number(v), anchor: None },
    Rule { label: "Spirit:", apply: |r, v| r.spirit = stat_pair(v), anchor: None },
    Rule { label: "Speed:", apply: |r, v| r.speed = stat_pair(v), anchor: None },
    Rule { label: "Energy:", apply: |r, v| r.energy = energy(v), anchor: Some(Anchor::Energy) },
    Rule { label: "Status:", apply: |r, v| r.status = ItemStatus::parse(v), anchor: None },
    Rule { label: "Generation:", apply: |r, v| r.generation = leading_number(v) as u32, anchor: None },
    Rule {
        label: "Breeds:",
        apply: |r, v| {
            let (used, total) = ratio(v);
            r.breeds_used = used as u32;
            r.breeds_total = total as u32;
        },
        anchor: None,
    },
    Rule { label: "Items:", apply: |r, v| r.items = item_list(v), anchor: None },
];

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub record: ItemRecord,
    /// Element holding the `ID:` line.
    pub id_anchor: Option<NodeId>,
    /// Element holding the `Energy:` line.
    pub energy_anchor: Option<NodeId>,
}

/// Parses `(element, text)` lines in document order. The first match per label wins.
pub fn extract(lines: &[(NodeId, String)]) -> Extraction {
    let mut out = Extraction::default();
    let mut seen = [false; RULES.len()];
    for (node, line) in lines {
        let line = line.trim();
        let Some((idx, rule)) = RULES.iter().enumerate().find(|(_, r)| line.starts_with(r.label)) else {
            continue;
        };
        if seen[idx] {
            continue;
        }
        seen[idx] = true;
        (rule.apply)(&mut out.record, line[rule.label.len()..].trim());
        match rule.anchor {
            Some(Anchor::Id) => out.id_anchor = Some(*node),
            Some(Anchor::Energy) => out.energy_anchor = Some(*node),
            None => {}
        }
    }
    out
}

/// Reads one card from the document, ignoring anything we injected.
pub fn extract_item(dom: &dyn Dom, item: NodeId) -> Extraction {
    let mut ex = extract(&dom.text_lines(item, Some(DECORATION_CLASS)));
    ex.record.dom_node = Some(item);
    ex
}

/// Current energy of a card, or `None` when the card has no energy line.
pub fn read_energy(dom: &dyn Dom, item: NodeId) -> Option<f64> {
    let ex = extract_item(dom, item);
    ex.energy_anchor.map(|_| ex.record.energy.current)
}

// ---------------------------------------------------------------------------
// Value parsers
// ---------------------------------------------------------------------------

/// Leading signed decimal of `s`, thousands separators allowed; 0 when absent.
fn leading_number(s: &str) -> f64 {
    let s = s.trim_start().trim_start_matches('+');
    let mut end = 0;
    for (i, c) in s.char_indices() {
        let ok = c.is_ascii_digit() || c == '.' || c == ',' || (i == 0 && c == '-');
        if !ok {
            break;
        }
        end = i + c.len_utf8();
    }
    s[..end].replace(',', "").parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// `"40 (+5)"` → base 40, bonus 5.
fn stat_pair(v: &str) -> StatPair {
    match v.split_once('(') {
        Some((base, bonus)) => StatPair { base: leading_number(base), bonus: leading_number(bonus) },
        None => StatPair { base: leading_number(v), bonus: 0.0 },
    }
}

/// `"80/100"` → (80, 100).
fn ratio(v: &str) -> (f64, f64) {
    match v.split_once('/') {
        Some((a, b)) => (leading_number(a), leading_number(b)),
        None => (leading_number(v), 0.0),
    }
}

fn energy(v: &str) -> Energy {
    let (current, max) = ratio(v);
    Energy { current, max }
}

fn item_list(v: &str) -> Vec<String> {
    if v.eq_ignore_ascii_case("none") || v == "-" {
        return Vec::new();
    }
    v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{FragmentNode, MemoryDom};

    fn lines(texts: &[&str]) -> Vec<(NodeId, String)> {
        texts.iter().enumerate().map(|(i, t)| (NodeId(i as u64 + 1), t.to_string())).collect()
    }

    #[test]
    fn parses_every_labelled_field() {
        let ex = extract(&lines(&[
            "Name: Thunder Hoof",
            "ID: #10442",
            "Level: 12",
            "Power: 1,204.5",
            "Spirit: 40 (+5)",
            "Speed: 61 (-3)",
            "Energy: 80/100",
            "Status: Working",
            "Generation: 2",
            "Breeds: 1/3",
            "Items: Saddle, Golden Shoe,",
        ]));
        let r = &ex.record;
        assert_eq!(r.name, "Thunder Hoof");
        assert_eq!(r.id, "10442");
        assert_eq!(r.level, 12);
        assert_eq!(r.power, 1204.5);
        assert_eq!(r.spirit, StatPair { base: 40.0, bonus: 5.0 });
        assert_eq!(r.speed, StatPair { base: 61.0, bonus: -3.0 });
        assert_eq!(r.energy, Energy { current: 80.0, max: 100.0 });
        assert_eq!(r.status, ItemStatus::Working);
        assert_eq!(r.generation, 2);
        assert_eq!((r.breeds_used, r.breeds_total), (1, 3));
        assert_eq!(r.items, vec!["Saddle", "Golden Shoe"]);
        assert_eq!(ex.id_anchor, Some(NodeId(2)));
        assert_eq!(ex.energy_anchor, Some(NodeId(7)));
    }

    #[test]
    fn unknown_lines_and_bad_values_default() {
        let ex = extract(&lines(&["Owner: someone", "Level: ??", "Energy: full", "Items: None"]));
        assert_eq!(ex.record.level, 0);
        assert_eq!(ex.record.energy, Energy::default());
        assert!(ex.record.items.is_empty());
        assert!(ex.id_anchor.is_none());
    }

    #[test]
    fn labels_are_matched_verbatim() {
        let ex = extract(&lines(&["level: 9", "Level 9", "  Level: 9"]));
        assert_eq!(ex.record.level, 9);
        assert_eq!(ex.id_anchor, None);
    }

    #[test]
    fn first_occurrence_wins() {
        let ex = extract(&lines(&["ID: 1", "ID: 2"]));
        assert_eq!(ex.record.id, "1");
        assert_eq!(ex.id_anchor, Some(NodeId(1)));
    }

    #[test]
    fn extraction_skips_injected_nodes() {
        let dom = MemoryDom::new();
        let card = dom
            .mount(
                dom.root(),
                &FragmentNode::element("div")
                    .with_class("HorseCard_card__x")
                    .with_child(FragmentNode::element("p").with_text("ID: 5"))
                    .with_child(
                        FragmentNode::element("p").with_text("Energy: 3/9").with_child(
                            FragmentNode::element("span").with_class(DECORATION_CLASS).with_text("Energy: 99/99"),
                        ),
                    ),
            )
            .unwrap();
        let ex = extract_item(&dom, card);
        assert_eq!(ex.record.energy, Energy { current: 3.0, max: 9.0 });
        assert_eq!(ex.record.dom_node, Some(card));
        assert_eq!(read_energy(&dom, card), Some(3.0));
    }
}
