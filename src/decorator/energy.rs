use crate::config::{DECORATION_CLASS, ENERGY_MARKER};
use crate::dom::FragmentNode;
use crate::types::ItemRecord;

/// Projected energy change over the next cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnergyOutlook {
    /// Working or racing: the item spends energy instead of recovering it.
    Draining { amount: f64 },
    /// Full recovery fits under the cap.
    Gain { amount: f64 },
    /// Recovery would overflow `max`; `waste` is the part that is lost.
    Capped { gain: f64, waste: f64 },
}

pub fn outlook(record: &ItemRecord, recovery: f64, work_drain: f64) -> EnergyOutlook {
    if record.status.is_active() {
        return EnergyOutlook::Draining { amount: work_drain };
    }
    let headroom = (record.energy.max - record.energy.current).max(0.0);
    if recovery <= headroom {
        EnergyOutlook::Gain { amount: recovery }
    } else {
        EnergyOutlook::Capped { gain: headroom, waste: recovery - headroom }
    }
}

impl EnergyOutlook {
    pub fn label(&self) -> String {
        match *self {
            EnergyOutlook::Draining { amount } => format!(" (-{})", fmt_amount(amount)),
            EnergyOutlook::Gain { amount } => format!(" (+{})", fmt_amount(amount)),
            EnergyOutlook::Capped { gain, waste } if gain <= 0.0 => {
                format!(" ({} wasted)", fmt_amount(waste))
            }
            EnergyOutlook::Capped { gain, waste } => {
                format!(" (+{}, {} wasted)", fmt_amount(gain), fmt_amount(waste))
            }
        }
    }

    pub fn tooltip(&self) -> String {
        match *self {
            EnergyOutlook::Draining { amount } => {
                format!("Busy: loses {} energy per cycle until it rests", fmt_amount(amount))
            }
            EnergyOutlook::Gain { amount } => format!("Recovers {} energy next cycle", fmt_amount(amount)),
            EnergyOutlook::Capped { gain, waste } => format!(
                "Recovers {} energy next cycle, {} is wasted at max capacity",
                fmt_amount(gain),
                fmt_amount(waste)
            ),
        }
    }

    fn tone_class(&self) -> &'static str {
        match self {
            EnergyOutlook::Draining { .. } => "so-delta-negative",
            EnergyOutlook::Gain { .. } => "so-delta-positive",
            EnergyOutlook::Capped { .. } => "so-delta-waste",
        }
    }
}

/// Whole numbers print without decimals, everything else with one.
fn fmt_amount(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.0}")
    } else {
        format!("{v:.1}")
    }
}

/// Changes whenever the rendered annotation would change.
pub fn annotation_key(record: &ItemRecord) -> String {
    format!("{}:{}/{}:{}", record.id, record.energy.current, record.energy.max, record.status)
}

pub fn annotation(record: &ItemRecord, outlook: &EnergyOutlook) -> FragmentNode {
    FragmentNode::element("span")
        .with_class(DECORATION_CLASS)
        .with_class(ENERGY_MARKER)
        .with_class(outlook.tone_class())
        .with_attr("data-so-key", annotation_key(record))
        .with_attr("data-so-item", record.id.clone())
        .with_attr("title", outlook.tooltip())
        .with_text(outlook.label())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Energy, ItemStatus};

    fn record(current: f64, max: f64, status: ItemStatus) -> ItemRecord {
        ItemRecord { id: "7".into(), energy: Energy { current, max }, status, ..Default::default() }
    }

    #[test]
    fn full_energy_wastes_entire_recovery() {
        let o = outlook(&record(100.0, 100.0, ItemStatus::Idle), 10.0, 8.0);
        assert_eq!(o, EnergyOutlook::Capped { gain: 0.0, waste: 10.0 });
        assert_eq!(o.label(), " (10 wasted)");
    }

    #[test]
    fn partial_headroom_splits_gain_and_waste() {
        let o = outlook(&record(96.0, 100.0, ItemStatus::Resting), 10.0, 8.0);
        assert_eq!(o, EnergyOutlook::Capped { gain: 4.0, waste: 6.0 });
        assert_eq!(o.label(), " (+4, 6 wasted)");
    }

    #[test]
    fn room_to_spare_is_a_plain_gain() {
        let o = outlook(&record(50.0, 100.0, ItemStatus::Idle), 10.0, 8.0);
        assert_eq!(o, EnergyOutlook::Gain { amount: 10.0 });
        assert_eq!(o.label(), " (+10)");
    }

    #[test]
    fn active_items_drain_regardless_of_headroom() {
        let o = outlook(&record(100.0, 100.0, ItemStatus::Racing), 10.0, 8.0);
        assert_eq!(o, EnergyOutlook::Draining { amount: 8.0 });
        assert_eq!(o.label(), " (-8)");
    }

    #[test]
    fn fractional_amounts_keep_one_decimal() {
        let o = outlook(&record(0.0, 100.0, ItemStatus::Idle), 2.5, 8.0);
        assert_eq!(o.label(), " (+2.5)");
    }

    #[test]
    fn annotation_is_marked_and_keyed() {
        let r = record(100.0, 100.0, ItemStatus::Idle);
        let node = annotation(&r, &outlook(&r, 10.0, 8.0));
        let FragmentNode::Element { classes, attrs, .. } = node else { panic!("expected element") };
        assert!(classes.iter().any(|c| c == DECORATION_CLASS));
        assert!(classes.iter().any(|c| c == "so-delta-waste"));
        assert_eq!(attrs["data-so-key"], "7:100/100:idle");
        assert!(attrs["title"].contains("wasted"));
    }
}
