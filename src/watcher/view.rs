use crate::config::{
    BALANCE_ERROR_CLASS, BALANCE_MARKER, BALANCE_SELECT_CLASS, BALANCE_STYLE, BALANCE_SYMBOL_CLASS,
    BALANCE_VALUE_CLASS, DECORATION_CLASS,
};
use crate::dom::{Dom, DomError, FragmentNode, NodeId};
use crate::rates::math::Converted;
use crate::types::{conversion_spec, DEFAULT_CONVERSION};

/// Handles into an attached balance decoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceView {
    pub container: NodeId,
    pub select: NodeId,
    pub symbol: NodeId,
    pub value: NodeId,
}

/// Selector options: enabled keys that exist in the table, or the default alone.
pub fn option_keys(enabled: &[String]) -> Vec<&'static str> {
    let keys: Vec<&'static str> = enabled.iter().filter_map(|k| conversion_spec(k)).map(|s| s.key).collect();
    if keys.is_empty() {
        vec![DEFAULT_CONVERSION]
    } else {
        keys
    }
}

pub fn container(enabled: &[String], active: &str) -> FragmentNode {
    let mut select = FragmentNode::element("select")
        .with_class(DECORATION_CLASS)
        .with_class(BALANCE_SELECT_CLASS)
        .with_attr("value", active);
    for key in option_keys(enabled) {
        let mut option = FragmentNode::element("option").with_class(DECORATION_CLASS).with_attr("value", key);
        if let Some(spec) = conversion_spec(key) {
            option = option.with_attr("title", spec.display_name);
        }
        select = select.with_child(option.with_text(key.to_uppercase()));
    }

    FragmentNode::element("span")
        .with_class(DECORATION_CLASS)
        .with_class(BALANCE_MARKER)
        .with_attr("style", BALANCE_STYLE)
        .with_child(select)
        .with_child(FragmentNode::element("span").with_class(DECORATION_CLASS).with_class(BALANCE_SYMBOL_CLASS))
        .with_child(FragmentNode::element("span").with_class(DECORATION_CLASS).with_class(BALANCE_VALUE_CLASS))
}

impl BalanceView {
    /// Resolves the parts of an existing container; `None` if any is missing.
    pub fn locate(dom: &dyn Dom, container: NodeId) -> Option<Self> {
        let first = |class: &str| dom.elements_by_class(Some(container), class).first().copied();
        Some(Self {
            container,
            select: first(BALANCE_SELECT_CLASS)?,
            symbol: first(BALANCE_SYMBOL_CLASS)?,
            value: first(BALANCE_VALUE_CLASS)?,
        })
    }

    pub fn is_connected(&self, dom: &dyn Dom) -> bool {
        dom.contains(self.container) && dom.contains(self.value)
    }

    pub fn show(&self, dom: &dyn Dom, converted: &Converted) -> Result<(), DomError> {
        dom.set_attr(self.value, "class", &format!("{DECORATION_CLASS} {BALANCE_VALUE_CLASS}"))?;
        dom.set_text(self.symbol, converted.symbol)?;
        dom.set_text(self.value, &converted.display())?;
        if dom.attr(self.select, "value").as_deref() != Some(converted.key) {
            dom.set_attr(self.select, "value", converted.key)?;
        }
        Ok(())
    }

    pub fn show_error(&self, dom: &dyn Dom) -> Result<(), DomError> {
        dom.set_attr(
            self.value,
            "class",
            &format!("{DECORATION_CLASS} {BALANCE_VALUE_CLASS} {BALANCE_ERROR_CLASS}"),
        )?;
        dom.set_text(self.symbol, "")?;
        dom.set_text(self.value, "error")
    }
}
