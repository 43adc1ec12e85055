use crate::model::asset::KEY_ELEMENT_FULLPATH;
use crate::model::element::Element;

/// Tree location a typed reference attaches at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorKind {
    Workplan,
    Workpiece,
    Operation,
}

/// Disambiguating parameters a rule may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefParam {
    WorkplanId,
    WorkpieceId,
    WorkingstepId,
}

impl RefParam {
    pub fn name(self) -> &'static str {
        match self {
            RefParam::WorkplanId => "workplan_id",
            RefParam::WorkpieceId => "workpiece_id",
            RefParam::WorkingstepId => "workingstep_id",
        }
    }
}

/// Static behavior parameters for one (referenced type, category) pair.
#[derive(Debug, Clone, Copy)]
pub struct RefRule {
    pub ref_type: &'static str,
    pub anchor: AnchorKind,
    pub tag: &'static str,
    /// Prefix for auto-incremented local element ids (`machine-tool-001`).
    pub id_prefix: &'static str,
    pub requires: &'static [RefParam],
}

const RULES: &[RefRule] = &[
    RefRule {
        ref_type: "dt_machine_tool",
        anchor: AnchorKind::Workplan,
        tag: "ref_dt_machine_tool",
        id_prefix: "machine-tool",
        requires: &[RefParam::WorkplanId],
    },
    RefRule {
        ref_type: "dt_material",
        anchor: AnchorKind::Workpiece,
        tag: "ref_dt_material",
        id_prefix: "material",
        requires: &[RefParam::WorkpieceId],
    },
    RefRule {
        ref_type: "dt_cutting_tool_13399",
        anchor: AnchorKind::Operation,
        tag: "ref_dt_cutting_tool",
        id_prefix: "cutting-tool",
        requires: &[RefParam::WorkplanId, RefParam::WorkingstepId],
    },
];

/// Rule lookup. `dt_file` is handled out-of-band (inverse references), so it
/// never appears in the table.
pub fn rule_for(ref_type: &str, _category: Option<&str>) -> Option<&'static RefRule> {
    RULES.iter().find(|r| r.ref_type == ref_type)
}

/// Builds an embedded reference node:
///
/// ```xml
/// <ref_dt_machine_tool>
///   <element_id>machine-tool-001</element_id>
///   <category>reference</category>
///   <display_name>...</display_name>
///   <element_description/>
///   <keys><key>DT_ELEMENT_FULLPATH</key><value>uri</value></keys>
/// </ref_dt_machine_tool>
/// ```
pub fn build_reference_element(
    tag: &str,
    element_id: &str,
    display_name: &str,
    fullpath: &str,
) -> Element {
    let mut node = Element::new(tag);
    node.push(Element::with_text("element_id", element_id));
    node.push(Element::with_text("category", "reference"));
    node.push(Element::with_text("display_name", display_name));
    node.push(Element::new("element_description"));
    let mut keys = Element::new("keys");
    keys.push(Element::with_text("key", KEY_ELEMENT_FULLPATH));
    keys.push(Element::with_text("value", fullpath));
    node.push(keys);
    node
}

/// Reads the `DT_ELEMENT_FULLPATH` value off an embedded reference node.
pub fn reference_fullpath(node: &Element) -> Option<&str> {
    node.children_named("keys").into_iter().find_map(|keys| {
        match (keys.child_text("key"), keys.child_text("value")) {
            (Some(KEY_ELEMENT_FULLPATH), Some(value)) => Some(value),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_table_covers_the_three_anchored_types() {
        assert_eq!(
            rule_for("dt_machine_tool", None).map(|r| r.anchor),
            Some(AnchorKind::Workplan)
        );
        assert_eq!(
            rule_for("dt_material", None).map(|r| r.anchor),
            Some(AnchorKind::Workpiece)
        );
        assert_eq!(
            rule_for("dt_cutting_tool_13399", None).map(|r| r.anchor),
            Some(AnchorKind::Operation)
        );
        assert!(rule_for("dt_file", Some("NC")).is_none());
        assert!(rule_for("dt_unknown", None).is_none());
    }

    #[test]
    fn built_reference_round_trips_its_fullpath() {
        let node = build_reference_element(
            "ref_dt_material",
            "material-001",
            "Steel",
            "https://digital-thread.re/kitech/g1/a1/m1",
        );
        assert_eq!(
            reference_fullpath(&node),
            Some("https://digital-thread.re/kitech/g1/a1/m1")
        );
        assert_eq!(node.child_text("category"), Some("reference"));
    }
}
