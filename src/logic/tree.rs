use crate::model::{CoreError, Element};

/// Kinds of nodes references anchor at inside a `dt_project` element tree.
pub use crate::model::AnchorKind;

/// Picks the `dt_project` element with the given element_id out of a parsed
/// `dt_asset` document.
pub fn pick_dt_project<'a>(
    dt_asset: &'a mut Element,
    project_element_id: &str,
) -> Result<&'a mut Element, CoreError> {
    let found = dt_asset.children_named_mut("dt_elements").into_iter().find(|el| {
        el.xsi_type().map(|t| t == "dt_project").unwrap_or(false)
            && el.child_text("element_id") == Some(project_element_id)
    });
    found.ok_or_else(|| {
        CoreError::not_found(format!(
            "dt_project element '{}' not found in document",
            project_element_id
        ))
    })
}

/// Linear scan over a (possibly singleton) element list matching the
/// `xsi:type` discriminator and an id field.
pub fn find_node_by_type_and_id<'a>(
    elements: &'a [&'a Element],
    type_discriminator: &str,
    id_field: &str,
    id_value: &str,
) -> Option<&'a Element> {
    elements.iter().copied().find(|el| {
        el.xsi_type().map(|t| t == type_discriminator).unwrap_or(false)
            && el.child_text(id_field) == Some(id_value)
    })
}

fn looks_like_workplan(el: &Element) -> bool {
    let by_name = matches!(el.local_name(), "main_workplan" | "workplan");
    let by_type = el
        .xsi_type()
        .map(|t| t.ends_with("workplan"))
        .unwrap_or(false);
    (by_name || by_type) && el.child("its_id").is_some()
}

fn looks_like_workpiece(el: &Element) -> bool {
    let by_name = matches!(el.local_name(), "its_workpieces" | "workpiece");
    let by_type = el
        .xsi_type()
        .map(|t| t.ends_with("workpiece"))
        .unwrap_or(false);
    (by_name || by_type) && el.child("its_id").is_some()
}

fn find_descendant<'a>(
    el: &'a mut Element,
    pred: &dyn Fn(&Element) -> bool,
) -> Option<&'a mut Element> {
    if pred(el) {
        return Some(el);
    }
    for child in el.children.iter_mut() {
        if let Some(found) = find_descendant(child, pred) {
            return Some(found);
        }
    }
    None
}

/// Finds the workplan with the given `its_id` inside a project element.
/// `main_workplan` is checked directly first; the depth-first fallback covers
/// nested or renamed containers.
pub fn find_workplan<'a>(
    project: &'a mut Element,
    workplan_id: &str,
) -> Result<&'a mut Element, CoreError> {
    let direct = project.children.iter().position(|c| {
        c.local_name() == "main_workplan" && c.child_text("its_id") == Some(workplan_id)
    });
    if let Some(index) = direct {
        return Ok(&mut project.children[index]);
    }

    let wanted = workplan_id.to_string();
    find_descendant(project, &move |el: &Element| {
        looks_like_workplan(el) && el.child_text("its_id") == Some(wanted.as_str())
    })
    .ok_or_else(|| CoreError::not_found(format!("workplan '{}' not found", workplan_id)))
}

/// Finds the workpiece with the given `its_id` inside a project element.
pub fn find_workpiece<'a>(
    project: &'a mut Element,
    workpiece_id: &str,
) -> Result<&'a mut Element, CoreError> {
    let wanted = workpiece_id.to_string();
    find_descendant(project, &move |el: &Element| {
        looks_like_workpiece(el) && el.child_text("its_id") == Some(wanted.as_str())
    })
    .ok_or_else(|| CoreError::not_found(format!("workpiece '{}' not found", workpiece_id)))
}

/// Finds the `its_operation` node of the workingstep with the given `its_id`
/// under a workplan. The operation must already exist; nothing is created.
pub fn find_operation<'a>(
    workplan: &'a mut Element,
    workingstep_id: &str,
) -> Result<&'a mut Element, CoreError> {
    let ws_index = workplan
        .children
        .iter()
        .position(|el| {
            el.local_name() == "its_elements"
                && el.child_text("its_id") == Some(workingstep_id)
        })
        .ok_or_else(|| {
            CoreError::not_found(format!("workingstep '{}' not found", workingstep_id))
        })?;

    workplan.children[ws_index]
        .child_mut("its_operation")
        .ok_or_else(|| {
            CoreError::not_found(format!(
                "workingstep '{}' has no its_operation",
                workingstep_id
            ))
        })
}

/// Counts workingstep children of a workplan, recognising both typed
/// elements (`xsi:type` ending in `workingstep`) and wrapper nodes.
pub fn count_workingsteps(workplan: &Element) -> usize {
    workplan
        .children_named("its_elements")
        .into_iter()
        .filter(|el| {
            let by_type = el
                .xsi_type()
                .map(|t| t.ends_with("workingstep"))
                .unwrap_or(false);
            let wrapped = el.child("workingstep").is_some()
                || el.child("machining_workingstep").is_some();
            by_type || wrapped
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_xml() -> Element {
        let xml = r#"<dt_asset>
  <asset_global_id>https://digital-thread.re/kitech/g1</asset_global_id>
  <id>prj-1</id>
  <dt_elements xsi:type="dt_project">
    <element_id>p1</element_id>
    <main_workplan>
      <its_id>wp1</its_id>
      <its_elements xsi:type="machining_workingstep">
        <its_id>ws1</its_id>
        <its_operation><its_id>op1</its_id></its_operation>
      </its_elements>
    </main_workplan>
    <its_workpieces>
      <its_id>piece-1</its_id>
    </its_workpieces>
  </dt_elements>
</dt_asset>"#;
        Element::parse(xml).unwrap()
    }

    #[test]
    fn picks_project_by_element_id() {
        let mut doc = project_xml();
        assert!(pick_dt_project(&mut doc, "p1").is_ok());
        assert!(matches!(
            pick_dt_project(&mut doc, "nope"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn finds_main_workplan_directly() {
        let mut doc = project_xml();
        let project = pick_dt_project(&mut doc, "p1").unwrap();
        let wp = find_workplan(project, "wp1").unwrap();
        assert_eq!(wp.local_name(), "main_workplan");
    }

    #[test]
    fn finds_workpiece_and_operation() {
        let mut doc = project_xml();
        let project = pick_dt_project(&mut doc, "p1").unwrap();
        assert!(find_workpiece(project, "piece-1").is_ok());

        let wp = find_workplan(project, "wp1").unwrap();
        let op = find_operation(wp, "ws1").unwrap();
        assert_eq!(op.child_text("its_id"), Some("op1"));
        assert!(matches!(
            find_operation(wp, "ws-missing"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn counts_only_workingstep_children() {
        let mut doc = project_xml();
        let project = pick_dt_project(&mut doc, "p1").unwrap();
        let wp = find_workplan(project, "wp1").unwrap();
        assert_eq!(count_workingsteps(wp), 1);
    }
}
