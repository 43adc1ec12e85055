use crate::model::{CoreError, Element};

/// Structural validation applied to every XML payload before it is written.
/// This checks document shape, not the full target XSD: root tag, required
/// header fields, and that each `dt_elements` child carries a type
/// discriminator and an element id.
pub fn validate_asset_element(root: &Element) -> Result<(), CoreError> {
    if root.local_name() != "dt_asset" {
        return Err(CoreError::validation(format!(
            "expected dt_asset root, got '{}'",
            root.local_name()
        )));
    }

    for (field, label) in [("asset_global_id", "asset_global_id"), ("id", "id")] {
        let present = root
            .child_text(field)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !present {
            return Err(CoreError::validation(format!(
                "dt_asset is missing {}",
                label
            )));
        }
    }

    let elements = root.children_named("dt_elements");
    if elements.is_empty() {
        return Err(CoreError::validation("dt_asset has no dt_elements"));
    }
    for (i, element) in elements.iter().enumerate() {
        if element.xsi_type().is_none() {
            return Err(CoreError::validation(format!(
                "dt_elements[{}] is missing xsi:type",
                i
            )));
        }
        let has_id = element
            .child_text("element_id")
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !has_id {
            return Err(CoreError::validation(format!(
                "dt_elements[{}] is missing element_id",
                i
            )));
        }
    }
    Ok(())
}

pub fn validate_asset_xml(xml: &str) -> Result<(), CoreError> {
    let root = Element::parse(xml)?;
    validate_asset_element(&root)
}
