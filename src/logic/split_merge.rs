use std::collections::HashSet;

use crate::model::{CoreError, Element};

/// Aggregate documents built by [`merge_elements`] carry this id instead of
/// any contributing asset id.
pub const AGGREGATE_ID: &str = "AGGREGATED";

/// Header children copied onto every document produced by a split and onto
/// the merge aggregate. Everything else on the root is element payload.
const HEADER_TAGS: &[&str] = &["asset_global_id", "id", "asset_kind"];

fn is_header_tag(el: &Element) -> bool {
    HEADER_TAGS.contains(&el.local_name())
}

/// Splits a `dt_asset` document with one or more `dt_elements` children into
/// independent single-element documents. Root attributes (namespace
/// declarations, `schemaVersion`) and header fields are preserved on each.
pub fn split_document(root: &Element) -> Result<Vec<Element>, CoreError> {
    if root.local_name() != "dt_asset" {
        return Err(CoreError::validation(format!(
            "expected dt_asset root, got '{}'",
            root.local_name()
        )));
    }

    let elements = root.children_named("dt_elements");
    if elements.is_empty() {
        return Err(CoreError::validation("dt_asset has no dt_elements to split"));
    }

    let header: Vec<Element> = root
        .children
        .iter()
        .filter(|c| is_header_tag(c))
        .cloned()
        .collect();

    let mut docs = Vec::with_capacity(elements.len());
    for element in elements {
        let mut doc = Element::new(root.name.clone());
        doc.attributes = root.attributes.clone();
        doc.children.extend(header.iter().cloned());
        doc.push((*element).clone());
        docs.push(doc);
    }
    Ok(docs)
}

/// Convenience wrapper over [`split_document`] for raw XML payloads.
pub fn split_xml(xml: &str) -> Result<Vec<String>, CoreError> {
    let root = Element::parse(xml)?;
    Ok(split_document(&root)?.iter().map(Element::to_xml).collect())
}

/// Merges single-element documents back into one aggregate `dt_asset`.
/// Header fields come from the first document except for `id`, which is
/// always [`AGGREGATE_ID`]. Later elements sharing an
/// (element_id, `@xsi:type`) pair with an earlier one are dropped.
pub fn merge_documents(docs: &[Element]) -> Result<Element, CoreError> {
    let first = docs
        .first()
        .ok_or_else(|| CoreError::validation("nothing to merge"))?;
    if first.local_name() != "dt_asset" {
        return Err(CoreError::validation(format!(
            "expected dt_asset root, got '{}'",
            first.local_name()
        )));
    }

    let mut aggregate = Element::new(first.name.clone());
    aggregate.attributes = first.attributes.clone();
    for header in first.children.iter().filter(|c| is_header_tag(c)) {
        if header.local_name() == "id" {
            aggregate.push(Element::with_text("id", AGGREGATE_ID));
        } else {
            aggregate.push(header.clone());
        }
    }
    if aggregate.child("id").is_none() {
        aggregate.push(Element::with_text("id", AGGREGATE_ID));
    }

    let mut seen: HashSet<(String, String)> = HashSet::new();
    for doc in docs {
        for element in doc.children_named("dt_elements") {
            let element_id = element.child_text("element_id").unwrap_or_default();
            let xsi_type = element.xsi_type().unwrap_or_default();
            if seen.insert((element_id.to_string(), xsi_type.to_string())) {
                aggregate.push((*element).clone());
            }
        }
    }
    Ok(aggregate)
}

/// Merges raw XML payloads; see [`merge_documents`].
pub fn merge_xml(docs: &[String]) -> Result<String, CoreError> {
    let parsed = docs
        .iter()
        .map(|xml| Element::parse(xml))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merge_documents(&parsed)?.to_xml())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTI: &str = r#"<dt_asset xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" schemaVersion="v31">
  <asset_global_id>https://digital-thread.re/kitech/g1</asset_global_id>
  <id>prj-1</id>
  <asset_kind>instance</asset_kind>
  <dt_elements xsi:type="dt_material"><element_id>m1</element_id></dt_elements>
  <dt_elements xsi:type="dt_machine_tool"><element_id>mt1</element_id></dt_elements>
  <dt_elements xsi:type="dt_material"><element_id>m2</element_id></dt_elements>
</dt_asset>"#;

    #[test]
    fn split_keeps_header_on_every_document() {
        let docs = split_xml(MULTI).unwrap();
        assert_eq!(docs.len(), 3);
        for doc in &docs {
            let root = Element::parse(doc).unwrap();
            assert_eq!(root.attr("schemaVersion"), Some("v31"));
            assert_eq!(
                root.child_text("asset_global_id"),
                Some("https://digital-thread.re/kitech/g1")
            );
            assert_eq!(root.child_text("id"), Some("prj-1"));
            assert_eq!(root.children_named("dt_elements").len(), 1);
        }
    }

    #[test]
    fn merge_of_split_restores_all_elements() {
        let root = Element::parse(MULTI).unwrap();
        let parts = split_document(&root).unwrap();
        let merged = merge_documents(&parts).unwrap();

        assert_eq!(merged.child_text("id"), Some(AGGREGATE_ID));
        let ids: Vec<_> = merged
            .children_named("dt_elements")
            .into_iter()
            .filter_map(|el| el.child_text("element_id"))
            .collect();
        assert_eq!(ids, vec!["m1", "mt1", "m2"]);
    }

    #[test]
    fn merge_drops_later_duplicates() {
        let root = Element::parse(MULTI).unwrap();
        let mut parts = split_document(&root).unwrap();
        parts.push(parts[0].clone());
        let merged = merge_documents(&parts).unwrap();
        assert_eq!(merged.children_named("dt_elements").len(), 3);
    }

    #[test]
    fn duplicate_id_with_different_type_survives_merge() {
        let a = Element::parse(
            r#"<dt_asset><asset_global_id>g</asset_global_id><id>x</id>
            <dt_elements xsi:type="dt_material"><element_id>e1</element_id></dt_elements></dt_asset>"#,
        )
        .unwrap();
        let b = Element::parse(
            r#"<dt_asset><asset_global_id>g</asset_global_id><id>y</id>
            <dt_elements xsi:type="dt_file"><element_id>e1</element_id></dt_elements></dt_asset>"#,
        )
        .unwrap();
        let merged = merge_documents(&[a, b]).unwrap();
        assert_eq!(merged.children_named("dt_elements").len(), 2);
    }

    #[test]
    fn splitting_an_elementless_document_fails() {
        let err = split_xml("<dt_asset><id>a</id></dt_asset>").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
