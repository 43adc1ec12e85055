use serde::Serialize;

use crate::config::AddressingConfig;
use crate::logic::addressing::normalize_global_id;
use crate::logic::path::extract_path;
use crate::logic::schema::validate_asset_element;
use crate::logic::split_merge::{merge_documents, split_document};
use crate::model::asset::{KEY_ASSET, KEY_FILE_OID, KEY_GLOBAL_ASSET, KEY_PROJECT, KEY_WORKPLAN, TYPE_FILE, TYPE_PROJECT};
use crate::model::{
    AssetDocument, AssetKeys, AssetMeta, AssetQuery, CoreError, Element, NewAsset,
};
use crate::store::traits::Store;

/// Parses and validates an asset payload, qualifying a bare
/// `asset_global_id` into a full URI before the key fields are derived.
fn prepare_asset(xml: &str, cfg: &AddressingConfig) -> Result<(Element, AssetMeta), CoreError> {
    let mut root = Element::parse(xml)?;
    if let Some(raw) = root.child_text("asset_global_id").map(str::to_string) {
        root.set_child_text("asset_global_id", normalize_global_id(&raw, cfg));
    }
    validate_asset_element(&root)?;
    let meta = AssetMeta::from_element(&root)?;
    Ok((root, meta))
}

fn new_asset(root: &Element, meta: AssetMeta) -> NewAsset {
    NewAsset {
        keys: meta.keys,
        category: meta.category,
        data: root.to_xml(),
        is_upload: false,
        ref_keys: meta.ref_keys,
    }
}

/// Stores a single-element asset payload. With `upsert` false a taken
/// composite key is a conflict; with `upsert` true the document is replaced
/// (subject to the upload lock).
pub async fn create_from_xml<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    xml: &str,
    upsert: bool,
) -> Result<AssetDocument, CoreError> {
    let (root, meta) = prepare_asset(xml, cfg)?;
    let asset = new_asset(&root, meta);
    if upsert {
        store.upsert_asset(asset).await
    } else {
        store.insert_asset(asset).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiCreateItem {
    pub element_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiCreateSummary {
    pub total: usize,
    pub created: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiCreateOutcome {
    pub results: Vec<MultiCreateItem>,
    pub summary: MultiCreateSummary,
}

/// Splits a multi-element payload and stores each element independently.
/// Failures do not abort the batch; the outcome reports per-element results.
pub async fn create_multi_from_xml<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    xml: &str,
) -> Result<MultiCreateOutcome, CoreError> {
    let mut root = Element::parse(xml)?;
    if let Some(raw) = root.child_text("asset_global_id").map(str::to_string) {
        root.set_child_text("asset_global_id", normalize_global_id(&raw, cfg));
    }
    let parts = split_document(&root)?;

    let mut results = Vec::with_capacity(parts.len());
    let mut created = 0usize;
    for part in &parts {
        let element_id = part
            .child("dt_elements")
            .and_then(|el| el.child_text("element_id"))
            .unwrap_or("")
            .to_string();
        match store_single(store, part).await {
            Ok(doc) => {
                created += 1;
                results.push(MultiCreateItem {
                    element_id,
                    ok: true,
                    document_id: Some(doc.id),
                    error: None,
                });
            }
            Err(err) => results.push(MultiCreateItem {
                element_id,
                ok: false,
                document_id: None,
                error: Some(err.to_string()),
            }),
        }
    }

    let total = results.len();
    Ok(MultiCreateOutcome {
        summary: MultiCreateSummary {
            total,
            created,
            failed: total - created,
        },
        results,
    })
}

async fn store_single<S: Store + ?Sized>(
    store: &S,
    part: &Element,
) -> Result<AssetDocument, CoreError> {
    validate_asset_element(part)?;
    let meta = AssetMeta::from_element(part)?;
    store.insert_asset(new_asset(part, meta)).await
}

/// Replaces a stored document's XML, re-deriving its key fields. A type
/// change is always rejected; a key change colliding with another document
/// is a conflict.
pub async fn update_from_xml<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    document_id: &str,
    xml: &str,
) -> Result<AssetDocument, CoreError> {
    let current = store
        .get_asset_by_id(document_id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("no document '{}'", document_id)))?;
    let (root, meta) = prepare_asset(xml, cfg)?;

    if meta.keys.asset_type != current.asset_type {
        return Err(CoreError::validation(format!(
            "type change is forbidden: '{}' -> '{}'",
            current.asset_type, meta.keys.asset_type
        )));
    }
    if meta.keys != current.keys() {
        if let Some(other) = store.get_asset_by_keys(&meta.keys).await? {
            if other.id != current.id {
                return Err(CoreError::DuplicateKey {
                    keys: meta.keys,
                    existing_id: other.id,
                });
            }
        }
    }

    let modified = store
        .replace_asset_by_id(document_id, new_asset(&root, meta))
        .await?;
    if !modified {
        return Err(CoreError::internal("document update reported no modification"));
    }
    store
        .get_asset_by_id(document_id)
        .await?
        .ok_or_else(|| CoreError::internal("document vanished after update"))
}

/// Precheck used before uploads: succeeds when the payload's composite key
/// is free, fails `DuplicateKey` when it is taken.
pub async fn exists_by_keys<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    xml: &str,
) -> Result<AssetKeys, CoreError> {
    let (_, meta) = prepare_asset(xml, cfg)?;
    if let Some(existing) = store.get_asset_by_keys(&meta.keys).await? {
        return Err(CoreError::DuplicateKey {
            keys: meta.keys,
            existing_id: existing.id,
        });
    }
    Ok(meta.keys)
}

/// Deletes a document by composite key, cascading to its blob content.
pub async fn delete_by_keys<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    keys: &AssetKeys,
) -> Result<bool, CoreError> {
    let keys = AssetKeys::new(
        normalize_global_id(&keys.global_asset_id, cfg),
        keys.asset_id.clone(),
        keys.asset_type.clone(),
        keys.element_id.clone(),
    );
    let Some(doc) = store.get_asset_by_keys(&keys).await? else {
        return Ok(false);
    };
    if let Some(oid) = doc.ref_key_value(KEY_FILE_OID).map(str::to_string) {
        if let Err(err) = store.delete_blob(&oid).await {
            log::warn!("blob '{}' cascade delete failed: {}", oid, err);
        }
    }
    store.delete_asset_by_keys(&keys).await
}

/// Merges every stored element of one asset back into a single aggregate
/// document.
pub async fn extract_merged<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    global_asset_id: &str,
    asset_id: &str,
    asset_type: Option<&str>,
) -> Result<String, CoreError> {
    let query = AssetQuery {
        global_asset_id: Some(normalize_global_id(global_asset_id, cfg)),
        asset_id: Some(asset_id.to_string()),
        asset_type: asset_type.map(str::to_string),
        ..AssetQuery::default()
    };
    let docs = store.search_assets(&query).await?;
    if docs.is_empty() {
        return Err(CoreError::not_found(format!(
            "no stored elements for asset '{}'",
            asset_id
        )));
    }
    let parsed = docs
        .iter()
        .map(|doc| Element::parse(&doc.data))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merge_documents(&parsed)?.to_xml())
}

/// Evaluates a path expression against a stored project document's XML.
pub async fn extract_attribute_path<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    global_asset_id: &str,
    asset_id: &str,
    project_element_id: &str,
    path: &str,
) -> Result<String, CoreError> {
    let keys = AssetKeys::new(
        normalize_global_id(global_asset_id, cfg),
        asset_id.to_string(),
        TYPE_PROJECT,
        project_element_id.to_string(),
    );
    let doc = store
        .get_asset_by_keys(&keys)
        .await?
        .ok_or_else(|| CoreError::not_found("project not found by keys"))?;
    let root = Element::parse(&doc.data)?;
    Ok(extract_path(&root, path))
}

/// Lists the NC files referencing a project/workplan via their inverse
/// reference pairs.
pub async fn nc_files_by_project<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    global_asset_id: &str,
    asset_id: &str,
    project_element_id: &str,
    workplan_id: &str,
) -> Result<Vec<AssetDocument>, CoreError> {
    let pairs = vec![
        (
            KEY_GLOBAL_ASSET.to_string(),
            normalize_global_id(global_asset_id, cfg),
        ),
        (KEY_ASSET.to_string(), asset_id.to_string()),
        (KEY_PROJECT.to_string(), project_element_id.to_string()),
        (KEY_WORKPLAN.to_string(), workplan_id.to_string()),
    ];
    let rows = store.find_by_ref_keys(TYPE_FILE, Some("NC"), &pairs).await?;
    if rows.is_empty() {
        return Err(CoreError::not_found(format!(
            "no NC file referencing project={}, workplan={}",
            project_element_id, workplan_id
        )));
    }
    Ok(rows)
}

/// Marks a document as pushed to the external platform; it is immutable
/// from then on.
pub async fn lock_for_upload<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    keys: &AssetKeys,
) -> Result<AssetDocument, CoreError> {
    let keys = AssetKeys::new(
        normalize_global_id(&keys.global_asset_id, cfg),
        keys.asset_id.clone(),
        keys.asset_type.clone(),
        keys.element_id.clone(),
    );
    let doc = store
        .get_asset_by_keys(&keys)
        .await?
        .ok_or_else(|| CoreError::not_found("asset not found by keys"))?;
    store.set_upload_lock(&doc.id, true).await?;
    store
        .get_asset_by_id(&doc.id)
        .await?
        .ok_or_else(|| CoreError::internal("document vanished while locking"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn cfg() -> AddressingConfig {
        AddressingConfig::default()
    }

    const MULTI: &str = r#"<dt_asset xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" schemaVersion="v31">
  <asset_global_id>g1</asset_global_id>
  <id>prj-1</id>
  <asset_kind>instance</asset_kind>
  <dt_elements xsi:type="dt_material"><element_id>m1</element_id></dt_elements>
  <dt_elements xsi:type="dt_machine_tool"><element_id>mt1</element_id></dt_elements>
</dt_asset>"#;

    #[tokio::test]
    async fn create_qualifies_bare_global_ids() {
        let store = MemoryStore::new();
        let xml = r#"<dt_asset><asset_global_id>g1</asset_global_id><id>a1</id>
            <dt_elements xsi:type="dt_material"><element_id>m1</element_id></dt_elements></dt_asset>"#;
        let doc = create_from_xml(&store, &cfg(), xml, false).await.unwrap();
        assert_eq!(doc.global_asset_id, "https://digital-thread.re/kitech/g1");
        assert!(doc.data.contains("https://digital-thread.re/kitech/g1"));
    }

    #[tokio::test]
    async fn multi_create_reports_partial_success() {
        let store = MemoryStore::new();
        let first = create_multi_from_xml(&store, &cfg(), MULTI).await.unwrap();
        assert_eq!(first.summary.created, 2);
        assert_eq!(first.summary.failed, 0);

        // Same payload again: every element now collides.
        let second = create_multi_from_xml(&store, &cfg(), MULTI).await.unwrap();
        assert_eq!(second.summary.created, 0);
        assert_eq!(second.summary.failed, 2);
        assert!(second.results.iter().all(|r| !r.ok && r.error.is_some()));
    }

    #[tokio::test]
    async fn extract_merged_round_trips_the_split() {
        let store = MemoryStore::new();
        create_multi_from_xml(&store, &cfg(), MULTI).await.unwrap();
        let merged = extract_merged(
            &store,
            &cfg(),
            "g1",
            "prj-1",
            None,
        )
        .await
        .unwrap();
        let root = Element::parse(&merged).unwrap();
        assert_eq!(root.children_named("dt_elements").len(), 2);
        assert_eq!(root.child_text("id"), Some("AGGREGATED"));
    }

    #[tokio::test]
    async fn update_rejects_type_changes() {
        let store = MemoryStore::new();
        let xml = r#"<dt_asset><asset_global_id>g1</asset_global_id><id>a1</id>
            <dt_elements xsi:type="dt_material"><element_id>m1</element_id></dt_elements></dt_asset>"#;
        let doc = create_from_xml(&store, &cfg(), xml, false).await.unwrap();

        let retyped = r#"<dt_asset><asset_global_id>g1</asset_global_id><id>a1</id>
            <dt_elements xsi:type="dt_file"><element_id>m1</element_id></dt_elements></dt_asset>"#;
        let err = update_from_xml(&store, &cfg(), &doc.id, retyped).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn update_detects_key_collisions() {
        let store = MemoryStore::new();
        let a = r#"<dt_asset><asset_global_id>g1</asset_global_id><id>a1</id>
            <dt_elements xsi:type="dt_material"><element_id>m1</element_id></dt_elements></dt_asset>"#;
        let b = r#"<dt_asset><asset_global_id>g1</asset_global_id><id>a1</id>
            <dt_elements xsi:type="dt_material"><element_id>m2</element_id></dt_elements></dt_asset>"#;
        create_from_xml(&store, &cfg(), a, false).await.unwrap();
        let doc_b = create_from_xml(&store, &cfg(), b, false).await.unwrap();

        // Renaming b's element onto a's key collides.
        let err = update_from_xml(&store, &cfg(), &doc_b.id, a).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateKey { .. }));
    }
}
