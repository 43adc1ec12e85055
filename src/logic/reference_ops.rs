use serde::{Deserialize, Serialize};

use crate::config::AddressingConfig;
use crate::logic::addressing::{build_fullpath, normalize_global_id};
use crate::logic::tree::{find_operation, find_workpiece, find_workplan, pick_dt_project};
use crate::model::asset::{
    KEY_ASSET, KEY_GLOBAL_ASSET, KEY_PROJECT, KEY_WORKINGSTEP, KEY_WORKPLAN, TYPE_FILE,
    TYPE_MACHINE_TOOL, TYPE_MATERIAL, TYPE_PROJECT,
};
use crate::model::{
    build_reference_element, collect_ref_keys, reference_fullpath, rule_for, AnchorKind,
    AssetDocument, AssetKeys, CoreError, Element, RefParam, RefRule,
};
use crate::store::traits::AssetCrud;

/// Identifies the owning project document.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectKeys {
    pub global_asset_id: String,
    pub asset_id: String,
    pub project_element_id: String,
}

/// Identifies the referenced asset element.
#[derive(Debug, Clone, Deserialize)]
pub struct RefTarget {
    pub global_asset_id: String,
    pub asset_id: String,
    pub element_id: String,
}

/// Disambiguating anchor ids; which ones are required depends on the rule.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnchorParams {
    pub workplan_id: Option<String>,
    pub workpiece_id: Option<String>,
    pub workingstep_id: Option<String>,
}

impl AnchorParams {
    fn get(&self, param: RefParam) -> Option<&str> {
        let value = match param {
            RefParam::WorkplanId => self.workplan_id.as_deref(),
            RefParam::WorkpieceId => self.workpiece_id.as_deref(),
            RefParam::WorkingstepId => self.workingstep_id.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    fn require(&self, rule: &RefRule) -> Result<(), CoreError> {
        let missing: Vec<&str> = rule
            .requires
            .iter()
            .filter(|p| self.get(**p).is_none())
            .map(|p| p.name())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::validation(format!(
                "missing required params for {}: {}",
                rule.ref_type,
                missing.join(", ")
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachOutcome {
    pub updated: bool,
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveOutcome {
    pub removed: bool,
    pub document_id: String,
}

async fn load_project<S: AssetCrud + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    project: &ProjectKeys,
) -> Result<AssetDocument, CoreError> {
    let keys = AssetKeys::new(
        normalize_global_id(&project.global_asset_id, cfg),
        project.asset_id.clone(),
        TYPE_PROJECT,
        project.project_element_id.clone(),
    );
    store
        .get_asset_by_keys(&keys)
        .await?
        .ok_or_else(|| CoreError::not_found("project not found by keys"))
}

/// The inverse-reference pairs a file document carries to point back at its
/// owning project/workplan.
fn file_reference_pairs(
    cfg: &AddressingConfig,
    project: &ProjectKeys,
    anchor: &AnchorParams,
) -> Result<Vec<(&'static str, String)>, CoreError> {
    let workplan_id = anchor
        .get(RefParam::WorkplanId)
        .ok_or_else(|| CoreError::validation("missing required params for dt_file: workplan_id"))?;
    let mut pairs = vec![
        (
            KEY_GLOBAL_ASSET,
            normalize_global_id(&project.global_asset_id, cfg),
        ),
        (KEY_ASSET, project.asset_id.clone()),
        (KEY_PROJECT, project.project_element_id.clone()),
        (KEY_WORKPLAN, workplan_id.to_string()),
    ];
    if let Some(ws) = anchor.get(RefParam::WorkingstepId) {
        pairs.push((KEY_WORKINGSTEP, ws.to_string()));
    }
    Ok(pairs)
}

fn single_element_mut<'a>(root: &'a mut Element) -> Result<&'a mut Element, CoreError> {
    let mut elements = root.children_named_mut("dt_elements");
    match elements.len() {
        1 => Ok(elements.remove(0)),
        0 => Err(CoreError::validation("document has no dt_elements")),
        _ => Err(CoreError::validation("document has multiple dt_elements")),
    }
}

/// Files reference their owning project, not the other way round: the file
/// document gains `keys` pairs naming the project and workplan (and
/// optionally a workingstep).
async fn attach_file_reference<S: AssetCrud + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    project: &ProjectKeys,
    target: &RefTarget,
    ref_category: Option<&str>,
    anchor: &AnchorParams,
) -> Result<AttachOutcome, CoreError> {
    let pairs = file_reference_pairs(cfg, project, anchor)?;

    let file_keys = AssetKeys::new(
        normalize_global_id(&target.global_asset_id, cfg),
        target.asset_id.clone(),
        TYPE_FILE,
        target.element_id.clone(),
    );
    let file_doc = store
        .get_asset_by_keys(&file_keys)
        .await?
        .ok_or_else(|| CoreError::not_found("file not found by keys"))?;
    if let (Some(wanted), Some(actual)) = (ref_category, file_doc.category.as_deref()) {
        if !wanted.eq_ignore_ascii_case(actual) {
            return Err(CoreError::validation(format!(
                "file '{}' has category '{}', not '{}'",
                target.element_id, actual, wanted
            )));
        }
    }

    if pairs.iter().all(|(k, v)| file_doc.has_ref_pair(k, v)) {
        return Err(CoreError::conflict("file already references this project"));
    }

    let mut root = Element::parse(&file_doc.data)?;
    let element = single_element_mut(&mut root)?;
    for (key, value) in &pairs {
        let mut keys = Element::new("keys");
        keys.push(Element::with_text("key", *key));
        keys.push(Element::with_text("value", value.clone()));
        element.push(keys);
    }

    persist(store, &file_doc.id, &root).await?;
    Ok(AttachOutcome {
        updated: true,
        document_id: file_doc.id,
    })
}

async fn remove_file_reference<S: AssetCrud + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    project: &ProjectKeys,
    target: &RefTarget,
    anchor: &AnchorParams,
) -> Result<RemoveOutcome, CoreError> {
    let pairs = file_reference_pairs(cfg, project, anchor)?;

    let file_keys = AssetKeys::new(
        normalize_global_id(&target.global_asset_id, cfg),
        target.asset_id.clone(),
        TYPE_FILE,
        target.element_id.clone(),
    );
    let file_doc = store
        .get_asset_by_keys(&file_keys)
        .await?
        .ok_or_else(|| CoreError::not_found("file not found by keys"))?;

    if !pairs.iter().all(|(k, v)| file_doc.has_ref_pair(k, v)) {
        return Err(CoreError::ReferenceNotFound(
            "file does not reference this project".to_string(),
        ));
    }

    let mut root = Element::parse(&file_doc.data)?;
    let element = single_element_mut(&mut root)?;
    element.children.retain(|child| {
        if child.local_name() != "keys" {
            return true;
        }
        let matched = match (child.child_text("key"), child.child_text("value")) {
            (Some(k), Some(v)) => pairs.iter().any(|(pk, pv)| *pk == k && pv == v),
            _ => false,
        };
        !matched
    });

    persist(store, &file_doc.id, &root).await?;
    Ok(RemoveOutcome {
        removed: true,
        document_id: file_doc.id,
    })
}

fn locate_anchor<'a>(
    project_element: &'a mut Element,
    rule: &RefRule,
    anchor: &AnchorParams,
    auto_create_workpiece: bool,
) -> Result<&'a mut Element, CoreError> {
    match rule.anchor {
        AnchorKind::Workplan => {
            let workplan_id = anchor
                .get(RefParam::WorkplanId)
                .ok_or_else(|| CoreError::validation("workplan_id is required"))?;
            find_workplan(project_element, workplan_id)
        }
        AnchorKind::Workpiece => {
            let workpiece_id = anchor
                .get(RefParam::WorkpieceId)
                .ok_or_else(|| CoreError::validation("workpiece_id is required"))?
                .to_string();
            let exists = {
                let probe = find_workpiece(project_element, &workpiece_id);
                probe.is_ok()
            };
            if !exists {
                if !auto_create_workpiece {
                    return Err(CoreError::not_found(format!(
                        "workpiece '{}' not found",
                        workpiece_id
                    )));
                }
                // Material references are the one kind allowed to create
                // their own anchor when it is missing.
                let mut workpiece = Element::new("its_workpieces");
                workpiece.push(Element::with_text("its_id", workpiece_id.clone()));
                project_element.push(workpiece);
            }
            find_workpiece(project_element, &workpiece_id)
        }
        AnchorKind::Operation => {
            let workplan_id = anchor
                .get(RefParam::WorkplanId)
                .ok_or_else(|| CoreError::validation("workplan_id is required"))?;
            let workingstep_id = anchor
                .get(RefParam::WorkingstepId)
                .ok_or_else(|| CoreError::validation("workingstep_id is required"))?
                .to_string();
            let workplan = find_workplan(project_element, workplan_id)?;
            find_operation(workplan, &workingstep_id)
        }
    }
}

/// Next free `{prefix}-NNN` element id among sibling references under `tag`.
fn next_reference_id(anchor: &Element, tag: &str, prefix: &str) -> String {
    let max = anchor
        .children_named(tag)
        .into_iter()
        .filter_map(|c| c.child_text("element_id"))
        .filter_map(|id| {
            id.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('-'))
                .and_then(|digits| digits.parse::<u32>().ok())
        })
        .max()
        .unwrap_or(0);
    format!("{}-{:03}", prefix, max + 1)
}

async fn persist<S: AssetCrud + ?Sized>(
    store: &S,
    document_id: &str,
    root: &Element,
) -> Result<(), CoreError> {
    let ref_keys = collect_ref_keys(root);
    let modified = store
        .update_asset_data_by_id(document_id, &root.to_xml(), &ref_keys)
        .await?;
    if !modified {
        return Err(CoreError::internal(format!(
            "document '{}' disappeared during reference update",
            document_id
        )));
    }
    Ok(())
}

/// Attaches a typed reference. Machine-tool, material and cutting-tool
/// references are embedded into the project tree at their rule's anchor;
/// `dt_file` references are inverted onto the file document instead.
pub async fn attach_reference<S: AssetCrud + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    project: &ProjectKeys,
    target: &RefTarget,
    ref_type: &str,
    ref_category: Option<&str>,
    anchor: &AnchorParams,
) -> Result<AttachOutcome, CoreError> {
    // The project must exist even for the inverted file flow.
    let project_doc = load_project(store, cfg, project).await?;

    if ref_type == TYPE_FILE {
        return attach_file_reference(store, cfg, project, target, ref_category, anchor).await;
    }

    let rule = rule_for(ref_type, ref_category).ok_or_else(|| {
        CoreError::validation(format!("unsupported reference type: {}", ref_type))
    })?;
    anchor.require(rule)?;

    let mut root = Element::parse(&project_doc.data)?;
    let project_element = pick_dt_project(&mut root, &project.project_element_id)?;
    let anchor_node = locate_anchor(
        project_element,
        rule,
        anchor,
        rule.ref_type == TYPE_MATERIAL,
    )?;

    let uri = build_fullpath(
        &target.global_asset_id,
        &target.asset_id,
        &target.element_id,
        cfg,
    );
    let duplicate = anchor_node
        .children_named(rule.tag)
        .into_iter()
        .any(|node| reference_fullpath(node) == Some(uri.as_str()));
    if duplicate {
        return Err(CoreError::conflict(format!(
            "reference to '{}' already attached under {}",
            uri, rule.tag
        )));
    }

    let ref_element_id = next_reference_id(anchor_node, rule.tag, rule.id_prefix);
    let node = build_reference_element(rule.tag, &ref_element_id, &target.element_id, &uri);
    anchor_node.push(node);
    if rule.ref_type == TYPE_MACHINE_TOOL {
        // Destination schema wants machine-tool references in trailing
        // declaration order.
        anchor_node.move_children_to_end(rule.tag);
    }

    persist(store, &project_doc.id, &root).await?;
    Ok(AttachOutcome {
        updated: true,
        document_id: project_doc.id,
    })
}

/// Removes a previously attached reference; fails `ReferenceNotFound` when
/// the target is not attached at the given anchor.
pub async fn remove_reference<S: AssetCrud + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    project: &ProjectKeys,
    target: &RefTarget,
    ref_type: &str,
    _ref_category: Option<&str>,
    anchor: &AnchorParams,
) -> Result<RemoveOutcome, CoreError> {
    let project_doc = load_project(store, cfg, project).await?;

    if ref_type == TYPE_FILE {
        return remove_file_reference(store, cfg, project, target, anchor).await;
    }

    let rule = rule_for(ref_type, None).ok_or_else(|| {
        CoreError::validation(format!("unsupported reference type: {}", ref_type))
    })?;
    anchor.require(rule)?;

    let mut root = Element::parse(&project_doc.data)?;
    let project_element = pick_dt_project(&mut root, &project.project_element_id)?;
    let anchor_node = locate_anchor(project_element, rule, anchor, false)?;

    let uri = build_fullpath(
        &target.global_asset_id,
        &target.asset_id,
        &target.element_id,
        cfg,
    );
    let index = anchor_node.children.iter().position(|child| {
        crate::model::element::local_name_of(&child.name) == rule.tag
            && reference_fullpath(child) == Some(uri.as_str())
    });
    let Some(index) = index else {
        return Err(CoreError::ReferenceNotFound(format!(
            "no {} reference to '{}' at this anchor",
            rule.tag, uri
        )));
    };
    anchor_node.remove_child_at(index);

    persist(store, &project_doc.id, &root).await?;
    Ok(RemoveOutcome {
        removed: true,
        document_id: project_doc.id,
    })
}
