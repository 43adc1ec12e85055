use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AddressingConfig;
use crate::logic::addressing::normalize_global_id;
use crate::logic::cam_map::{
    build_cutting_tool_document, compose_tool_mapping, coolant_cam_key, derive_tool_display_name,
    extract_tool_values, get_nested_value, normalize_bool_like, parse_mapping, pathmode_cam_key,
    pick_ops, reorder_by_ops_order, CamMapping, CamVendor,
};
use crate::logic::nc_tools::extract_tool_sequence;
use crate::logic::schema::validate_asset_element;
use crate::logic::tree::{count_workingsteps, find_workplan, pick_dt_project};
use crate::model::asset::{
    KEY_ASSET, KEY_ELEMENT_FULLPATH, KEY_FILE_OID, KEY_GLOBAL_ASSET, KEY_PROJECT, KEY_WORKPLAN,
    DEFAULT_SCHEMA_VERSION, TYPE_CUTTING_TOOL_13399, TYPE_FILE, TYPE_PROJECT,
};
use crate::model::{collect_ref_keys, AssetKeys, AssetMeta, CoreError, Element, NewAsset};
use crate::store::traits::Store;

/// One uploaded CAM export file (JSON text).
#[derive(Debug, Clone, Deserialize)]
pub struct CamFile {
    pub filename: String,
    pub contents: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CamApplyRequest {
    pub global_asset_id: String,
    pub asset_id: String,
    pub project_element_id: String,
    pub workplan_id: String,
    pub vendor: CamVendor,
    pub cam_files: Vec<CamFile>,
    /// CAM-key → intermediate-schema-path mapping JSON.
    pub mapping: String,
    /// PowerMill only: processing order of the uploaded files.
    pub ops_order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CamApplyOutcome {
    pub applied: usize,
    pub tool_sequence: Vec<String>,
    pub tools_created: usize,
    pub workingsteps_appended: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_applied: Option<Vec<String>>,
}

impl CamApplyOutcome {
    fn noop() -> Self {
        CamApplyOutcome {
            applied: 0,
            tool_sequence: Vec::new(),
            tools_created: 0,
            workingsteps_appended: 0,
            order_applied: None,
        }
    }
}

fn parse_cam_json(file: &CamFile) -> Result<Value, CoreError> {
    serde_json::from_str(&file.contents).map_err(|e| {
        CoreError::validation(format!("invalid CAM JSON in '{}': {}", file.filename, e))
    })
}

/// Resolves the single NC file referencing this project/workplan and pulls
/// the tool-change sequence out of its binary content.
async fn load_tool_sequence<S: Store + ?Sized>(
    store: &S,
    g_url: &str,
    req: &CamApplyRequest,
) -> Result<Vec<String>, CoreError> {
    let pairs = vec![
        (KEY_GLOBAL_ASSET.to_string(), g_url.to_string()),
        (KEY_ASSET.to_string(), req.asset_id.clone()),
        (KEY_PROJECT.to_string(), req.project_element_id.clone()),
        (KEY_WORKPLAN.to_string(), req.workplan_id.clone()),
    ];
    let rows = store.find_by_ref_keys(TYPE_FILE, Some("NC"), &pairs).await?;
    let nc_doc = match rows.as_slice() {
        [] => {
            return Err(CoreError::not_found(format!(
                "no NC file referencing project={}, workplan={}",
                req.project_element_id, req.workplan_id
            )))
        }
        [one] => one,
        _ => {
            return Err(CoreError::conflict(
                "multiple NC files reference the same project/workplan",
            ))
        }
    };

    let oid = nc_doc
        .ref_key_value(KEY_FILE_OID)
        .ok_or_else(|| CoreError::validation("NC file has no binary content pointer"))?;
    let content = store
        .get_blob(oid)
        .await?
        .ok_or_else(|| CoreError::not_found("NC binary content not found"))?;
    Ok(extract_tool_sequence(&String::from_utf8_lossy(&content)))
}

/// Builds the ordered operation list per vendor rules: NX packs every
/// operation into one file; PowerMill contributes exactly one operation per
/// file, reordered by `ops_order`.
fn load_cam_operations(
    req: &CamApplyRequest,
) -> Result<(Vec<Value>, Option<Vec<String>>), CoreError> {
    match req.vendor {
        CamVendor::Nx => {
            let [file] = req.cam_files.as_slice() else {
                return Err(CoreError::validation("NX expects exactly one CAM JSON file"));
            };
            let json = parse_cam_json(file)?;
            Ok((pick_ops(CamVendor::Nx, &json), None))
        }
        CamVendor::Powermill => {
            let ops_order = req
                .ops_order
                .as_deref()
                .ok_or_else(|| CoreError::validation("ops_order is required for powermill"))?;
            let filenames: Vec<String> =
                req.cam_files.iter().map(|f| f.filename.clone()).collect();
            let order = reorder_by_ops_order(&filenames, ops_order)?;

            let mut all_ops = Vec::with_capacity(order.len());
            let mut ordered_names = Vec::with_capacity(order.len());
            for index in order {
                let file = &req.cam_files[index];
                let json = parse_cam_json(file)?;
                let ops = pick_ops(CamVendor::Powermill, &json);
                if ops.is_empty() {
                    return Err(CoreError::validation(format!(
                        "no operation found in file: {}",
                        file.filename
                    )));
                }
                if ops.len() != 1 {
                    return Err(CoreError::validation(format!(
                        "expected exactly 1 operation per PowerMill file: {}",
                        file.filename
                    )));
                }
                all_ops.extend(ops);
                ordered_names.push(file.filename.clone());
            }
            Ok((all_ops, Some(ordered_names)))
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Synthesizes a working-step element from one CAM operation record via the
/// mapping. Capitalized path segments are intermediate-schema class markers
/// and do not become tree levels; lowercase segments do.
fn synthesize_workingstep(cam_op: &Value, mapping: &CamMapping, its_id: &str) -> Element {
    let mut ws = Element::new("its_elements");
    ws.set_attr("xsi:type", "machining_workingstep");

    for (cam_key, path) in mapping {
        let Some(value) = get_nested_value(cam_op, cam_key).and_then(|v| scalar_text(v)) else {
            continue;
        };
        let fields: Vec<&str> = path
            .split('.')
            .filter(|seg| seg.chars().next().map_or(false, |c| c.is_ascii_lowercase()))
            .collect();
        if fields.is_empty() {
            continue;
        }
        let mut node = &mut ws;
        for field in &fields[..fields.len() - 1] {
            node = node.child_or_insert(field);
        }
        node.set_child_text(fields[fields.len() - 1], value);
    }

    if ws.child_text("its_id").map_or(true, |s| s.trim().is_empty()) {
        ws.set_child_text("its_id", its_id);
    }
    ws
}

/// Injects the cutting-tool reference carried by every synthesized
/// working-step's operation.
fn inject_cutting_tool_ref(ws: &mut Element, tool_uri: &str, tool_element_id: &str) {
    let op = ws.child_or_insert("its_operation");
    let mut node = Element::new("ref_dt_cutting_tool");
    node.push(Element::with_text("element_id", tool_element_id));
    node.push(Element::with_text("category", "reference"));
    node.push(Element::with_text("display_name", "Cutting Tool Ref"));
    let mut keys = Element::new("keys");
    keys.push(Element::with_text("key", KEY_ELEMENT_FULLPATH));
    keys.push(Element::with_text("value", tool_uri));
    node.push(keys);
    op.set_child(node);
}

/// Minimal section-plane structure required by the target schema; the
/// geometry is a placeholder at the origin.
fn ensure_dummy_secplane(ws: &mut Element) {
    let sec = ws.child_or_insert("its_secplane");
    if sec.child_text("name").map_or(true, str::is_empty) {
        sec.set_child_text("name", "secplane-001");
    }
    let pos = sec.child_or_insert("position");
    if pos.child_text("name").map_or(true, str::is_empty) {
        pos.set_child_text("name", "pos-001");
    }
    let loc = pos.child_or_insert("location");
    if loc.child_text("name").map_or(true, str::is_empty) {
        loc.set_child_text("name", "origin");
    }
    if loc.children_named("coordinates").is_empty() {
        for _ in 0..3 {
            loc.push(Element::with_text("coordinates", "0.0"));
        }
    }
}

fn ensure_dummy_feature(ws: &mut Element) {
    let feat = ws.child_or_insert("its_feature");
    if feat.child_text("its_id").map_or(true, str::is_empty) {
        feat.set_child_text("its_id", "auto_feature");
    }
    let workpiece = feat.child_or_insert("its_workpiece");
    if workpiece.child_text("its_id").map_or(true, str::is_empty) {
        workpiece.set_child_text("its_id", "default_workpiece");
    }
}

/// The real tool lives in its own document; the inline `its_tool` slot is
/// forced to a typed placeholder.
fn force_dummy_its_tool(ws: &mut Element) {
    let op = ws.child_or_insert("its_operation");
    let mut tool = Element::new("its_tool");
    tool.set_attr("xsi:type", "machining_tool");
    tool.push(Element::with_text("its_id", "temp"));
    op.set_child(tool);
}

fn ensure_strategy_with_pathmode(ws: &mut Element, cam_op: &Value, mapping: &CamMapping) {
    let pathmode = pathmode_cam_key(mapping)
        .and_then(|key| get_nested_value(cam_op, key))
        .and_then(scalar_text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "forward".to_string());

    let op = ws.child_or_insert("its_operation");
    let strategy = op.child_or_insert("its_machining_strategy");
    strategy.set_child_text("pathmode", pathmode);
    strategy.reorder_children(&["pathmode", "cutmode", "its_milling_tolerances", "stepover"]);
}

fn ensure_milling_machine_functions(ws: &mut Element, raw_coolant: Option<&Value>) {
    let op = ws.child_or_insert("its_operation");
    let mf = op.child_or_insert("its_machine_functions");
    mf.set_attr("xsi:type", "milling_machine_functions");

    let coolant = match mf.child_text("coolant") {
        Some(existing) => normalize_bool_like(Some(&Value::String(existing.to_string())), false),
        None => normalize_bool_like(raw_coolant, false),
    };
    mf.set_child_text("coolant", coolant.to_string());
    if coolant {
        // Coolant on implies the two dependent required flags.
        mf.set_child_text("through_spindle_coolant", "true");
        mf.set_child_text("chip_removal", "true");
    } else {
        for field in ["through_spindle_coolant", "chip_removal"] {
            if mf.child(field).is_none() {
                mf.set_child_text(field, "false");
            }
        }
    }
    mf.reorder_children(&[
        "coolant",
        "coolant_pressure",
        "mist",
        "through_spindle_coolant",
        "through_pressure",
        "axis_clamping",
        "chip_removal",
        "oriented_spindle_stop",
        "its_process_model",
        "other_functions",
    ]);
}

fn ensure_milling_technology(ws: &mut Element, cutmode: Option<&str>) {
    let op = ws.child_or_insert("its_operation");
    let tech = op.child_or_insert("its_technology");

    if tech
        .child_text("feedrate_reference")
        .map_or(true, str::is_empty)
    {
        let reference = match cutmode.map(|c| c.trim().to_ascii_lowercase()).as_deref() {
            Some("climb") => "ccp",
            Some("conventional") => "tcp",
            _ => "tcp",
        };
        tech.set_child_text("feedrate_reference", reference);
    }
    for field in [
        "synchronize_spindle_with_feed",
        "inhibit_feedrate_override",
        "inhibit_spindle_override",
    ] {
        if tech.child(field).is_none() {
            tech.set_child_text(field, "false");
        }
    }
    tech.reorder_children(&[
        "feedrate",
        "feedrate_reference",
        "spindle",
        "synchronize_spindle_with_feed",
        "inhibit_feedrate_override",
        "inhibit_spindle_override",
    ]);
}

fn finalize_workingstep(ws: &mut Element) {
    let op = ws.child_or_insert("its_operation");
    op.reorder_children(&[
        "ref_dt_cutting_tool",
        "its_id",
        "its_tool",
        "its_technology",
        "its_machine_functions",
        "its_machining_strategy",
    ]);
    ws.reorder_children(&[
        "its_id",
        "its_secplane",
        "its_feature",
        "its_operation",
        "its_effect",
    ]);
}

/// Puts the whole assembled project document into schema-mandated child
/// order before validation.
fn normalize_project_structure(root: &mut Element, project_element_id: &str) {
    root.reorder_children(&["asset_global_id", "id", "asset_kind", "dt_elements"]);
    let Ok(project) = pick_dt_project(root, project_element_id) else {
        return;
    };
    for workpiece in project.children_named_mut("its_workpieces") {
        workpiece.move_children_to_end("ref_dt_material");
    }
    for workplan in project.children_named_mut("main_workplan") {
        workplan.reorder_children(&["its_id", "its_elements", "ref_dt_machine_tool"]);
    }
    project.reorder_children(&[
        "element_id",
        "category",
        "display_name",
        "element_description",
        "its_id",
        "main_workplan",
        "its_workpieces",
    ]);
}

async fn rollback_created_tools<S: Store + ?Sized>(
    store: &S,
    g_url: &str,
    tool_asset_id: &str,
    created: &[String],
) {
    for element_id in created {
        if let Err(err) = store
            .force_delete_element(g_url, tool_asset_id, element_id)
            .await
        {
            log::error!(
                "cam apply: tool delete rollback failed for '{}': {}",
                element_id,
                err
            );
        }
    }
}

struct SynthesisResult {
    tool_documents: Vec<(String, Element)>,
    workingsteps: Vec<Element>,
}

fn synthesize_all(
    g_url: &str,
    tool_asset_id: &str,
    tool_seq: &[String],
    all_ops: &[Value],
    mapping: &CamMapping,
) -> SynthesisResult {
    let composed = compose_tool_mapping(mapping);
    let coolant_key = coolant_cam_key(mapping).map(str::to_string);

    // Tool-tag → element-id cache, scoped to this invocation.
    let mut tool_cache: HashMap<String, String> = HashMap::new();
    let mut tool_documents: Vec<(String, Element)> = Vec::new();
    let mut workingsteps = Vec::new();

    for (idx, tool_tag) in tool_seq.iter().enumerate() {
        let cam_op = &all_ops[idx];

        let element_id = match tool_cache.get(tool_tag) {
            Some(id) => id.clone(),
            None => {
                let trimmed = tool_tag.trim();
                let element_id = if trimmed.is_empty() {
                    format!("T{}", idx + 1)
                } else {
                    trimmed.to_string()
                };
                let display = derive_tool_display_name(cam_op, mapping, tool_tag);
                let values = extract_tool_values(cam_op, &composed);
                let doc = build_cutting_tool_document(
                    g_url,
                    tool_asset_id,
                    &element_id,
                    &display,
                    &values,
                    DEFAULT_SCHEMA_VERSION,
                );
                tool_cache.insert(tool_tag.clone(), element_id.clone());
                tool_documents.push((element_id.clone(), doc));
                element_id
            }
        };

        let mut ws = synthesize_workingstep(cam_op, mapping, &format!("ws-{:03}", idx + 1));
        let tool_uri = format!("{}/{}/{}", g_url, tool_asset_id, element_id);
        inject_cutting_tool_ref(&mut ws, &tool_uri, &element_id);
        ensure_dummy_secplane(&mut ws);
        ensure_dummy_feature(&mut ws);
        ensure_strategy_with_pathmode(&mut ws, cam_op, mapping);

        let cutmode = ws
            .child("its_operation")
            .and_then(|op| op.child("its_machining_strategy"))
            .and_then(|s| s.child_text("cutmode"))
            .map(str::to_string);
        let raw_coolant = coolant_key
            .as_deref()
            .and_then(|key| get_nested_value(cam_op, key))
            .cloned();
        ensure_milling_machine_functions(&mut ws, raw_coolant.as_ref());
        force_dummy_its_tool(&mut ws);
        ensure_milling_technology(&mut ws, cutmode.as_deref());
        finalize_workingstep(&mut ws);

        workingsteps.push(ws);
    }

    SynthesisResult {
        tool_documents,
        workingsteps,
    }
}

/// Applies CAM export data to a project's workplan: synthesizes cutting-tool
/// documents and working-steps keyed to the NC tool-change sequence,
/// validates everything, then persists tools first and the project last,
/// compensating on failure.
pub async fn apply_cam<S: Store + ?Sized>(
    store: &S,
    cfg: &AddressingConfig,
    req: &CamApplyRequest,
) -> Result<CamApplyOutcome, CoreError> {
    let g_url = normalize_global_id(&req.global_asset_id, cfg);

    let tool_seq = load_tool_sequence(store, &g_url, req).await?;
    if tool_seq.is_empty() {
        return Ok(CamApplyOutcome::noop());
    }

    let (all_ops, order_applied) = load_cam_operations(req)?;
    if all_ops.len() != tool_seq.len() {
        return Err(CoreError::validation(format!(
            "NC tool sequence length ({}) != CAM op count ({})",
            tool_seq.len(),
            all_ops.len()
        )));
    }

    let mapping = parse_mapping(&req.mapping)?;

    let project_keys = AssetKeys::new(
        g_url.clone(),
        req.asset_id.clone(),
        TYPE_PROJECT,
        req.project_element_id.clone(),
    );
    let project_doc = store
        .get_asset_by_keys(&project_keys)
        .await?
        .ok_or_else(|| CoreError::not_found("project asset XML not found"))?;
    let original_xml = project_doc.data.clone();
    let original_ref_keys = project_doc.ref_keys.clone();

    let mut root = Element::parse(&original_xml)?;
    {
        let project = pick_dt_project(&mut root, &req.project_element_id)?;
        let workplan = find_workplan(project, &req.workplan_id)?;
        let existing = count_workingsteps(workplan);
        if existing > 0 {
            return Err(CoreError::conflict(format!(
                "workplan '{}' already contains {} workingsteps; creation is blocked by policy",
                req.workplan_id, existing
            )));
        }
    }

    // Everything is synthesized and validated in memory before any write.
    let tool_asset_id = format!("{}_cutting_tool", req.asset_id);
    let synthesis = synthesize_all(&g_url, &tool_asset_id, &tool_seq, &all_ops, &mapping);

    for (element_id, doc) in &synthesis.tool_documents {
        validate_asset_element(doc).map_err(|e| {
            CoreError::validation(format!("invalid tool document '{}': {}", element_id, e))
        })?;
    }
    {
        let project = pick_dt_project(&mut root, &req.project_element_id)?;
        let workplan = find_workplan(project, &req.workplan_id)?;
        for ws in &synthesis.workingsteps {
            workplan.push(ws.clone());
        }
    }
    normalize_project_structure(&mut root, &req.project_element_id);
    validate_asset_element(&root)
        .map_err(|e| CoreError::validation(format!("updated project failed validation: {}", e)))?;

    // Persist tools, reusing documents whose composite key already exists.
    let mut created_tools: Vec<String> = Vec::new();
    for (element_id, doc) in &synthesis.tool_documents {
        let keys = AssetKeys::new(
            g_url.clone(),
            tool_asset_id.clone(),
            TYPE_CUTTING_TOOL_13399,
            element_id.clone(),
        );
        let exists = match store.get_asset_by_keys(&keys).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                rollback_created_tools(store, &g_url, &tool_asset_id, &created_tools).await;
                return Err(err);
            }
        };
        if exists {
            continue;
        }
        let meta = match AssetMeta::from_element(doc) {
            Ok(meta) => meta,
            Err(err) => {
                rollback_created_tools(store, &g_url, &tool_asset_id, &created_tools).await;
                return Err(err);
            }
        };
        let new_asset = NewAsset {
            keys: meta.keys,
            category: meta.category,
            data: doc.to_xml(),
            is_upload: false,
            ref_keys: meta.ref_keys,
        };
        if let Err(err) = store.insert_asset(new_asset).await {
            rollback_created_tools(store, &g_url, &tool_asset_id, &created_tools).await;
            return Err(err);
        }
        created_tools.push(element_id.clone());
    }

    // Project write is the last failure point; after it, restore the
    // snapshot as well as deleting the tools.
    let updated_xml = root.to_xml();
    let updated_ref_keys = collect_ref_keys(&root);
    let write = store
        .update_asset_data_by_id(&project_doc.id, &updated_xml, &updated_ref_keys)
        .await;
    let failure = match write {
        Ok(true) => None,
        Ok(false) => Some(CoreError::internal("project update reported no modification")),
        Err(err) => Some(err),
    };
    if let Some(err) = failure {
        if let Err(restore_err) = store
            .force_restore_data(&project_doc.id, &original_xml, &original_ref_keys)
            .await
        {
            log::error!("cam apply: project xml restore failed: {}", restore_err);
        }
        rollback_created_tools(store, &g_url, &tool_asset_id, &created_tools).await;
        return Err(CoreError::internal(format!(
            "cam apply failed and rolled back: {}",
            err
        )));
    }

    Ok(CamApplyOutcome {
        applied: tool_seq.len(),
        tool_sequence: tool_seq,
        tools_created: created_tools.len(),
        workingsteps_appended: synthesis.workingsteps.len(),
        order_applied,
    })
}
