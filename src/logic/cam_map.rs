use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::{CoreError, Element};

/// Intermediate-schema paths (dotted, class segments capitalized) mapped to
/// the tool-description components a cutting-tool document carries.
pub const F14649_TO_13399: &[(&str, &str)] = &[
    (
        "MachiningWorkingstep.its_operation.MachiningOperation.its_tool.MachiningTool.MillingMachineCuttingTool.effective_cutting_diameter",
        "effective_cutting_diameter",
    ),
    (
        "MachiningWorkingstep.its_operation.MachiningOperation.its_tool.MachiningTool.MillingMachineCuttingTool.MillingCuttingTool.edge_radius",
        "corner_radius",
    ),
    (
        "MachiningWorkingstep.its_operation.MachiningOperation.its_tool.MachiningTool.MillingMachineCuttingTool.its_cutting_edges.CuttingComponent.tool_functional_length",
        "functional_length",
    ),
    (
        "MachiningWorkingstep.its_operation.MachiningOperation.its_tool.MachiningTool.MillingMachineCuttingTool.overall_assembly_length",
        "overhang_length",
    ),
    (
        "MachiningWorkingstep.its_operation.MachiningOperation.its_tool.MachiningTool.MillingMachineCuttingTool.MillingCuttingTool.number_of_effective_teeth",
        "number_of_teeth",
    ),
];

/// Serialization order of tool components in a cutting-tool document.
pub const COMPONENT_ORDER: &[&str] = &[
    "effective_cutting_diameter",
    "corner_radius",
    "functional_length",
    "overhang_length",
    "number_of_teeth",
];

/// CAM-key → intermediate-schema-path mapping, as uploaded by the client.
pub type CamMapping = BTreeMap<String, String>;

pub fn parse_mapping(json: &str) -> Result<CamMapping, CoreError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| CoreError::validation(format!("invalid mapping JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| CoreError::validation("mapping must be a JSON object"))?;
    let mut mapping = CamMapping::new();
    for (cam_key, path) in object {
        let path = path
            .as_str()
            .ok_or_else(|| {
                CoreError::validation(format!("mapping value for '{}' must be a string", cam_key))
            })?;
        mapping.insert(cam_key.clone(), path.to_string());
    }
    Ok(mapping)
}

/// Composes the uploaded CAM→intermediate map with the fixed
/// intermediate→component table into a CAM-key→component map. Mapping
/// entries that do not lead to a tool component are dropped.
pub fn compose_tool_mapping(mapping: &CamMapping) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (cam_key, path) in mapping {
        if let Some((_, component)) = F14649_TO_13399.iter().find(|(p, _)| p == path) {
            out.insert(cam_key.clone(), component.to_string());
        }
    }
    out
}

/// Walks a CAM operation record along a dotted key. Intermediate arrays are
/// entered at their first entry, matching how single-operation exports nest.
pub fn get_nested_value<'a>(record: &'a Value, dotted_key: &str) -> Option<&'a Value> {
    let mut current = record;
    for part in dotted_key.split('.') {
        loop {
            match current {
                Value::Array(items) => current = items.first()?,
                _ => break,
            }
        }
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Pulls tool-component values out of one CAM operation record using a
/// composed CAM-key→component map. Missing or empty values are skipped.
pub fn extract_tool_values(
    cam_op: &Value,
    cam_to_component: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (cam_key, component) in cam_to_component {
        let Some(value) = get_nested_value(cam_op, cam_key) else {
            continue;
        };
        if let Some(text) = scalar_to_string(value).filter(|s| !s.is_empty()) {
            out.insert(component.clone(), text);
        }
    }
    out
}

fn mapping_key_with_path_suffix<'a>(
    mapping: &'a CamMapping,
    suffixes: &[&str],
) -> Option<&'a str> {
    for suffix in suffixes {
        if let Some((cam_key, _)) = mapping.iter().find(|(_, path)| path.ends_with(suffix)) {
            return Some(cam_key.as_str());
        }
    }
    None
}

const TOOL_ID_PATH_SUFFIXES: &[&str] = &[
    "MachiningWorkingstep.its_operation.MachiningOperation.its_tool.MachiningTool.its_id",
    "MachiningOperation.its_tool.MachiningTool.its_id",
    "MachiningTool.its_id",
];

/// Display name for a synthesized cutting tool, taken from the mapped tool
/// id when the CAM record carries one. The element id stays the tool tag.
pub fn derive_tool_display_name(cam_op: &Value, mapping: &CamMapping, fallback: &str) -> String {
    let Some(cam_key) = mapping_key_with_path_suffix(mapping, TOOL_ID_PATH_SUFFIXES) else {
        return fallback.to_string();
    };
    match get_nested_value(cam_op, cam_key).and_then(scalar_to_string) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        _ => fallback.to_string(),
    }
}

const COOLANT_PATH_SUFFIXES: &[&str] = &[
    "MillingMachineFunctions.coolant",
    "MachineFunctions.MillingMachineFunctions.coolant",
    "its_machine_functions.MillingMachineFunctions.coolant",
    "its_machine_functions.MachineFunctions.MillingMachineFunctions.coolant",
    ".coolant",
];

/// CAM key the coolant state comes from, when the mapping carries one.
pub fn coolant_cam_key<'a>(mapping: &'a CamMapping) -> Option<&'a str> {
    mapping_key_with_path_suffix(mapping, COOLANT_PATH_SUFFIXES)
}

const PATHMODE_PATH_SUFFIXES: &[&str] = &[
    "its_machining_strategy.FreeformStrategy.pathmode",
    "FreeformStrategy.pathmode",
    ".pathmode",
];

pub fn pathmode_cam_key<'a>(mapping: &'a CamMapping) -> Option<&'a str> {
    mapping_key_with_path_suffix(mapping, PATHMODE_PATH_SUFFIXES)
}

/// Coerces the many CAM spellings of an on/off state into a bool. Coolant
/// modes like `flood` or `through_spindle` count as on, `none`/`off` as off;
/// numbers are on when positive. Unknown spellings fall back to `default`.
pub fn normalize_bool_like(raw: Option<&Value>, default: bool) -> bool {
    let Some(value) = raw else {
        return default;
    };
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f > 0.0).unwrap_or(default),
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            if s.is_empty() {
                return default;
            }
            const TRUTHY: &[&str] = &[
                "standard",
                "flood",
                "mist",
                "air",
                "through",
                "thru",
                "high_pressure",
                "highpressure",
                "on",
                "true",
                "yes",
            ];
            const FALSY: &[&str] = &["none", "off", "false", "no", "0"];
            if TRUTHY.contains(&s.as_str()) || s.starts_with("through") {
                true
            } else if FALSY.contains(&s.as_str()) {
                false
            } else {
                default
            }
        }
        _ => default,
    }
}

/// CAM systems whose operation exports the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CamVendor {
    Nx,
    Powermill,
}

/// Extracts the operation records out of one parsed CAM export file.
/// NX exports pack many operations into one file under a list key;
/// PowerMill exports usually hold a single operation.
pub fn pick_ops(vendor: CamVendor, cam_json: &Value) -> Vec<Value> {
    if let Value::Array(items) = cam_json {
        return items.clone();
    }
    let Value::Object(map) = cam_json else {
        return vec![cam_json.clone()];
    };

    let list_keys: &[&str] = match vendor {
        CamVendor::Nx => &["operations", "ops", "toolpaths", "steps", "items"],
        CamVendor::Powermill => &["operation", "toolpath", "items"],
    };
    for key in list_keys {
        match map.get(*key) {
            Some(Value::Array(items)) => return items.clone(),
            Some(Value::Object(_)) if vendor == CamVendor::Powermill => {
                return vec![map[*key].clone()];
            }
            _ => {}
        }
    }
    vec![cam_json.clone()]
}

/// Canonical form for CAM filenames in `ops_order` matching: basename,
/// lowercased, extension stripped.
pub fn canon_filename(name: &str) -> String {
    let base = name
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .to_string();
    let stem = match base.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => base.as_str(),
    };
    stem.to_ascii_lowercase()
}

/// Parses an `ops_order` value: either a comma-separated filename list or a
/// JSON array of filenames.
pub fn parse_ops_order(ops_order: &str) -> Result<Vec<String>, CoreError> {
    let s = ops_order.trim();
    if s.is_empty() {
        return Err(CoreError::validation("ops_order is required for powermill"));
    }
    if s.starts_with('[') {
        let arr: Vec<String> = serde_json::from_str(s)
            .map_err(|_| CoreError::validation("invalid ops_order JSON array"))?;
        if arr.is_empty() {
            return Err(CoreError::validation("ops_order array is empty"));
        }
        return Ok(arr);
    }
    let parts: Vec<String> = s
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        return Err(CoreError::validation(
            "ops_order must list filenames separated by commas",
        ));
    }
    Ok(parts)
}

/// Reorders indices into `filenames` to follow `ops_order`. Matching is by
/// canonical filename; duplicates, missing entries or a count mismatch are
/// all rejected because the resulting sequence would be ambiguous.
pub fn reorder_by_ops_order(
    filenames: &[String],
    ops_order: &str,
) -> Result<Vec<usize>, CoreError> {
    let wanted: Vec<String> = parse_ops_order(ops_order)?
        .iter()
        .map(|n| canon_filename(n))
        .collect();

    let mut slots: BTreeMap<String, usize> = BTreeMap::new();
    for (i, name) in filenames.iter().enumerate() {
        let key = canon_filename(name);
        if key.is_empty() {
            return Err(CoreError::validation("CAM file without a valid filename"));
        }
        if slots.insert(key, i).is_some() {
            return Err(CoreError::validation(format!(
                "duplicate CAM filename (ignoring extension): {}",
                name
            )));
        }
    }

    if wanted.len() != filenames.len() {
        return Err(CoreError::validation(format!(
            "ops_order count ({}) must equal CAM file count ({})",
            wanted.len(),
            filenames.len()
        )));
    }

    let mut ordered = Vec::with_capacity(wanted.len());
    let mut used: BTreeMap<&str, bool> = BTreeMap::new();
    for key in &wanted {
        let index = *slots.get(key).ok_or_else(|| {
            CoreError::validation(format!(
                "ops_order references a file that was not provided: '{}'",
                key
            ))
        })?;
        if used.insert(key.as_str(), true).is_some() {
            return Err(CoreError::validation(format!(
                "ops_order contains a duplicate entry: '{}'",
                key
            )));
        }
        ordered.push(index);
    }
    Ok(ordered)
}

/// Builds the `dt_asset` document for one synthesized cutting tool.
pub fn build_cutting_tool_document(
    global_asset_id: &str,
    asset_id: &str,
    element_id: &str,
    display_name: &str,
    values: &BTreeMap<String, String>,
    schema_version: &str,
) -> Element {
    let mut root = Element::new("dt_asset");
    root.set_attr("xmlns", "http://digital-thread.re/dt_asset");
    root.set_attr("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance");
    root.set_attr("schemaVersion", schema_version);
    root.push(Element::with_text("asset_global_id", global_asset_id));
    root.push(Element::with_text("id", asset_id));
    root.push(Element::with_text("asset_kind", "instance"));

    let mut element = Element::new("dt_elements");
    element.set_attr("xsi:type", "dt_cutting_tool_13399");
    element.push(Element::with_text("element_id", element_id));
    element.push(Element::with_text("category", "CuttingTool"));
    let display = if display_name.is_empty() {
        element_id
    } else {
        display_name
    };
    element.push(Element::with_text("display_name", display));

    for component in COMPONENT_ORDER {
        if let Some(value) = values.get(*component) {
            let mut numerical = Element::new("numerical_value");
            numerical.push(Element::with_text("value_name", *component));
            numerical.push(Element::with_text("value_component", value.clone()));
            element.push(numerical);
        }
    }
    root.push(element);
    root
}
