use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::element::Element;
use crate::model::error::CoreError;

pub type Id = String;

/// Well-known key names carried inside `keys` reference nodes.
pub const KEY_ELEMENT_FULLPATH: &str = "DT_ELEMENT_FULLPATH";
pub const KEY_GLOBAL_ASSET: &str = "DT_GLOBAL_ASSET";
pub const KEY_ASSET: &str = "DT_ASSET";
pub const KEY_PROJECT: &str = "DT_PROJECT";
pub const KEY_WORKPLAN: &str = "WORKPLAN";
pub const KEY_WORKINGSTEP: &str = "WORKINGSTEP";
/// Binary content pointer for `dt_file` elements (blob-store object id).
pub const KEY_FILE_OID: &str = "FILE_OID";

pub const TYPE_PROJECT: &str = "dt_project";
pub const TYPE_FILE: &str = "dt_file";
pub const TYPE_MATERIAL: &str = "dt_material";
pub const TYPE_MACHINE_TOOL: &str = "dt_machine_tool";
pub const TYPE_CUTTING_TOOL_13399: &str = "dt_cutting_tool_13399";

pub const DEFAULT_SCHEMA_VERSION: &str = "v31";

/// The composite key every asset document is unique under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetKeys {
    pub global_asset_id: String,
    pub asset_id: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    pub element_id: String,
}

impl AssetKeys {
    pub fn new(
        global_asset_id: impl Into<String>,
        asset_id: impl Into<String>,
        asset_type: impl Into<String>,
        element_id: impl Into<String>,
    ) -> Self {
        Self {
            global_asset_id: global_asset_id.into(),
            asset_id: asset_id.into(),
            asset_type: asset_type.into(),
            element_id: element_id.into(),
        }
    }
}

/// One `{key, value}` pair extracted from a `keys` node in the stored XML.
/// The set of all pairs forms the structural reference index a document is
/// searchable by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefKeyEntry {
    pub key: String,
    pub value: String,
}

/// A stored asset document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetDocument {
    pub id: Id,
    pub global_asset_id: String,
    pub asset_id: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub element_id: String,
    pub data: String,
    pub is_upload: bool,
    #[serde(default)]
    pub ref_keys: Vec<RefKeyEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssetDocument {
    pub fn keys(&self) -> AssetKeys {
        AssetKeys::new(
            self.global_asset_id.clone(),
            self.asset_id.clone(),
            self.asset_type.clone(),
            self.element_id.clone(),
        )
    }

    pub fn ref_key_value(&self, key: &str) -> Option<&str> {
        self.ref_keys
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    pub fn has_ref_pair(&self, key: &str, value: &str) -> bool {
        self.ref_keys.iter().any(|e| e.key == key && e.value == value)
    }
}

/// Fields derived from an asset XML payload before persistence; the store
/// assigns the document id and timestamps.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub keys: AssetKeys,
    pub category: Option<String>,
    pub data: String,
    pub is_upload: bool,
    pub ref_keys: Vec<RefKeyEntry>,
}

impl NewAsset {
    /// Derives the composite key, category and structural reference index
    /// from a single-element `dt_asset` XML payload.
    pub fn from_xml(xml: &str) -> Result<NewAsset, CoreError> {
        let meta = AssetMeta::from_xml(xml)?;
        Ok(NewAsset {
            keys: meta.keys,
            category: meta.category,
            data: xml.to_string(),
            is_upload: false,
            ref_keys: meta.ref_keys,
        })
    }
}

/// Metadata extracted from a `dt_asset` document.
#[derive(Debug, Clone)]
pub struct AssetMeta {
    pub keys: AssetKeys,
    pub category: Option<String>,
    pub ref_keys: Vec<RefKeyEntry>,
}

impl AssetMeta {
    pub fn from_xml(xml: &str) -> Result<AssetMeta, CoreError> {
        let root = Element::parse(xml)?;
        AssetMeta::from_element(&root)
    }

    pub fn from_element(root: &Element) -> Result<AssetMeta, CoreError> {
        if root.local_name() != "dt_asset" {
            return Err(CoreError::validation(format!(
                "expected dt_asset root, got '{}'",
                root.local_name()
            )));
        }

        let global_asset_id = root
            .child_text("asset_global_id")
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CoreError::validation("dt_asset is missing asset_global_id"))?;
        let asset_id = root
            .child_text("id")
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CoreError::validation("dt_asset is missing id"))?;

        let elements = root.children_named("dt_elements");
        let element = match elements.as_slice() {
            [one] => *one,
            [] => return Err(CoreError::validation("dt_asset has no dt_elements")),
            _ => {
                return Err(CoreError::validation(
                    "dt_asset has multiple dt_elements; split the payload first",
                ))
            }
        };

        let asset_type = element
            .xsi_type()
            .map(str::to_string)
            .ok_or_else(|| CoreError::validation("dt_elements is missing xsi:type"))?;
        let element_id = element
            .child_text("element_id")
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CoreError::validation("dt_elements is missing element_id"))?;
        let category = element.child_text("category").map(str::to_string);

        Ok(AssetMeta {
            keys: AssetKeys::new(global_asset_id, asset_id, asset_type, element_id),
            category,
            ref_keys: collect_ref_keys(root),
        })
    }
}

/// Walks the whole tree collecting every `keys` node that carries `key` and
/// `value` children. Extracted once at write time so reference queries never
/// have to re-parse stored XML.
pub fn collect_ref_keys(root: &Element) -> Vec<RefKeyEntry> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.local_name() == "keys" {
            if let (Some(key), Some(value)) = (node.child_text("key"), node.child_text("value")) {
                out.push(RefKeyEntry {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        for child in node.children.iter().rev() {
            stack.push(child);
        }
    }
    out
}

/// AND-combined search filters over the asset collection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetQuery {
    pub global_asset_id: Option<String>,
    pub asset_id: Option<String>,
    #[serde(rename = "type")]
    pub asset_type: Option<String>,
    pub category: Option<String>,
    pub element_id: Option<String>,
    /// Case-insensitive substring match on element_id.
    pub element_id_contains: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetGroup {
    pub global_asset_id: String,
    pub asset_ids: Vec<String>,
}
