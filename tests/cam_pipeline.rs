use dt_asset_db::config::AddressingConfig;
use dt_asset_db::logic::addressing::normalize_global_id;
use dt_asset_db::logic::asset_ops;
use dt_asset_db::logic::cam_inject::{apply_cam, CamApplyRequest, CamFile};
use dt_asset_db::logic::cam_map::CamVendor;
use dt_asset_db::model::{
    AssetDocument, AssetGroup, AssetKeys, AssetQuery, CoreError, NewAsset, RefKeyEntry,
};
use dt_asset_db::store::memory::MemoryStore;
use dt_asset_db::store::traits::{AssetCrud, AssetRollback, AssetSearch, BlobStore};

const PROJECT_XML: &str = r#"<dt_asset xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" schemaVersion="v31">
  <asset_global_id>g1</asset_global_id>
  <id>prj-1</id>
  <asset_kind>instance</asset_kind>
  <dt_elements xsi:type="dt_project">
    <element_id>p1</element_id>
    <its_id>p1</its_id>
    <main_workplan>
      <its_id>wp1</its_id>
    </main_workplan>
    <its_workpieces>
      <its_id>wpc1</its_id>
    </its_workpieces>
  </dt_elements>
</dt_asset>"#;

const MAPPING: &str = r#"{
  "tool.name": "MachiningWorkingstep.its_operation.MachiningOperation.its_tool.MachiningTool.its_id",
  "strategy.cutmode": "MachiningWorkingstep.its_operation.MachiningOperation.its_machining_strategy.FreeformStrategy.cutmode"
}"#;

fn cfg() -> AddressingConfig {
    AddressingConfig::default()
}

fn nx_request(cam_json: &str) -> CamApplyRequest {
    CamApplyRequest {
        global_asset_id: "g1".to_string(),
        asset_id: "prj-1".to_string(),
        project_element_id: "p1".to_string(),
        workplan_id: "wp1".to_string(),
        vendor: CamVendor::Nx,
        cam_files: vec![CamFile {
            filename: "export.json".to_string(),
            contents: cam_json.to_string(),
        }],
        mapping: MAPPING.to_string(),
        ops_order: None,
    }
}

fn three_ops() -> String {
    serde_json::json!({
        "operations": [
            {"tool": {"name": "Mill D12"}, "strategy": {"cutmode": "climb"}},
            {"tool": {"name": "Drill D5"}, "strategy": {"cutmode": "conventional"}},
            {"tool": {"name": "Mill D12"}, "strategy": {"cutmode": "climb"}}
        ]
    })
    .to_string()
}

/// Seeds the project and an NC file whose inverse reference pairs point at
/// it, with the given NC program as blob content.
async fn seed<S: dt_asset_db::store::traits::Store>(store: &S, nc_program: &str) {
    asset_ops::create_from_xml(store, &cfg(), PROJECT_XML, false)
        .await
        .unwrap();

    let g_url = normalize_global_id("g1", &cfg());
    let oid = store.put_blob(nc_program.as_bytes().to_vec()).await.unwrap();
    let nc_xml = format!(
        r#"<dt_asset xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" schemaVersion="v31">
  <asset_global_id>{g}</asset_global_id>
  <id>files-1</id>
  <asset_kind>instance</asset_kind>
  <dt_elements xsi:type="dt_file">
    <element_id>part.nc</element_id>
    <category>NC</category>
    <keys><key>DT_GLOBAL_ASSET</key><value>{g}</value></keys>
    <keys><key>DT_ASSET</key><value>prj-1</value></keys>
    <keys><key>DT_PROJECT</key><value>p1</value></keys>
    <keys><key>WORKPLAN</key><value>wp1</value></keys>
    <keys><key>FILE_OID</key><value>{oid}</value></keys>
  </dt_elements>
</dt_asset>"#,
        g = g_url,
        oid = oid
    );
    asset_ops::create_from_xml(store, &cfg(), &nc_xml, false)
        .await
        .unwrap();
}

async fn cutting_tool_docs<S: AssetSearch>(store: &S) -> Vec<AssetDocument> {
    store
        .search_assets(&AssetQuery {
            asset_type: Some("dt_cutting_tool_13399".to_string()),
            ..AssetQuery::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn nx_apply_reuses_tools_and_appends_workingsteps() {
    let store = MemoryStore::new();
    seed(&store, "T1 M6\nG0 X0\nT2 M06\nG1 Z-2\nT1 M6\n").await;

    let outcome = apply_cam(&store, &cfg(), &nx_request(&three_ops()))
        .await
        .unwrap();
    assert_eq!(outcome.applied, 3);
    assert_eq!(outcome.tool_sequence, vec!["T1", "T2", "T1"]);
    assert_eq!(outcome.tools_created, 2);
    assert_eq!(outcome.workingsteps_appended, 3);

    let tools = cutting_tool_docs(&store).await;
    assert_eq!(tools.len(), 2);
    assert!(tools.iter().all(|t| t.asset_id == "prj-1_cutting_tool"));

    let merged = asset_ops::extract_merged(&store, &cfg(), "g1", "prj-1", Some("dt_project"))
        .await
        .unwrap();
    assert_eq!(merged.matches("machining_workingstep").count(), 3);
    assert!(merged.contains("ref_dt_cutting_tool"));

    // A populated workplan refuses a second apply.
    let err = apply_cam(&store, &cfg(), &nx_request(&three_ops()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn sequence_and_op_count_must_match() {
    let store = MemoryStore::new();
    seed(&store, "T1 M6\nT2 M6\nT1 M6\n").await;

    let two_ops = serde_json::json!({
        "operations": [
            {"tool": {"name": "Mill D12"}},
            {"tool": {"name": "Drill D5"}}
        ]
    })
    .to_string();
    let err = apply_cam(&store, &cfg(), &nx_request(&two_ops))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    // Nothing was persisted.
    assert!(cutting_tool_docs(&store).await.is_empty());
}

#[tokio::test]
async fn empty_tool_sequence_is_a_noop() {
    let store = MemoryStore::new();
    seed(&store, "G0 X0 Y0\nG1 Z-5 F200\n").await;

    let outcome = apply_cam(&store, &cfg(), &nx_request(&three_ops()))
        .await
        .unwrap();
    assert_eq!(outcome.applied, 0);
    assert!(outcome.tool_sequence.is_empty());
    assert!(cutting_tool_docs(&store).await.is_empty());
}

#[tokio::test]
async fn powermill_orders_one_op_per_file() {
    let store = MemoryStore::new();
    seed(&store, "T1 M6\nT2 M6\n").await;

    let op = |tool: &str| {
        serde_json::json!({"operation": {"tool": {"name": tool}}}).to_string()
    };
    let request = CamApplyRequest {
        global_asset_id: "g1".to_string(),
        asset_id: "prj-1".to_string(),
        project_element_id: "p1".to_string(),
        workplan_id: "wp1".to_string(),
        vendor: CamVendor::Powermill,
        cam_files: vec![
            CamFile {
                filename: "second.json".to_string(),
                contents: op("Drill D5"),
            },
            CamFile {
                filename: "first.json".to_string(),
                contents: op("Mill D12"),
            },
        ],
        mapping: MAPPING.to_string(),
        ops_order: Some("first, second".to_string()),
    };

    let outcome = apply_cam(&store, &cfg(), &request).await.unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(
        outcome.order_applied,
        Some(vec!["first.json".to_string(), "second.json".to_string()])
    );
}

/// Delegating store whose project-document write always fails, exercising
/// the compensation path.
struct FailingStore {
    inner: MemoryStore,
}

#[async_trait::async_trait]
impl AssetCrud for FailingStore {
    async fn insert_asset(&self, asset: NewAsset) -> Result<AssetDocument, CoreError> {
        self.inner.insert_asset(asset).await
    }
    async fn upsert_asset(&self, asset: NewAsset) -> Result<AssetDocument, CoreError> {
        self.inner.upsert_asset(asset).await
    }
    async fn get_asset_by_id(&self, id: &str) -> Result<Option<AssetDocument>, CoreError> {
        self.inner.get_asset_by_id(id).await
    }
    async fn get_asset_by_keys(
        &self,
        keys: &AssetKeys,
    ) -> Result<Option<AssetDocument>, CoreError> {
        self.inner.get_asset_by_keys(keys).await
    }
    async fn update_asset_data_by_id(
        &self,
        _id: &str,
        _data: &str,
        _ref_keys: &[RefKeyEntry],
    ) -> Result<bool, CoreError> {
        Err(CoreError::internal("simulated write failure"))
    }
    async fn replace_asset_by_id(&self, id: &str, asset: NewAsset) -> Result<bool, CoreError> {
        self.inner.replace_asset_by_id(id, asset).await
    }
    async fn set_upload_lock(&self, id: &str, locked: bool) -> Result<bool, CoreError> {
        self.inner.set_upload_lock(id, locked).await
    }
    async fn delete_asset_by_keys(&self, keys: &AssetKeys) -> Result<bool, CoreError> {
        self.inner.delete_asset_by_keys(keys).await
    }
}

#[async_trait::async_trait]
impl AssetSearch for FailingStore {
    async fn search_assets(&self, query: &AssetQuery) -> Result<Vec<AssetDocument>, CoreError> {
        self.inner.search_assets(query).await
    }
    async fn distinct_global_ids(&self) -> Result<Vec<String>, CoreError> {
        self.inner.distinct_global_ids().await
    }
    async fn distinct_asset_ids(&self, global_asset_id: &str) -> Result<Vec<String>, CoreError> {
        self.inner.distinct_asset_ids(global_asset_id).await
    }
    async fn grouped_asset_ids(&self) -> Result<Vec<AssetGroup>, CoreError> {
        self.inner.grouped_asset_ids().await
    }
    async fn find_by_ref_keys(
        &self,
        asset_type: &str,
        category: Option<&str>,
        pairs: &[(String, String)],
    ) -> Result<Vec<AssetDocument>, CoreError> {
        self.inner.find_by_ref_keys(asset_type, category, pairs).await
    }
}

#[async_trait::async_trait]
impl AssetRollback for FailingStore {
    async fn force_restore_data(
        &self,
        id: &str,
        data: &str,
        ref_keys: &[RefKeyEntry],
    ) -> Result<(), CoreError> {
        self.inner.force_restore_data(id, data, ref_keys).await
    }
    async fn force_delete_element(
        &self,
        global_asset_id: &str,
        asset_id: &str,
        element_id: &str,
    ) -> Result<bool, CoreError> {
        self.inner
            .force_delete_element(global_asset_id, asset_id, element_id)
            .await
    }
}

#[async_trait::async_trait]
impl BlobStore for FailingStore {
    async fn put_blob(&self, content: Vec<u8>) -> Result<String, CoreError> {
        self.inner.put_blob(content).await
    }
    async fn get_blob(&self, oid: &str) -> Result<Option<Vec<u8>>, CoreError> {
        self.inner.get_blob(oid).await
    }
    async fn delete_blob(&self, oid: &str) -> Result<bool, CoreError> {
        self.inner.delete_blob(oid).await
    }
}

#[tokio::test]
async fn failed_project_write_rolls_back_created_tools() {
    let store = FailingStore {
        inner: MemoryStore::new(),
    };
    seed(&store, "T1 M6\nT2 M6\nT1 M6\n").await;

    let g_url = normalize_global_id("g1", &cfg());
    let before = store
        .get_asset_by_keys(&AssetKeys::new(
            g_url.clone(),
            "prj-1",
            "dt_project",
            "p1",
        ))
        .await
        .unwrap()
        .unwrap();

    let err = apply_cam(&store, &cfg(), &nx_request(&three_ops()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Internal(_)));

    // Compensation deleted every tool document created during the run.
    assert!(cutting_tool_docs(&store).await.is_empty());

    // The project snapshot was restored byte for byte.
    let after = store
        .get_asset_by_keys(&AssetKeys::new(g_url, "prj-1", "dt_project", "p1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.data, before.data);
}
