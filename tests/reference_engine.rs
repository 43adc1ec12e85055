use dt_asset_db::config::AddressingConfig;
use dt_asset_db::logic::addressing::build_fullpath;
use dt_asset_db::logic::asset_ops;
use dt_asset_db::logic::reference_ops::{
    attach_reference, remove_reference, AnchorParams, ProjectKeys, RefTarget,
};
use dt_asset_db::model::{CoreError, Element};
use dt_asset_db::store::memory::MemoryStore;
use dt_asset_db::store::traits::AssetCrud;

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

const NC_FILE_XML: &str = r#"<dt_asset xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" schemaVersion="v31">
  <asset_global_id>g1</asset_global_id>
  <id>files-1</id>
  <asset_kind>instance</asset_kind>
  <dt_elements xsi:type="dt_file">
    <element_id>part.nc</element_id>
    <category>NC</category>
  </dt_elements>
</dt_asset>"#;

fn cfg() -> AddressingConfig {
    AddressingConfig::default()
}

fn project_keys() -> ProjectKeys {
    ProjectKeys {
        global_asset_id: "g1".to_string(),
        asset_id: "prj-1".to_string(),
        project_element_id: "p1".to_string(),
    }
}

fn target(asset_id: &str, element_id: &str) -> RefTarget {
    RefTarget {
        global_asset_id: "g1".to_string(),
        asset_id: asset_id.to_string(),
        element_id: element_id.to_string(),
    }
}

async fn seed_project(store: &MemoryStore) {
    asset_ops::create_from_xml(store, &cfg(), PROJECT_XML, false)
        .await
        .unwrap();
}

async fn project_element(store: &MemoryStore) -> Element {
    let doc = asset_ops::extract_merged(store, &cfg(), "g1", "prj-1", Some("dt_project"))
        .await
        .unwrap();
    Element::parse(&doc).unwrap()
}

#[tokio::test]
async fn machine_tool_references_allocate_ids_and_stay_trailing() {
    let store = MemoryStore::new();
    seed_project(&store).await;

    let params = AnchorParams {
        workplan_id: Some("wp1".to_string()),
        ..AnchorParams::default()
    };
    for element_id in ["mt-a", "mt-b"] {
        attach_reference(
            &store,
            &cfg(),
            &project_keys(),
            &target("machines-1", element_id),
            "dt_machine_tool",
            None,
            &params,
        )
        .await
        .unwrap();
    }

    let root = project_element(&store).await;
    let project = root.child("dt_elements").unwrap();
    let workplan = project.child("main_workplan").unwrap();
    let refs = workplan.children_named("ref_dt_machine_tool");
    assert_eq!(refs.len(), 2);
    assert_eq!(refs[0].child_text("element_id"), Some("machine-tool-001"));
    assert_eq!(refs[1].child_text("element_id"), Some("machine-tool-002"));
    // References sit after the workplan's other children.
    assert_eq!(
        workplan.children.last().map(|c| c.local_name()),
        Some("ref_dt_machine_tool")
    );

    let expected = build_fullpath("g1", "machines-1", "mt-a", &cfg());
    let keys = refs[0].child("keys").unwrap();
    assert_eq!(keys.child_text("value"), Some(expected.as_str()));
}

#[tokio::test]
async fn duplicate_attach_conflicts_until_removed() {
    let store = MemoryStore::new();
    seed_project(&store).await;

    let params = AnchorParams {
        workplan_id: Some("wp1".to_string()),
        ..AnchorParams::default()
    };
    let mt = target("machines-1", "mt-a");
    attach_reference(
        &store,
        &cfg(),
        &project_keys(),
        &mt,
        "dt_machine_tool",
        None,
        &params,
    )
    .await
    .unwrap();

    let err = attach_reference(
        &store,
        &cfg(),
        &project_keys(),
        &mt,
        "dt_machine_tool",
        None,
        &params,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    remove_reference(
        &store,
        &cfg(),
        &project_keys(),
        &mt,
        "dt_machine_tool",
        None,
        &params,
    )
    .await
    .unwrap();

    // Gone means removable exactly once.
    let err = remove_reference(
        &store,
        &cfg(),
        &project_keys(),
        &mt,
        "dt_machine_tool",
        None,
        &params,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::ReferenceNotFound(_)));

    // And re-attachable afterwards.
    attach_reference(
        &store,
        &cfg(),
        &project_keys(),
        &mt,
        "dt_machine_tool",
        None,
        &params,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn material_attach_creates_missing_workpiece() {
    let store = MemoryStore::new();
    seed_project(&store).await;

    let params = AnchorParams {
        workpiece_id: Some("wpc-new".to_string()),
        ..AnchorParams::default()
    };
    attach_reference(
        &store,
        &cfg(),
        &project_keys(),
        &target("materials-1", "steel-1045"),
        "dt_material",
        None,
        &params,
    )
    .await
    .unwrap();

    let root = project_element(&store).await;
    let project = root.child("dt_elements").unwrap();
    let created = project
        .children_named("its_workpieces")
        .into_iter()
        .find(|w| w.child_text("its_id") == Some("wpc-new"))
        .unwrap();
    let material_ref = created.child("ref_dt_material").unwrap();
    assert_eq!(material_ref.child_text("element_id"), Some("material-001"));
}

#[tokio::test]
async fn missing_anchor_param_is_a_validation_error() {
    let store = MemoryStore::new();
    seed_project(&store).await;

    let err = attach_reference(
        &store,
        &cfg(),
        &project_keys(),
        &target("machines-1", "mt-a"),
        "dt_machine_tool",
        None,
        &AnchorParams::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn file_references_invert_onto_the_file_document() {
    let store = MemoryStore::new();
    seed_project(&store).await;
    asset_ops::create_from_xml(&store, &cfg(), NC_FILE_XML, false)
        .await
        .unwrap();

    let params = AnchorParams {
        workplan_id: Some("wp1".to_string()),
        ..AnchorParams::default()
    };
    let file = target("files-1", "part.nc");
    attach_reference(
        &store,
        &cfg(),
        &project_keys(),
        &file,
        "dt_file",
        Some("NC"),
        &params,
    )
    .await
    .unwrap();

    // The inverse pairs land in the file document's structural index, so
    // the NC lookup used by the CAM pipeline resolves.
    let docs = asset_ops::nc_files_by_project(&store, &cfg(), "g1", "prj-1", "p1", "wp1")
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert!(docs[0].has_ref_pair("WORKPLAN", "wp1"));

    // Second attach of the same pairs conflicts.
    let err = attach_reference(
        &store,
        &cfg(),
        &project_keys(),
        &file,
        "dt_file",
        Some("NC"),
        &params,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    remove_reference(
        &store,
        &cfg(),
        &project_keys(),
        &file,
        "dt_file",
        Some("NC"),
        &params,
    )
    .await
    .unwrap();
    let nc_doc = store
        .get_asset_by_keys(&dt_asset_db::model::AssetKeys::new(
            dt_asset_db::logic::addressing::normalize_global_id("g1", &cfg()),
            "files-1",
            "dt_file",
            "part.nc",
        ))
        .await
        .unwrap()
        .unwrap();
    assert!(!nc_doc.has_ref_pair("WORKPLAN", "wp1"));
}

#[tokio::test]
async fn project_reference_updates_survive_the_path_extractor() {
    let store = MemoryStore::new();
    seed_project(&store).await;

    let params = AnchorParams {
        workplan_id: Some("wp1".to_string()),
        ..AnchorParams::default()
    };
    attach_reference(
        &store,
        &cfg(),
        &project_keys(),
        &target("machines-1", "mt-a"),
        "dt_machine_tool",
        None,
        &params,
    )
    .await
    .unwrap();

    let xml = asset_ops::extract_attribute_path(
        &store,
        &cfg(),
        "g1",
        "prj-1",
        "p1",
        "dt_elements/main_workplan/ref_dt_machine_tool/element_id",
    )
    .await
    .unwrap();
    assert!(xml.contains("machine-tool-001"));
}
