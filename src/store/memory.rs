use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{
    AssetDocument, AssetGroup, AssetKeys, AssetQuery, CoreError, NewAsset, RefKeyEntry,
};
use crate::store::traits::{AssetCrud, AssetRollback, AssetSearch, BlobStore};

/// In-memory store used by tests and local runs. Uniqueness and the upload
/// lock are enforced the same way the Postgres store does, so engine-level
/// behavior is identical across backends.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, AssetDocument>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_id_by_keys(documents: &HashMap<String, AssetDocument>, keys: &AssetKeys) -> Option<String> {
        documents
            .values()
            .find(|doc| doc.keys() == *keys)
            .map(|doc| doc.id.clone())
    }

    fn materialize(asset: NewAsset) -> AssetDocument {
        let now = Utc::now();
        AssetDocument {
            id: Uuid::new_v4().to_string(),
            global_asset_id: asset.keys.global_asset_id,
            asset_id: asset.keys.asset_id,
            asset_type: asset.keys.asset_type,
            category: asset.category,
            element_id: asset.keys.element_id,
            data: asset.data,
            is_upload: asset.is_upload,
            ref_keys: asset.ref_keys,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait::async_trait]
impl AssetCrud for MemoryStore {
    async fn insert_asset(&self, asset: NewAsset) -> Result<AssetDocument, CoreError> {
        let mut documents = self.documents.write();
        if let Some(existing_id) = Self::find_id_by_keys(&documents, &asset.keys) {
            return Err(CoreError::DuplicateKey {
                keys: asset.keys,
                existing_id,
            });
        }
        let doc = Self::materialize(asset);
        documents.insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn upsert_asset(&self, asset: NewAsset) -> Result<AssetDocument, CoreError> {
        let mut documents = self.documents.write();
        match Self::find_id_by_keys(&documents, &asset.keys) {
            Some(id) => {
                let doc = documents
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::internal("document vanished during upsert"))?;
                if doc.is_upload {
                    return Err(CoreError::Locked(format!(
                        "asset '{}' is locked for upload",
                        doc.element_id
                    )));
                }
                doc.category = asset.category;
                doc.data = asset.data;
                doc.ref_keys = asset.ref_keys;
                doc.updated_at = Utc::now();
                Ok(doc.clone())
            }
            None => {
                let doc = Self::materialize(asset);
                documents.insert(doc.id.clone(), doc.clone());
                Ok(doc)
            }
        }
    }

    async fn get_asset_by_id(&self, id: &str) -> Result<Option<AssetDocument>, CoreError> {
        Ok(self.documents.read().get(id).cloned())
    }

    async fn get_asset_by_keys(
        &self,
        keys: &AssetKeys,
    ) -> Result<Option<AssetDocument>, CoreError> {
        let documents = self.documents.read();
        Ok(documents.values().find(|doc| doc.keys() == *keys).cloned())
    }

    async fn update_asset_data_by_id(
        &self,
        id: &str,
        data: &str,
        ref_keys: &[RefKeyEntry],
    ) -> Result<bool, CoreError> {
        let mut documents = self.documents.write();
        let Some(doc) = documents.get_mut(id) else {
            return Ok(false);
        };
        if doc.is_upload {
            return Err(CoreError::Locked(format!(
                "asset '{}' is locked for upload",
                doc.element_id
            )));
        }
        doc.data = data.to_string();
        doc.ref_keys = ref_keys.to_vec();
        doc.updated_at = Utc::now();
        Ok(true)
    }

    async fn replace_asset_by_id(&self, id: &str, asset: NewAsset) -> Result<bool, CoreError> {
        let mut documents = self.documents.write();
        let Some(doc) = documents.get_mut(id) else {
            return Ok(false);
        };
        if doc.is_upload {
            return Err(CoreError::Locked(format!(
                "asset '{}' is locked for upload",
                doc.element_id
            )));
        }
        doc.global_asset_id = asset.keys.global_asset_id;
        doc.asset_id = asset.keys.asset_id;
        doc.asset_type = asset.keys.asset_type;
        doc.element_id = asset.keys.element_id;
        doc.category = asset.category;
        doc.data = asset.data;
        doc.ref_keys = asset.ref_keys;
        doc.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_upload_lock(&self, id: &str, locked: bool) -> Result<bool, CoreError> {
        let mut documents = self.documents.write();
        let Some(doc) = documents.get_mut(id) else {
            return Ok(false);
        };
        doc.is_upload = locked;
        doc.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_asset_by_keys(&self, keys: &AssetKeys) -> Result<bool, CoreError> {
        let mut documents = self.documents.write();
        match Self::find_id_by_keys(&documents, keys) {
            Some(id) => {
                documents.remove(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl AssetSearch for MemoryStore {
    async fn search_assets(&self, query: &AssetQuery) -> Result<Vec<AssetDocument>, CoreError> {
        let documents = self.documents.read();
        let mut hits: Vec<AssetDocument> = documents
            .values()
            .filter(|doc| {
                query
                    .global_asset_id
                    .as_deref()
                    .map_or(true, |v| doc.global_asset_id == v)
                    && query.asset_id.as_deref().map_or(true, |v| doc.asset_id == v)
                    && query
                        .asset_type
                        .as_deref()
                        .map_or(true, |v| doc.asset_type == v)
                    && query
                        .category
                        .as_deref()
                        .map_or(true, |v| doc.category.as_deref() == Some(v))
                    && query
                        .element_id
                        .as_deref()
                        .map_or(true, |v| doc.element_id == v)
                    && query.element_id_contains.as_deref().map_or(true, |v| {
                        doc.element_id
                            .to_ascii_lowercase()
                            .contains(&v.to_ascii_lowercase())
                    })
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hits)
    }

    async fn distinct_global_ids(&self) -> Result<Vec<String>, CoreError> {
        let documents = self.documents.read();
        let mut ids: Vec<String> = documents
            .values()
            .map(|doc| doc.global_asset_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn distinct_asset_ids(&self, global_asset_id: &str) -> Result<Vec<String>, CoreError> {
        let documents = self.documents.read();
        let mut ids: Vec<String> = documents
            .values()
            .filter(|doc| doc.global_asset_id == global_asset_id)
            .map(|doc| doc.asset_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn grouped_asset_ids(&self) -> Result<Vec<AssetGroup>, CoreError> {
        let globals = self.distinct_global_ids().await?;
        let mut groups = Vec::with_capacity(globals.len());
        for global_asset_id in globals {
            let asset_ids = self.distinct_asset_ids(&global_asset_id).await?;
            groups.push(AssetGroup {
                global_asset_id,
                asset_ids,
            });
        }
        Ok(groups)
    }

    async fn find_by_ref_keys(
        &self,
        asset_type: &str,
        category: Option<&str>,
        pairs: &[(String, String)],
    ) -> Result<Vec<AssetDocument>, CoreError> {
        let documents = self.documents.read();
        let mut hits: Vec<AssetDocument> = documents
            .values()
            .filter(|doc| {
                doc.asset_type == asset_type
                    && category.map_or(true, |c| doc.category.as_deref() == Some(c))
                    && pairs.iter().all(|(k, v)| doc.has_ref_pair(k, v))
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hits)
    }
}

#[async_trait::async_trait]
impl AssetRollback for MemoryStore {
    async fn force_restore_data(
        &self,
        id: &str,
        data: &str,
        ref_keys: &[RefKeyEntry],
    ) -> Result<(), CoreError> {
        let mut documents = self.documents.write();
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found(format!("no document '{}' to restore", id)))?;
        doc.data = data.to_string();
        doc.ref_keys = ref_keys.to_vec();
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn force_delete_element(
        &self,
        global_asset_id: &str,
        asset_id: &str,
        element_id: &str,
    ) -> Result<bool, CoreError> {
        let mut documents = self.documents.write();
        let ids: Vec<String> = documents
            .values()
            .filter(|doc| {
                doc.global_asset_id == global_asset_id
                    && doc.asset_id == asset_id
                    && doc.element_id == element_id
            })
            .map(|doc| doc.id.clone())
            .collect();
        for id in &ids {
            documents.remove(id);
        }
        Ok(!ids.is_empty())
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryStore {
    async fn put_blob(&self, content: Vec<u8>) -> Result<String, CoreError> {
        let oid = Uuid::new_v4().to_string();
        self.blobs.write().insert(oid.clone(), content);
        Ok(oid)
    }

    async fn get_blob(&self, oid: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.blobs.read().get(oid).cloned())
    }

    async fn delete_blob(&self, oid: &str) -> Result<bool, CoreError> {
        Ok(self.blobs.write().remove(oid).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_asset(element_id: &str) -> NewAsset {
        NewAsset {
            keys: AssetKeys::new("g1", "a1", "dt_material", element_id),
            category: None,
            data: format!("<dt_asset><id>a1</id><dt_elements><element_id>{}</element_id></dt_elements></dt_asset>", element_id),
            is_upload: false,
            ref_keys: vec![],
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected_either_order() {
        let store = MemoryStore::new();
        store.insert_asset(new_asset("m1")).await.unwrap();
        let err = store.insert_asset(new_asset("m1")).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateKey { .. }));
        // A different element id under the same asset is fine.
        store.insert_asset(new_asset("m2")).await.unwrap();
    }

    #[tokio::test]
    async fn upload_lock_blocks_writes_and_preserves_data() {
        let store = MemoryStore::new();
        let doc = store.insert_asset(new_asset("m1")).await.unwrap();
        store.set_upload_lock(&doc.id, true).await.unwrap();

        assert!(matches!(
            store.upsert_asset(new_asset("m1")).await,
            Err(CoreError::Locked(_))
        ));
        assert!(matches!(
            store.update_asset_data_by_id(&doc.id, "<x/>", &[]).await,
            Err(CoreError::Locked(_))
        ));

        let unchanged = store.get_asset_by_id(&doc.id).await.unwrap().unwrap();
        assert_eq!(unchanged.data, doc.data);

        // The rollback path is exempt from the lock.
        store.force_restore_data(&doc.id, "<y/>", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn ref_key_pairs_are_matched_conjunctively() {
        let store = MemoryStore::new();
        let mut asset = new_asset("f1");
        asset.keys.asset_type = "dt_file".to_string();
        asset.category = Some("NC".to_string());
        asset.ref_keys = vec![
            RefKeyEntry { key: "DT_PROJECT".into(), value: "p1".into() },
            RefKeyEntry { key: "WORKPLAN".into(), value: "wp1".into() },
        ];
        store.insert_asset(asset).await.unwrap();

        let both = vec![
            ("DT_PROJECT".to_string(), "p1".to_string()),
            ("WORKPLAN".to_string(), "wp1".to_string()),
        ];
        assert_eq!(
            store.find_by_ref_keys("dt_file", Some("NC"), &both).await.unwrap().len(),
            1
        );

        let wrong = vec![
            ("DT_PROJECT".to_string(), "p1".to_string()),
            ("WORKPLAN".to_string(), "other".to_string()),
        ];
        assert!(store
            .find_by_ref_keys("dt_file", Some("NC"), &wrong)
            .await
            .unwrap()
            .is_empty());
    }
}
