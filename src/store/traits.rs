use crate::model::{
    AssetDocument, AssetGroup, AssetKeys, AssetQuery, CoreError, NewAsset, RefKeyEntry,
};

/// Document CRUD under the composite-key uniqueness invariant.
///
/// `insert_asset` fails `DuplicateKey` when the composite key is taken;
/// `upsert_asset` replaces instead. Both, along with data updates, fail
/// `Locked` against a document whose `is_upload` flag is set.
#[async_trait::async_trait]
pub trait AssetCrud: Send + Sync {
    async fn insert_asset(&self, asset: NewAsset) -> Result<AssetDocument, CoreError>;
    async fn upsert_asset(&self, asset: NewAsset) -> Result<AssetDocument, CoreError>;
    async fn get_asset_by_id(&self, id: &str) -> Result<Option<AssetDocument>, CoreError>;
    async fn get_asset_by_keys(&self, keys: &AssetKeys)
        -> Result<Option<AssetDocument>, CoreError>;
    /// Replaces a document's XML and structural reference index. Returns
    /// false when no document with that id exists.
    async fn update_asset_data_by_id(
        &self,
        id: &str,
        data: &str,
        ref_keys: &[RefKeyEntry],
    ) -> Result<bool, CoreError>;
    /// Rewrites a document in place, re-deriving its key fields from the
    /// new payload. Returns false when no document with that id exists.
    async fn replace_asset_by_id(&self, id: &str, asset: NewAsset) -> Result<bool, CoreError>;
    /// Sets or clears the upload advisory lock.
    async fn set_upload_lock(&self, id: &str, locked: bool) -> Result<bool, CoreError>;
    async fn delete_asset_by_keys(&self, keys: &AssetKeys) -> Result<bool, CoreError>;
}

/// Read-side queries over the asset collection.
#[async_trait::async_trait]
pub trait AssetSearch: Send + Sync {
    async fn search_assets(&self, query: &AssetQuery) -> Result<Vec<AssetDocument>, CoreError>;
    async fn distinct_global_ids(&self) -> Result<Vec<String>, CoreError>;
    async fn distinct_asset_ids(&self, global_asset_id: &str) -> Result<Vec<String>, CoreError>;
    async fn grouped_asset_ids(&self) -> Result<Vec<AssetGroup>, CoreError>;
    /// Documents of the given type (and category, when set) whose structural
    /// reference index contains every `(key, value)` pair.
    async fn find_by_ref_keys(
        &self,
        asset_type: &str,
        category: Option<&str>,
        pairs: &[(String, String)],
    ) -> Result<Vec<AssetDocument>, CoreError>;
}

/// Compensating operations used by rollback paths. These bypass the upload
/// lock and the usual validation on purpose: they restore a known-good prior
/// state and must not be refused.
#[async_trait::async_trait]
pub trait AssetRollback: Send + Sync {
    async fn force_restore_data(
        &self,
        id: &str,
        data: &str,
        ref_keys: &[RefKeyEntry],
    ) -> Result<(), CoreError>;
    async fn force_delete_element(
        &self,
        global_asset_id: &str,
        asset_id: &str,
        element_id: &str,
    ) -> Result<bool, CoreError>;
}

/// Minimal binary-content contract backing `dt_file` documents.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_blob(&self, content: Vec<u8>) -> Result<String, CoreError>;
    async fn get_blob(&self, oid: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn delete_blob(&self, oid: &str) -> Result<bool, CoreError>;
}

/// Complete persistence contract the engines and handlers are generic over.
pub trait Store: AssetCrud + AssetSearch + AssetRollback + BlobStore {}

impl<T: AssetCrud + AssetSearch + AssetRollback + BlobStore> Store for T {}
