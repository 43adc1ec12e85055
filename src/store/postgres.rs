use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::model::{
    AssetDocument, AssetGroup, AssetKeys, AssetQuery, CoreError, NewAsset, RefKeyEntry,
};
use crate::store::traits::{AssetCrud, AssetRollback, AssetSearch, BlobStore};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

const ASSET_COLUMNS: &str = "id, global_asset_id, asset_id, asset_type, category, element_id, data, is_upload, ref_keys, created_at, updated_at";

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS assets (
                id TEXT PRIMARY KEY,
                global_asset_id TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                asset_type TEXT NOT NULL,
                category TEXT,
                element_id TEXT NOT NULL,
                data TEXT NOT NULL,
                is_upload BOOLEAN NOT NULL DEFAULT FALSE,
                ref_keys JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create assets table")?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS assets_composite_key
             ON assets (global_asset_id, asset_id, asset_type, element_id)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create composite key index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS assets_ref_keys ON assets USING GIN (ref_keys)")
            .execute(&self.pool)
            .await
            .context("Failed to create ref_keys index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                oid TEXT PRIMARY KEY,
                content BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create blobs table")?;

        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<AssetDocument, CoreError> {
        let ref_keys: serde_json::Value = row.get("ref_keys");
        let ref_keys: Vec<RefKeyEntry> = serde_json::from_value(ref_keys)
            .map_err(|err| CoreError::internal(format!("corrupt ref_keys column: {}", err)))?;
        Ok(AssetDocument {
            id: row.get("id"),
            global_asset_id: row.get("global_asset_id"),
            asset_id: row.get("asset_id"),
            asset_type: row.get("asset_type"),
            category: row.get("category"),
            element_id: row.get("element_id"),
            data: row.get("data"),
            is_upload: row.get("is_upload"),
            ref_keys,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn ref_keys_json(ref_keys: &[RefKeyEntry]) -> Result<serde_json::Value, CoreError> {
        serde_json::to_value(ref_keys)
            .map_err(|err| CoreError::internal(format!("ref_keys serialization: {}", err)))
    }

    async fn fetch_lock_state(&self, id: &str) -> Result<Option<bool>, CoreError> {
        let row = sqlx::query("SELECT is_upload, element_id FROM assets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        if row.get::<bool, _>("is_upload") {
            return Err(CoreError::Locked(format!(
                "asset '{}' is locked for upload",
                row.get::<String, _>("element_id")
            )));
        }
        Ok(Some(false))
    }
}

#[async_trait::async_trait]
impl AssetCrud for PostgresStore {
    async fn insert_asset(&self, asset: NewAsset) -> Result<AssetDocument, CoreError> {
        let id = Uuid::new_v4().to_string();
        let ref_keys = Self::ref_keys_json(&asset.ref_keys)?;
        let result = sqlx::query(&format!(
            "INSERT INTO assets (id, global_asset_id, asset_id, asset_type, category, element_id, data, is_upload, ref_keys)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {}",
            ASSET_COLUMNS
        ))
        .bind(&id)
        .bind(&asset.keys.global_asset_id)
        .bind(&asset.keys.asset_id)
        .bind(&asset.keys.asset_type)
        .bind(&asset.category)
        .bind(&asset.keys.element_id)
        .bind(&asset.data)
        .bind(asset.is_upload)
        .bind(&ref_keys)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Self::row_to_document(&row),
            Err(err) => {
                let unique = err
                    .as_database_error()
                    .map(|db| db.is_unique_violation())
                    .unwrap_or(false);
                if !unique {
                    return Err(err.into());
                }
                let existing = self.get_asset_by_keys(&asset.keys).await?;
                match existing {
                    Some(doc) => Err(CoreError::DuplicateKey {
                        keys: asset.keys,
                        existing_id: doc.id,
                    }),
                    // Lost a race with a concurrent delete; report the
                    // conflict without an id.
                    None => Err(CoreError::DuplicateKey {
                        keys: asset.keys,
                        existing_id: String::new(),
                    }),
                }
            }
        }
    }

    async fn upsert_asset(&self, asset: NewAsset) -> Result<AssetDocument, CoreError> {
        if let Some(existing) = self.get_asset_by_keys(&asset.keys).await? {
            if existing.is_upload {
                return Err(CoreError::Locked(format!(
                    "asset '{}' is locked for upload",
                    existing.element_id
                )));
            }
            let ref_keys = Self::ref_keys_json(&asset.ref_keys)?;
            let row = sqlx::query(&format!(
                "UPDATE assets SET category = $2, data = $3, ref_keys = $4, updated_at = NOW()
                 WHERE id = $1
                 RETURNING {}",
                ASSET_COLUMNS
            ))
            .bind(&existing.id)
            .bind(&asset.category)
            .bind(&asset.data)
            .bind(&ref_keys)
            .fetch_one(&self.pool)
            .await?;
            return Self::row_to_document(&row);
        }
        self.insert_asset(asset).await
    }

    async fn get_asset_by_id(&self, id: &str) -> Result<Option<AssetDocument>, CoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM assets WHERE id = $1", ASSET_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_document).transpose()
    }

    async fn get_asset_by_keys(
        &self,
        keys: &AssetKeys,
    ) -> Result<Option<AssetDocument>, CoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM assets
             WHERE global_asset_id = $1 AND asset_id = $2 AND asset_type = $3 AND element_id = $4",
            ASSET_COLUMNS
        ))
        .bind(&keys.global_asset_id)
        .bind(&keys.asset_id)
        .bind(&keys.asset_type)
        .bind(&keys.element_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_document).transpose()
    }

    async fn update_asset_data_by_id(
        &self,
        id: &str,
        data: &str,
        ref_keys: &[RefKeyEntry],
    ) -> Result<bool, CoreError> {
        if self.fetch_lock_state(id).await?.is_none() {
            return Ok(false);
        }
        let ref_keys = Self::ref_keys_json(ref_keys)?;
        let result = sqlx::query(
            "UPDATE assets SET data = $2, ref_keys = $3, updated_at = NOW()
             WHERE id = $1 AND is_upload = FALSE",
        )
        .bind(id)
        .bind(data)
        .bind(&ref_keys)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_asset_by_id(&self, id: &str, asset: NewAsset) -> Result<bool, CoreError> {
        if self.fetch_lock_state(id).await?.is_none() {
            return Ok(false);
        }
        let ref_keys = Self::ref_keys_json(&asset.ref_keys)?;
        let result = sqlx::query(
            "UPDATE assets SET global_asset_id = $2, asset_id = $3, asset_type = $4,
                 category = $5, element_id = $6, data = $7, ref_keys = $8, updated_at = NOW()
             WHERE id = $1 AND is_upload = FALSE",
        )
        .bind(id)
        .bind(&asset.keys.global_asset_id)
        .bind(&asset.keys.asset_id)
        .bind(&asset.keys.asset_type)
        .bind(&asset.category)
        .bind(&asset.keys.element_id)
        .bind(&asset.data)
        .bind(&ref_keys)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_upload_lock(&self, id: &str, locked: bool) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE assets SET is_upload = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(locked)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_asset_by_keys(&self, keys: &AssetKeys) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "DELETE FROM assets
             WHERE global_asset_id = $1 AND asset_id = $2 AND asset_type = $3 AND element_id = $4",
        )
        .bind(&keys.global_asset_id)
        .bind(&keys.asset_id)
        .bind(&keys.asset_type)
        .bind(&keys.element_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl AssetSearch for PostgresStore {
    async fn search_assets(&self, query: &AssetQuery) -> Result<Vec<AssetDocument>, CoreError> {
        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM assets WHERE 1 = 1", ASSET_COLUMNS));
        if let Some(v) = &query.global_asset_id {
            builder.push(" AND global_asset_id = ").push_bind(v);
        }
        if let Some(v) = &query.asset_id {
            builder.push(" AND asset_id = ").push_bind(v);
        }
        if let Some(v) = &query.asset_type {
            builder.push(" AND asset_type = ").push_bind(v);
        }
        if let Some(v) = &query.category {
            builder.push(" AND category = ").push_bind(v);
        }
        if let Some(v) = &query.element_id {
            builder.push(" AND element_id = ").push_bind(v);
        }
        if let Some(v) = &query.element_id_contains {
            builder
                .push(" AND element_id ILIKE ")
                .push_bind(format!("%{}%", v.replace('%', "\\%").replace('_', "\\_")));
        }
        builder.push(" ORDER BY created_at");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_document).collect()
    }

    async fn distinct_global_ids(&self) -> Result<Vec<String>, CoreError> {
        let rows =
            sqlx::query("SELECT DISTINCT global_asset_id FROM assets ORDER BY global_asset_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(|row| row.get("global_asset_id")).collect())
    }

    async fn distinct_asset_ids(&self, global_asset_id: &str) -> Result<Vec<String>, CoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT asset_id FROM assets WHERE global_asset_id = $1 ORDER BY asset_id",
        )
        .bind(global_asset_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("asset_id")).collect())
    }

    async fn grouped_asset_ids(&self) -> Result<Vec<AssetGroup>, CoreError> {
        let rows = sqlx::query(
            "SELECT global_asset_id, ARRAY_AGG(DISTINCT asset_id ORDER BY asset_id) AS asset_ids
             FROM assets GROUP BY global_asset_id ORDER BY global_asset_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| AssetGroup {
                global_asset_id: row.get("global_asset_id"),
                asset_ids: row.get("asset_ids"),
            })
            .collect())
    }

    async fn find_by_ref_keys(
        &self,
        asset_type: &str,
        category: Option<&str>,
        pairs: &[(String, String)],
    ) -> Result<Vec<AssetDocument>, CoreError> {
        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM assets WHERE asset_type = ", ASSET_COLUMNS));
        builder.push_bind(asset_type);
        if let Some(category) = category {
            builder.push(" AND category = ").push_bind(category);
        }
        for (key, value) in pairs {
            let pair = serde_json::json!([{ "key": key, "value": value }]);
            builder.push(" AND ref_keys @> ").push_bind(pair);
        }
        builder.push(" ORDER BY created_at");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_document).collect()
    }
}

#[async_trait::async_trait]
impl AssetRollback for PostgresStore {
    async fn force_restore_data(
        &self,
        id: &str,
        data: &str,
        ref_keys: &[RefKeyEntry],
    ) -> Result<(), CoreError> {
        let ref_keys = Self::ref_keys_json(ref_keys)?;
        let result = sqlx::query(
            "UPDATE assets SET data = $2, ref_keys = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(data)
        .bind(&ref_keys)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!(
                "no document '{}' to restore",
                id
            )));
        }
        Ok(())
    }

    async fn force_delete_element(
        &self,
        global_asset_id: &str,
        asset_id: &str,
        element_id: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "DELETE FROM assets WHERE global_asset_id = $1 AND asset_id = $2 AND element_id = $3",
        )
        .bind(global_asset_id)
        .bind(asset_id)
        .bind(element_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl BlobStore for PostgresStore {
    async fn put_blob(&self, content: Vec<u8>) -> Result<String, CoreError> {
        let oid = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO blobs (oid, content) VALUES ($1, $2)")
            .bind(&oid)
            .bind(&content)
            .execute(&self.pool)
            .await?;
        Ok(oid)
    }

    async fn get_blob(&self, oid: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let row = sqlx::query("SELECT content FROM blobs WHERE oid = $1")
            .bind(oid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("content")))
    }

    async fn delete_blob(&self, oid: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM blobs WHERE oid = $1")
            .bind(oid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
