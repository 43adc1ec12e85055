use crate::model::asset::AssetKeys;

/// Crate-wide error taxonomy. Store implementations and the engines all
/// surface failures through this type; the HTTP layer maps each kind to a
/// status code.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Composite-key uniqueness violation. Carries the conflicting key tuple
    /// and the id of the pre-existing document so callers can decide
    /// reuse-vs-error.
    #[error("duplicate asset key ({global_asset_id}, {asset_id}, {asset_type}, {element_id}); existing document {existing_id}", global_asset_id = .keys.global_asset_id, asset_id = .keys.asset_id, asset_type = .keys.asset_type, element_id = .keys.element_id)]
    DuplicateKey { keys: AssetKeys, existing_id: String },

    #[error("asset is locked after platform upload: {0}")]
    Locked(String),

    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("malformed reference uri: {0}")]
    Malformed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal(msg.into())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Internal(format!("database error: {}", err))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation(format!("invalid JSON: {}", err))
    }
}
