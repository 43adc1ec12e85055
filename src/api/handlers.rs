use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::AddressingConfig;
use crate::logic::asset_ops::{self, MultiCreateOutcome};
use crate::logic::cam_inject::{apply_cam, CamApplyOutcome, CamApplyRequest};
use crate::logic::reference_ops::{
    attach_reference, remove_reference, AnchorParams, AttachOutcome, ProjectKeys, RefTarget,
    RemoveOutcome,
};
use crate::model::{AssetDocument, AssetGroup, AssetKeys, AssetQuery, CoreError};
use crate::store::traits::Store;

/// Shared handler state: the persistence backend plus the addressing
/// prefixes used to qualify bare global ids.
pub struct ApiContext<S> {
    pub store: S,
    pub addressing: AddressingConfig,
}

impl<S> ApiContext<S> {
    pub fn new(store: S, addressing: AddressingConfig) -> Self {
        Self { store, addressing }
    }
}

pub type AppState<S> = Arc<ApiContext<S>>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Wraps engine errors for the HTTP boundary. The mapping is fixed:
/// validation and malformed payloads are 400, lookups that miss are 404,
/// key/lock contention is 409, everything else is 500.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) | CoreError::Malformed(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) | CoreError::ReferenceNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) | CoreError::DuplicateKey { .. } | CoreError::Locked(_) => {
                StatusCode::CONFLICT
            }
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn xml_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateQuery {
    #[serde(default)]
    pub upsert: bool,
}

pub async fn create_asset<S: Store>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<CreateQuery>,
    body: String,
) -> Result<(StatusCode, Json<AssetDocument>), ApiError> {
    let doc =
        asset_ops::create_from_xml(&ctx.store, &ctx.addressing, &body, query.upsert).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

pub async fn create_assets_multi<S: Store>(
    State(ctx): State<AppState<S>>,
    body: String,
) -> Result<Response, ApiError> {
    let outcome: MultiCreateOutcome =
        asset_ops::create_multi_from_xml(&ctx.store, &ctx.addressing, &body).await?;
    let status = if outcome.summary.failed == 0 {
        StatusCode::CREATED
    } else if outcome.summary.created > 0 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(outcome)).into_response())
}

pub async fn search_assets<S: Store>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<AssetQuery>,
) -> Result<Json<Vec<AssetDocument>>, ApiError> {
    Ok(Json(ctx.store.search_assets(&query).await?))
}

pub async fn get_asset_by_id<S: Store>(
    State(ctx): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Json<AssetDocument>, ApiError> {
    let doc = ctx
        .store
        .get_asset_by_id(&id)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("no document '{}'", id)))?;
    Ok(Json(doc))
}

#[derive(Debug, Deserialize)]
pub struct KeysQuery {
    pub global_asset_id: String,
    pub asset_id: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    pub element_id: String,
}

impl KeysQuery {
    fn into_keys(self) -> AssetKeys {
        AssetKeys::new(
            self.global_asset_id,
            self.asset_id,
            self.asset_type,
            self.element_id,
        )
    }
}

pub async fn get_asset_by_keys<S: Store>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<AssetDocument>, ApiError> {
    let doc = ctx
        .store
        .get_asset_by_keys(&query.into_keys())
        .await?
        .ok_or_else(|| CoreError::not_found("asset not found by keys"))?;
    Ok(Json(doc))
}

pub async fn update_asset<S: Store>(
    State(ctx): State<AppState<S>>,
    Path(id): Path<String>,
    body: String,
) -> Result<Json<AssetDocument>, ApiError> {
    let doc = asset_ops::update_from_xml(&ctx.store, &ctx.addressing, &id, &body).await?;
    Ok(Json(doc))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

pub async fn delete_asset<S: Store>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted =
        asset_ops::delete_by_keys(&ctx.store, &ctx.addressing, &query.into_keys()).await?;
    Ok(Json(DeleteResponse { deleted }))
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub available: bool,
    pub keys: AssetKeys,
}

/// Upload precheck: 200 when the payload's composite key is free, 409 when
/// it is already taken.
pub async fn check_asset_exists<S: Store>(
    State(ctx): State<AppState<S>>,
    body: String,
) -> Result<Json<ExistsResponse>, ApiError> {
    let keys = asset_ops::exists_by_keys(&ctx.store, &ctx.addressing, &body).await?;
    Ok(Json(ExistsResponse {
        available: true,
        keys,
    }))
}

pub async fn lock_asset_for_upload<S: Store>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<AssetDocument>, ApiError> {
    let doc =
        asset_ops::lock_for_upload(&ctx.store, &ctx.addressing, &query.into_keys()).await?;
    Ok(Json(doc))
}

pub async fn list_global_ids<S: Store>(
    State(ctx): State<AppState<S>>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(ctx.store.distinct_global_ids().await?))
}

pub async fn list_grouped_asset_ids<S: Store>(
    State(ctx): State<AppState<S>>,
) -> Result<Json<Vec<AssetGroup>>, ApiError> {
    Ok(Json(ctx.store.grouped_asset_ids().await?))
}

#[derive(Debug, Deserialize)]
pub struct MergedQuery {
    pub global_asset_id: String,
    pub asset_id: String,
    #[serde(rename = "type")]
    pub asset_type: Option<String>,
}

pub async fn extract_merged_asset<S: Store>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<MergedQuery>,
) -> Result<Response, ApiError> {
    let xml = asset_ops::extract_merged(
        &ctx.store,
        &ctx.addressing,
        &query.global_asset_id,
        &query.asset_id,
        query.asset_type.as_deref(),
    )
    .await?;
    Ok(xml_response(xml))
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub global_asset_id: String,
    pub asset_id: String,
    pub project_element_id: String,
    pub path: String,
}

pub async fn extract_project_path<S: Store>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let xml = asset_ops::extract_attribute_path(
        &ctx.store,
        &ctx.addressing,
        &query.global_asset_id,
        &query.asset_id,
        &query.project_element_id,
        &query.path,
    )
    .await?;
    Ok(xml_response(xml))
}

#[derive(Debug, Deserialize)]
pub struct ReferenceRequest {
    pub project: ProjectKeys,
    pub target: RefTarget,
    pub ref_type: String,
    #[serde(default)]
    pub ref_category: Option<String>,
    #[serde(default)]
    pub params: AnchorParams,
}

pub async fn attach_asset_reference<S: Store>(
    State(ctx): State<AppState<S>>,
    RequestJson(request): RequestJson<ReferenceRequest>,
) -> Result<Json<AttachOutcome>, ApiError> {
    let outcome = attach_reference(
        &ctx.store,
        &ctx.addressing,
        &request.project,
        &request.target,
        &request.ref_type,
        request.ref_category.as_deref(),
        &request.params,
    )
    .await?;
    Ok(Json(outcome))
}

pub async fn remove_asset_reference<S: Store>(
    State(ctx): State<AppState<S>>,
    RequestJson(request): RequestJson<ReferenceRequest>,
) -> Result<Json<RemoveOutcome>, ApiError> {
    let outcome = remove_reference(
        &ctx.store,
        &ctx.addressing,
        &request.project,
        &request.target,
        &request.ref_type,
        request.ref_category.as_deref(),
        &request.params,
    )
    .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct NcFilesQuery {
    pub global_asset_id: String,
    pub asset_id: String,
    pub project_element_id: String,
    pub workplan_id: String,
}

#[derive(Debug, Serialize)]
pub struct NcFilesResponse {
    pub total: usize,
    pub items: Vec<AssetDocument>,
}

pub async fn list_project_nc_files<S: Store>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<NcFilesQuery>,
) -> Result<Json<NcFilesResponse>, ApiError> {
    let items = asset_ops::nc_files_by_project(
        &ctx.store,
        &ctx.addressing,
        &query.global_asset_id,
        &query.asset_id,
        &query.project_element_id,
        &query.workplan_id,
    )
    .await?;
    Ok(Json(NcFilesResponse {
        total: items.len(),
        items,
    }))
}

pub async fn apply_cam_to_project<S: Store>(
    State(ctx): State<AppState<S>>,
    RequestJson(request): RequestJson<CamApplyRequest>,
) -> Result<Json<CamApplyOutcome>, ApiError> {
    let outcome = apply_cam(&ctx.store, &ctx.addressing, &request).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct BlobCreated {
    pub oid: String,
    pub size: usize,
}

pub async fn upload_blob<S: Store>(
    State(ctx): State<AppState<S>>,
    body: Bytes,
) -> Result<(StatusCode, Json<BlobCreated>), ApiError> {
    let size = body.len();
    let oid = ctx.store.put_blob(body.to_vec()).await?;
    Ok((StatusCode::CREATED, Json(BlobCreated { oid, size })))
}

pub async fn download_blob<S: Store>(
    State(ctx): State<AppState<S>>,
    Path(oid): Path<String>,
) -> Result<Response, ApiError> {
    let content = ctx
        .store
        .get_blob(&oid)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("no blob '{}'", oid)))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        content,
    )
        .into_response())
}
