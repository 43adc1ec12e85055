use axum::{
    routing::{delete, get, post, put},
    Router,
};
use crate::api::handlers::{self, AppState};
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Asset documents
        .route("/assets", post(handlers::create_asset::<S>))
        .route("/assets", get(handlers::search_assets::<S>))
        .route("/assets", delete(handlers::delete_asset::<S>))
        .route("/assets/multi", post(handlers::create_assets_multi::<S>))
        .route("/assets/exists", post(handlers::check_asset_exists::<S>))
        .route("/assets/by-keys", get(handlers::get_asset_by_keys::<S>))
        .route("/assets/lock", post(handlers::lock_asset_for_upload::<S>))
        .route("/assets/merged", get(handlers::extract_merged_asset::<S>))
        .route("/assets/globals", get(handlers::list_global_ids::<S>))
        .route("/assets/groups", get(handlers::list_grouped_asset_ids::<S>))
        .route("/assets/:id", get(handlers::get_asset_by_id::<S>))
        .route("/assets/:id", put(handlers::update_asset::<S>))
        // Project graph operations
        .route("/projects/path", get(handlers::extract_project_path::<S>))
        .route("/projects/nc-files", get(handlers::list_project_nc_files::<S>))
        .route(
            "/projects/references/attach",
            post(handlers::attach_asset_reference::<S>),
        )
        .route(
            "/projects/references/remove",
            post(handlers::remove_asset_reference::<S>),
        )
        .route("/projects/cam/apply", post(handlers::apply_cam_to_project::<S>))
        // Binary content
        .route("/blobs", post(handlers::upload_blob::<S>))
        .route("/blobs/:oid", get(handlers::download_blob::<S>))
}
