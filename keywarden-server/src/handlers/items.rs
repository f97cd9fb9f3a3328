//! Items service: CRUD, batch fetch and hash lookup.

use crate::auth::{ensure_self, AuthedUser};
use crate::error::ApiError;
use crate::AppState;
use axum::extract::State;
use axum::{Extension, Json};
use keywarden_core::model::ItemType;
use keywarden_core::proto;

fn type_label(code: &str) -> String {
    ItemType::from_code(code)
        .map(|t| t.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Create a new item.
pub async fn create_item(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<proto::CreateItemRequest>,
) -> Result<Json<proto::InfoResponse>, ApiError> {
    ensure_self(&authed, &req.username)?;

    state.storage.create_item(&req.username, &req.item).map_err(|e| {
        tracing::warn!(username = %req.username, item = %req.item.name, error = %e, "create item failed");
        ApiError::from(e)
    })?;

    Ok(Json(proto::InfoResponse {
        info: format!(
            "successfully created {} '{}'",
            type_label(&req.item.item_type),
            req.item.name
        ),
    }))
}

/// Fetch one item by `(name, type)`; sealed blobs are returned verbatim.
pub async fn get_item(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<proto::GetItemRequest>,
) -> Result<Json<proto::Item>, ApiError> {
    ensure_self(&authed, &req.username)?;
    let item = state
        .storage
        .get_item_by_name_and_type(&req.username, &req.name, &req.item_type)?;
    Ok(Json(item))
}

/// List short representations of all items, sorted by name.
pub async fn get_item_list(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<proto::ItemListRequest>,
) -> Result<Json<Vec<proto::ItemSummary>>, ApiError> {
    ensure_self(&authed, &req.username)?;
    let items = state.storage.get_item_list(&req.username)?;
    Ok(Json(items))
}

/// Batch fetch of full items, preserving request order.
pub async fn get_items(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<proto::GetItemsRequest>,
) -> Result<Json<Vec<proto::Item>>, ApiError> {
    ensure_self(&authed, &req.username)?;
    let items = state.storage.get_items_by_id(&req.username, &req.ids)?;
    Ok(Json(items))
}

/// Current hash of an item, used by the agent's optimistic-concurrency check.
pub async fn get_item_hash(
    State(state): State<AppState>,
    Json(req): Json<proto::ItemHashRequest>,
) -> Result<Json<proto::ItemHashResponse>, ApiError> {
    let hash = state.storage.get_item_hash_by_id(req.id)?;
    Ok(Json(proto::ItemHashResponse { hash }))
}

/// Update an existing item.
pub async fn update_item(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<proto::UpdateItemRequest>,
) -> Result<Json<proto::InfoResponse>, ApiError> {
    ensure_self(&authed, &req.username)?;

    state.storage.update_item(&req.username, &req.item).map_err(|e| {
        tracing::warn!(username = %req.username, item = %req.item.name, error = %e, "update item failed");
        ApiError::from(e)
    })?;

    Ok(Json(proto::InfoResponse {
        info: format!(
            "successfully updated {} '{}'",
            type_label(&req.item.item_type),
            req.item.name
        ),
    }))
}

/// Delete an item.
pub async fn delete_item(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<proto::DeleteItemRequest>,
) -> Result<Json<proto::InfoResponse>, ApiError> {
    ensure_self(&authed, &req.username)?;
    state.storage.delete_item(&req.username, req.id)?;
    Ok(Json(proto::InfoResponse {
        info: "item deleted".to_string(),
    }))
}
