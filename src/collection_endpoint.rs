use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};

use crate::{
    definition::{Collection, NewCollection, RequestDefinition},
    response::{error_response, from_store, store_error_response, success_response, ApiResponse},
    state::AppState,
};

pub fn route_collections_to(app: Router<AppState>) -> Router<AppState> {
    app.route(
        "/api/collections",
        get(list_collections).post(create_collection),
    )
    .route(
        "/api/collections/:id",
        get(get_collection)
            .put(update_collection)
            .delete(delete_collection),
    )
    .route("/api/collections/:id/requests", get(list_requests))
    .route("/api/collections/:id/export", get(export_collection))
}

#[derive(serde::Serialize)]
pub(crate) struct DeleteResBody {
    pub success: bool,
}

async fn list_collections(State(state): State<AppState>) -> ApiResponse<Vec<Collection>> {
    from_store(state.store.list_collections().await)
}

async fn get_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse<Collection> {
    from_store(state.store.get_collection(&id).await)
}

async fn create_collection(
    State(state): State<AppState>,
    Json(new): Json<NewCollection>,
) -> ApiResponse<Collection> {
    if new.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "collection name should not be empty");
    }
    match state.store.create_collection(&new).await {
        Ok(collection) => success_response(StatusCode::CREATED, collection),
        Err(err) => store_error_response(err),
    }
}

async fn update_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<NewCollection>,
) -> ApiResponse<Collection> {
    if update.name.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "collection name should not be empty");
    }
    from_store(state.store.update_collection(&id, &update).await)
}

async fn delete_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse<DeleteResBody> {
    from_store(
        state
            .store
            .delete_collection(&id)
            .await
            .map(|_| DeleteResBody { success: true }),
    )
}

async fn list_requests(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse<Vec<RequestDefinition>> {
    from_store(state.store.list_requests(&id).await)
}

#[derive(serde::Serialize)]
struct ExportResBody {
    collection: Collection,
    requests: Vec<RequestDefinition>,
    exported_at: DateTime<Utc>,
}

async fn export_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse<ExportResBody> {
    let collection = match state.store.get_collection(&id).await {
        Ok(collection) => collection,
        Err(err) => return store_error_response(err),
    };
    from_store(
        state
            .store
            .list_requests(&id)
            .await
            .map(|requests| ExportResBody {
                collection,
                requests,
                exported_at: Utc::now(),
            }),
    )
}
