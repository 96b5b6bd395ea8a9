use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::get,
    Router,
};

use crate::{
    collection_endpoint::DeleteResBody,
    definition::{Environment, NewEnvironment},
    response::{from_store, store_error_response, success_response, ApiResponse},
    state::AppState,
};

pub fn route_environments_to(app: Router<AppState>) -> Router<AppState> {
    app.route(
        "/api/environments",
        get(list_environments).post(create_environment),
    )
    .route(
        "/api/environments/:id",
        get(get_environment)
            .put(update_environment)
            .delete(delete_environment),
    )
}

async fn list_environments(State(state): State<AppState>) -> ApiResponse<Vec<Environment>> {
    from_store(state.store.list_environments().await)
}

async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse<Environment> {
    from_store(state.store.get_environment(&id).await)
}

async fn create_environment(
    State(state): State<AppState>,
    Json(new): Json<NewEnvironment>,
) -> ApiResponse<Environment> {
    match state.store.create_environment(&new).await {
        Ok(environment) => success_response(StatusCode::CREATED, environment),
        Err(err) => store_error_response(err),
    }
}

async fn update_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<NewEnvironment>,
) -> ApiResponse<Environment> {
    from_store(state.store.update_environment(&id, &update).await)
}

async fn delete_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse<DeleteResBody> {
    from_store(
        state
            .store
            .delete_environment(&id)
            .await
            .map(|_| DeleteResBody { success: true }),
    )
}
