use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    assertion::{evaluate, summarize, Summary, Test, TestResult},
    collection_endpoint::DeleteResBody,
    definition::{BodyType, KeyValue, NewRequest, RequestDefinition, RequestUpdate},
    executor::CapturedResponse,
    history::{HistoryEntry, NewHistoryEntry},
    method::Method,
    response::{
        error_response, execute_error_response, from_store, store_error_response,
        success_response, ApiResponse,
    },
    state::AppState,
    variables::{resolve_request, RequestTemplate},
};

pub fn route_requests_to(app: Router<AppState>) -> Router<AppState> {
    app.route("/api/requests", post(create_request))
        .route(
            "/api/requests/:id",
            get(get_request).put(update_request).delete(delete_request),
        )
        .route("/api/requests/:id/history", get(get_history))
        .route("/api/requests/:id/execute", post(execute_request))
        .route("/api/history", post(append_history))
        .route("/api/execute", post(execute_ad_hoc))
}

async fn create_request(
    State(state): State<AppState>,
    Json(new): Json<NewRequest>,
) -> ApiResponse<RequestDefinition> {
    match state.store.create_request(&new).await {
        Ok(request) => success_response(StatusCode::CREATED, request),
        Err(err) => store_error_response(err),
    }
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse<RequestDefinition> {
    from_store(state.store.get_request(&id).await)
}

async fn update_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<RequestUpdate>,
) -> ApiResponse<RequestDefinition> {
    from_store(state.store.update_request(&id, &update).await)
}

async fn delete_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse<DeleteResBody> {
    from_store(
        state
            .store
            .delete_request(&id)
            .await
            .map(|_| DeleteResBody { success: true }),
    )
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResponse<Vec<HistoryEntry>> {
    from_store(state.store.history(&id, state.history_limit).await)
}

#[derive(Serialize)]
struct AppendResBody {
    success: bool,
    id: String,
}

async fn append_history(
    State(state): State<AppState>,
    Json(entry): Json<NewHistoryEntry>,
) -> ApiResponse<AppendResBody> {
    from_store(
        state
            .store
            .append_history(&entry)
            .await
            .map(|history| AppendResBody {
                success: true,
                id: history.id,
            }),
    )
}

#[derive(Serialize)]
struct ExecutionResBody {
    response: CapturedResponse,
    test_results: Vec<TestResult>,
    summary: Summary,
}

impl ExecutionResBody {
    fn new(response: CapturedResponse, tests: &[Test]) -> Self {
        let test_results = evaluate(tests, &response);
        let summary = summarize(&test_results);
        Self {
            response,
            test_results,
            summary,
        }
    }
}

#[derive(Deserialize, Default)]
struct ExecuteReqBody {
    environment_id: Option<String>,
}

/// Runs a stored request: resolve, execute, evaluate its tests and record a
/// history entry. Overlapping runs of the same request are rejected. The
/// body is optional; when present it must be a valid `ExecuteReqBody`.
async fn execute_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResponse<ExecutionResBody> {
    let ExecuteReqBody { environment_id } = if body.is_empty() {
        ExecuteReqBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid execute body: {}", err),
                )
            }
        }
    };

    let _guard = match state.in_flight.begin(&id) {
        Ok(guard) => guard,
        Err(err) => return execute_error_response(err),
    };

    let definition = match state.store.get_request(&id).await {
        Ok(definition) => definition,
        Err(err) => return store_error_response(err),
    };
    let variables = match environment_id {
        Some(environment_id) => match state.store.get_environment(&environment_id).await {
            Ok(environment) => environment.variables,
            Err(err) => return store_error_response(err),
        },
        None => vec![],
    };

    let resolved = resolve_request(&RequestTemplate::from(&definition), &variables);
    let response = state.executor.execute(&resolved).await;
    info!(
        request_id = %id,
        method = %resolved.method,
        url = %resolved.url,
        status = response.status,
        "request executed"
    );

    let entry = NewHistoryEntry::from_execution(&id, &resolved, &response);
    if let Err(err) = state.store.append_history(&entry).await {
        error!(request_id = %id, "cannot record history: {}", err);
    }

    success_response(
        StatusCode::OK,
        ExecutionResBody::new(response, &definition.tests),
    )
}

#[derive(Deserialize)]
struct AdHocReqBody {
    #[serde(default)]
    method: Method,
    url: String,
    #[serde(default)]
    headers: Vec<KeyValue>,
    #[serde(default)]
    params: Vec<KeyValue>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    body_type: BodyType,
    #[serde(default)]
    tests: Vec<Test>,
    #[serde(default)]
    variables: Vec<KeyValue>,
}

/// Executes an unsaved request. Nothing is recorded.
async fn execute_ad_hoc(
    State(state): State<AppState>,
    Json(req): Json<AdHocReqBody>,
) -> ApiResponse<ExecutionResBody> {
    let template = RequestTemplate {
        method: req.method,
        url: &req.url,
        headers: &req.headers,
        params: &req.params,
        body: &req.body,
        body_type: req.body_type,
    };
    let resolved = resolve_request(&template, &req.variables);
    let response = state.executor.execute(&resolved).await;

    success_response(StatusCode::OK, ExecutionResBody::new(response, &req.tests))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        definition::{Environment, NewEnvironment},
        serve::app,
        state::testutil::new_state,
        store::testutil::{history_entry, new_store_with_request},
    };
    use axum_test::TestServer;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use serde_json::{json, Value};

    async fn new_test_server() -> (TestServer, AppState, RequestDefinition) {
        let (store, _, request) = new_store_with_request().await;
        let state = AppState {
            store,
            ..new_state().await
        };
        (
            TestServer::new(app(state.clone())).unwrap(),
            state,
            request,
        )
    }

    async fn environment(state: &AppState, host: &str) -> Environment {
        state
            .store
            .create_environment(&NewEnvironment {
                name: "local".to_string(),
                variables: vec![KeyValue::new("host", host)],
            })
            .await
            .unwrap()
    }

    async fn with_tests(state: &AppState, request: &RequestDefinition, tests: Value) {
        let update: RequestUpdate = serde_json::from_value(json!({
            "name": request.name,
            "method": "GET",
            "url": request.url,
            "tests": tests,
        }))
        .unwrap();
        state
            .store
            .update_request(&request.id, &update)
            .await
            .unwrap();
    }

    mod crud {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn create_in_unknown_collection() {
            let (server, _, _) = new_test_server().await;

            let response = server
                .post("/api/requests")
                .json(&json!({ "collection_id": "nope", "name": "x" }))
                .await;

            assert_eq!(
                (
                    StatusCode::NOT_FOUND,
                    json!({ "reqroom_error": { "message": "collection \"nope\" is not found" } })
                ),
                (response.status_code(), response.json()),
            );
        }

        #[tokio::test]
        async fn create_applies_defaults() {
            let (server, _, request) = new_test_server().await;

            let response = server
                .post("/api/requests")
                .json(&json!({ "collection_id": request.collection_id }))
                .await;
            let body = response.json::<Value>();

            assert_eq!(
                (
                    StatusCode::CREATED,
                    json!("New Request"),
                    json!("GET"),
                    json!("json")
                ),
                (
                    response.status_code(),
                    body["name"].clone(),
                    body["method"].clone(),
                    body["body_type"].clone()
                )
            );
        }

        #[tokio::test]
        async fn update_and_delete() {
            let (server, state, request) = new_test_server().await;

            let updated = server
                .put(&format!("/api/requests/{}", request.id))
                .json(&json!({ "name": "renamed", "method": "DELETE", "url": "/x" }))
                .await
                .json::<Value>();
            assert_eq!(json!("DELETE"), updated["method"]);

            let deleted = server.delete(&format!("/api/requests/{}", request.id)).await;
            assert_eq!(StatusCode::OK, deleted.status_code());
            assert!(state.store.get_request(&request.id).await.is_err());
        }

        #[tokio::test]
        async fn rejects_invalid_method() {
            let (server, _, request) = new_test_server().await;

            let response = server
                .post("/api/requests")
                .json(&json!({ "collection_id": request.collection_id, "method": "TRACE" }))
                .await;

            assert_eq!(StatusCode::UNPROCESSABLE_ENTITY, response.status_code());
        }
    }

    mod history {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn append_and_list() {
            let (server, _, request) = new_test_server().await;

            let appended = server
                .post("/api/history")
                .json(&history_entry(&request.id, 201))
                .await
                .json::<Value>();
            assert_eq!(json!(true), appended["success"]);

            let listed = server
                .get(&format!("/api/requests/{}/history", request.id))
                .await
                .json::<Value>();

            assert_eq!(
                (appended["id"].clone(), json!(201)),
                (listed[0]["id"].clone(), listed[0]["status"].clone())
            );
        }

        #[tokio::test]
        async fn unknown_request() {
            let (server, _, _) = new_test_server().await;

            let response = server.get("/api/requests/ghost/history").await;

            assert_eq!(StatusCode::NOT_FOUND, response.status_code());
        }
    }

    mod execute {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn resolves_executes_evaluates_and_records() {
            let target = MockServer::start_async().await;
            let mock = target
                .mock_async(|when, then| {
                    when.method(GET).path("/users");
                    then.status(404).json_body(json!({ "error": "no users" }));
                })
                .await;
            let (server, state, request) = new_test_server().await;
            let env = environment(&state, &target.base_url()).await;
            with_tests(
                &state,
                &request,
                json!([
                    { "id": "s", "type": "status", "value": "404" },
                    { "id": "b", "type": "bodyContains", "value": "no users" },
                    { "id": "j", "type": "jsonPath", "field": "error.code", "value": "x" },
                ]),
            )
            .await;

            let response = server
                .post(&format!("/api/requests/{}/execute", request.id))
                .json(&json!({ "environment_id": env.id }))
                .await;
            let body = response.json::<Value>();

            mock.assert_async().await;
            assert_eq!(
                (
                    StatusCode::OK,
                    json!(404),
                    json!({ "passed": 2, "total": 3 }),
                    json!([true, true, false])
                ),
                (
                    response.status_code(),
                    body["response"]["status"].clone(),
                    body["summary"].clone(),
                    json!(body["test_results"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .map(|r| r["passed"].clone())
                        .collect::<Vec<_>>())
                )
            );

            let history = state.store.history(&request.id, 10).await.unwrap();
            assert_eq!(
                vec![(404, format!("{}/users", target.base_url()))],
                history
                    .into_iter()
                    .map(|h| (h.entry.status, h.entry.url))
                    .collect::<Vec<_>>()
            );
        }

        #[tokio::test]
        async fn unreachable_target_is_a_degraded_response() {
            let (server, state, request) = new_test_server().await;
            let env = environment(&state, "http://127.0.0.1:1").await;

            let response = server
                .post(&format!("/api/requests/{}/execute", request.id))
                .json(&json!({ "environment_id": env.id }))
                .await;
            let body = response.json::<Value>();

            assert_eq!(
                (StatusCode::OK, json!(0), json!("Error")),
                (
                    response.status_code(),
                    body["response"]["status"].clone(),
                    body["response"]["status_text"].clone()
                )
            );
            assert!(body["response"]["body"].is_string());
        }

        #[rstest]
        #[case(
            "request does not exist",
            "ghost",
            None,
            "request \"ghost\" is not found"
        )]
        #[case(
            "environment does not exist",
            "",
            Some("missing-env"),
            "environment \"missing-env\" is not found"
        )]
        #[tokio::test]
        async fn not_found(
            #[case] title: &str,
            #[case] request_id: &str,
            #[case] environment_id: Option<&str>,
            #[case] message: &str,
        ) {
            let (server, _, request) = new_test_server().await;
            let request_id = if request_id.is_empty() {
                request.id.as_str()
            } else {
                request_id
            };

            let response = server
                .post(&format!("/api/requests/{}/execute", request_id))
                .json(&json!({ "environment_id": environment_id }))
                .await;

            assert_eq!(
                (
                    StatusCode::NOT_FOUND,
                    json!({ "reqroom_error": { "message": message } })
                ),
                (response.status_code(), response.json()),
                "{}: response",
                title
            );
        }

        #[tokio::test]
        async fn malformed_body_is_rejected() {
            let target = MockServer::start_async().await;
            let mock = target
                .mock_async(|when, then| {
                    when.any_request();
                    then.status(200);
                })
                .await;
            let (server, state, request) = new_test_server().await;

            let response = server
                .post(&format!("/api/requests/{}/execute", request.id))
                .json(&json!({ "environment_id": 5 }))
                .await;

            assert_eq!(StatusCode::BAD_REQUEST, response.status_code());
            assert!(response.json::<Value>()["reqroom_error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("invalid execute body:"));
            mock.assert_hits_async(0).await;
            assert!(state.store.history(&request.id, 10).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn loosely_typed_tests_are_evaluated_individually() {
            let target = MockServer::start_async().await;
            target
                .mock_async(|when, then| {
                    when.method(GET).path("/ping");
                    then.status(200).json_body(json!({ "ok": true }));
                })
                .await;
            let (server, _, _) = new_test_server().await;

            let body = server
                .post("/api/execute")
                .json(&json!({
                    "url": format!("{}/ping", target.base_url()),
                    "tests": [
                        { "id": "ok", "type": "status", "value": "200" },
                        { "id": "num", "type": "status", "value": 200 },
                        { "id": "path", "type": "jsonPath", "value": "true" },
                    ],
                }))
                .await
                .json::<Value>();

            assert_eq!(
                (
                    json!({ "passed": 2, "total": 3 }),
                    json!("Error: jsonPath check needs a field")
                ),
                (body["summary"].clone(), body["test_results"][2]["message"].clone())
            );
        }

        #[tokio::test]
        async fn overlapping_execution_is_rejected() {
            let (server, state, request) = new_test_server().await;
            let _running = state.in_flight.begin(&request.id).unwrap();

            let response = server
                .post(&format!("/api/requests/{}/execute", request.id))
                .await;

            assert_eq!(
                (
                    StatusCode::CONFLICT,
                    json!({ "reqroom_error": { "message": format!("request \"{}\" is already executing", request.id) } })
                ),
                (response.status_code(), response.json()),
            );
            assert!(state.store.history(&request.id, 10).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn ad_hoc_execution_sends_raw_body_and_records_nothing() {
            let target = MockServer::start_async().await;
            let mock = target
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/items")
                        .query_param("dry_run", "1")
                        .body("{broken");
                    then.status(201).body("created");
                })
                .await;
            let (server, state, request) = new_test_server().await;

            let response = server
                .post("/api/execute")
                .json(&json!({
                    "method": "POST",
                    "url": "{{base}}/items",
                    "params": [{ "key": "dry_run", "value": "1" }],
                    "body": "{broken",
                    "body_type": "json",
                    "variables": [{ "key": "base", "value": target.base_url() }],
                    "tests": [{ "id": "t", "type": "status", "value": "201" }],
                }))
                .await;
            let body = response.json::<Value>();

            mock.assert_async().await;
            assert_eq!(
                (json!(201), json!("created"), json!({ "passed": 1, "total": 1 })),
                (
                    body["response"]["status"].clone(),
                    body["response"]["body"].clone(),
                    body["summary"].clone()
                )
            );
            assert!(state.store.history(&request.id, 10).await.unwrap().is_empty());
        }
    }
}
