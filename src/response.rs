use axum::{http::StatusCode, Json};
use serde::Serialize;

use crate::{executor::ExecuteError, store::StoreError};

#[derive(Serialize)]
pub struct ReqroomError {
    message: String,
}

#[derive(Serialize)]
pub struct ErrorResBody {
    pub reqroom_error: ReqroomError,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum WithError<T: Serialize> {
    Success(T),
    Error(ErrorResBody),
}

pub type ApiResponse<T> = (StatusCode, Json<WithError<T>>);

pub fn success_response<T: Serialize>(status_code: StatusCode, body: T) -> ApiResponse<T> {
    (status_code, Json(WithError::Success(body)))
}

pub fn error_response<T: Serialize>(status_code: StatusCode, message: impl ToString) -> ApiResponse<T> {
    (
        status_code,
        Json(WithError::Error(ErrorResBody {
            reqroom_error: ReqroomError {
                message: message.to_string(),
            },
        })),
    )
}

pub fn store_error_response<T: Serialize>(err: StoreError) -> ApiResponse<T> {
    match err {
        StoreError::NotFound { .. } => error_response(StatusCode::NOT_FOUND, err),
        StoreError::Internal(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

pub fn execute_error_response<T: Serialize>(err: ExecuteError) -> ApiResponse<T> {
    match err {
        ExecuteError::AlreadyRunning(_) => error_response(StatusCode::CONFLICT, err),
    }
}

/// Maps a store result to `200 OK` or the matching error response.
pub fn from_store<T: Serialize>(result: Result<T, StoreError>) -> ApiResponse<T> {
    match result {
        Ok(body) => success_response(StatusCode::OK, body),
        Err(err) => store_error_response(err),
    }
}
