use std::collections::BTreeMap;

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;

use crate::db::DbError;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    FailedValidation(BTreeMap<String, String>),
    NotFound,
    MethodNotAllowed(Method),
    EditConflict,
    RequestTimeout,
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, Value) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.into()),
            AppError::FailedValidation(errors) => (StatusCode::UNPROCESSABLE_ENTITY, json!(errors)),
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "the requested resource could not be found".into(),
            ),
            AppError::MethodNotAllowed(method) => (
                StatusCode::METHOD_NOT_ALLOWED,
                format!("the {method} method is not supported for this resource").into(),
            ),
            AppError::EditConflict => (
                StatusCode::CONFLICT,
                "unable to update the record due to an edit conflict, please try again".into(),
            ),
            AppError::RequestTimeout => (
                StatusCode::REQUEST_TIMEOUT,
                "the request took too long to complete".into(),
            ),
            AppError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "the server encountered a problem and could not process the request".into(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::RecordNotFound => AppError::NotFound,
            DbError::EditConflict => AppError::EditConflict,
            other => AppError::Internal(other.to_string()),
        }
    }
}
