use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::{response::IntoResponse, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::db::{create_todo, delete_todo, get_todo, list_todos, update_todo};
use crate::error::AppError;
use crate::extract::{IdParam, JsonBody, QueryParams};
use crate::filters::{validate_filters, Filters};
use crate::models::{validate_todo, CreateTodo, Todo, UpdateTodo};
use crate::validator::Validator;
use crate::AppState;

const SORT_SAFELIST: &[&str] = &[
    "id",
    "title",
    "description",
    "status",
    "-id",
    "-title",
    "-description",
    "-status",
];

const EXPECTED_VERSION: &str = "x-expected-version";

fn validated(todo: &Todo) -> Result<(), AppError> {
    let mut v = Validator::new();
    validate_todo(&mut v, todo);
    if !v.valid() {
        return Err(AppError::FailedValidation(v.into_errors()));
    }
    Ok(())
}

fn expected_version(headers: &HeaderMap) -> Result<Option<i64>, AppError> {
    let Some(value) = headers.get(EXPECTED_VERSION) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| AppError::BadRequest("X-Expected-Version must be an integer".to_string()))
}

pub async fn list_all_todos(
    State(state): State<AppState>,
    qs: QueryParams,
) -> Result<Json<Value>, AppError> {
    let mut v = Validator::new();

    let title = qs.read_string("title", "");
    let description = qs.read_string("description", "");
    let status = qs.read_bool("status", &mut v);
    let filters = Filters {
        page: qs.read_int("page", 1, &mut v),
        page_size: qs.read_int("page_size", 20, &mut v),
        sort: qs.read_string("sort", "id"),
        sort_safelist: SORT_SAFELIST,
    };

    validate_filters(&mut v, &filters);
    if !v.valid() {
        return Err(AppError::FailedValidation(v.into_errors()));
    }

    let (todos, metadata) = list_todos(&state.db, &title, &description, status, &filters).await?;
    info!(
        count = todos.len(),
        total = metadata.total_records,
        "Listed todos"
    );
    Ok(Json(json!({ "todos": todos, "metadata": metadata })))
}

pub async fn create_new_todo(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CreateTodo>,
) -> Result<impl IntoResponse, AppError> {
    let todo = Todo::from(req);
    validated(&todo)?;

    let todo = create_todo(&state.db, todo).await?;
    info!(id = todo.id, title = %todo.title, "Created todo");

    let location = format!("/v1/todo/{}", todo.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(json!({ "todo": todo })),
    ))
}

pub async fn get_single_todo(
    State(state): State<AppState>,
    IdParam(id): IdParam,
) -> Result<Json<Value>, AppError> {
    let todo = get_todo(&state.db, id).await?;
    Ok(Json(json!({ "todo": todo })))
}

/// PATCH: fields missing from the body keep their stored values.
pub async fn update_existing_todo(
    State(state): State<AppState>,
    IdParam(id): IdParam,
    headers: HeaderMap,
    JsonBody(req): JsonBody<UpdateTodo>,
) -> Result<Json<Value>, AppError> {
    let mut todo = get_todo(&state.db, id).await?;

    if let Some(expected) = expected_version(&headers)? {
        if expected != todo.version {
            return Err(AppError::EditConflict);
        }
    }

    todo.apply(req);
    validated(&todo)?;

    let todo = update_todo(&state.db, todo).await?;
    info!(id = todo.id, version = todo.version, status = todo.status, "Updated todo");
    Ok(Json(json!({ "todo": todo })))
}

pub async fn delete_existing_todo(
    State(state): State<AppState>,
    IdParam(id): IdParam,
) -> Result<Json<Value>, AppError> {
    delete_todo(&state.db, id).await?;
    info!(id, "Deleted todo");
    Ok(Json(json!({ "message": "todo successfully deleted" })))
}
