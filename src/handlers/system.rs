use axum::extract::State;
use axum::http::Method;
use axum::Json;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::AppState;

pub async fn healthcheck(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "available",
        "system_info": {
            "environment": state.env.as_str(),
            "version": env!("CARGO_PKG_VERSION"),
        },
    }))
}

pub async fn not_found() -> AppError {
    AppError::NotFound
}

pub async fn method_not_allowed(method: Method) -> AppError {
    AppError::MethodNotAllowed(method)
}
