use std::collections::HashMap;

use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request};
use axum::http::request::Parts;
use axum::Json;
use serde::de::DeserializeOwned;

use crate::error::AppError;
use crate::validator::Validator;

/// JSON request body whose rejections render as a JSON 400.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(AppError::BadRequest(rejection.body_text())),
        }
    }
}

/// Positive integer `{id}` path segment. Anything else is a 404.
pub struct IdParam(pub i64);

impl<S> FromRequestParts<S> for IdParam
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|_| AppError::NotFound)?;

        match raw.parse::<i64>() {
            Ok(id) if id > 0 => Ok(IdParam(id)),
            _ => Err(AppError::NotFound),
        }
    }
}

pub struct QueryParams(pub HashMap<String, String>);

impl<S> FromRequestParts<S> for QueryParams
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(params) = Query::<HashMap<String, String>>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
        Ok(QueryParams(params))
    }
}

impl QueryParams {
    pub fn read_string(&self, key: &str, default: &str) -> String {
        match self.0.get(key) {
            Some(value) if !value.is_empty() => value.clone(),
            _ => default.to_string(),
        }
    }

    /// Integer parameter; a value that does not parse is recorded in `v`.
    pub fn read_int(&self, key: &str, default: i64, v: &mut Validator) -> i64 {
        match self.0.get(key).filter(|value| !value.is_empty()) {
            None => default,
            Some(value) => value.parse().unwrap_or_else(|_| {
                v.add_error(key, "must be an integer value");
                default
            }),
        }
    }

    pub fn read_bool(&self, key: &str, v: &mut Validator) -> Option<bool> {
        let value = self.0.get(key).filter(|value| !value.is_empty())?;
        match value.as_str() {
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
            "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
            _ => {
                v.add_error(key, "must be a boolean value");
                None
            }
        }
    }
}
