pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod filters;
pub mod handlers;
pub mod models;
pub mod validator;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use db::DbPool;
use error::AppError;

const MAX_BODY_BYTES: usize = 1_048_576;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub env: Arc<String>,
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    AppError::Internal(format!("handler panicked: {detail}")).into_response()
}

/// Answers 408 with the usual error body when the inner service runs past `limit`.
async fn request_timeout(State(limit): State<Duration>, req: Request, next: Next) -> Response {
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(response) => response,
        Err(_) => AppError::RequestTimeout.into_response(),
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthcheck", get(handlers::system::healthcheck))
        .route(
            "/v1/todo",
            get(handlers::api::list_all_todos).post(handlers::api::create_new_todo),
        )
        .route(
            "/v1/todo/{id}",
            get(handlers::api::get_single_todo)
                .patch(handlers::api::update_existing_todo)
                .delete(handlers::api::delete_existing_todo),
        )
        .fallback(handlers::system::not_found)
        .method_not_allowed_fallback(handlers::system::method_not_allowed)
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::catch_panic::CatchPanicLayer::custom(handle_panic))
                .layer(middleware::from_fn_with_state(REQUEST_TIMEOUT, request_timeout))
                .layer(tower_http::compression::CompressionLayer::new())
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}
