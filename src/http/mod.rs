//! HTTP surface: the ActivityPub endpoints, the management API and the
//! metrics endpoint.

pub mod api;
pub mod apub;

use crate::config::Config;
use crate::db::Repo;
use crate::directory::UserDirectory;
use crate::error::AppError;
use crate::feeds::FeedFollower;
use crate::ids::IdBuilder;
use crate::inbox::Inbox;
use crate::metrics::Metrics;
use crate::signatures::SigChecker;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

/// Everything the handlers need.
pub struct AppState {
    pub cfg: Arc<Config>,
    pub idb: IdBuilder,
    pub repo: Arc<Repo>,
    pub metrics: Arc<Metrics>,
    pub sig_checker: Arc<SigChecker>,
    pub inbox: Arc<Inbox>,
    pub udir: Arc<UserDirectory>,
    pub feed_follower: Arc<FeedFollower>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/.well-known/webfinger", get(apub::get_webfinger))
        .route("/u/{user}", get(apub::get_user))
        .route("/u/{user}/outbox", get(apub::get_user_outbox))
        .route("/u/{user}/followers", get(apub::get_user_followers))
        .route("/u/{user}/following", get(apub::get_user_following))
        .route("/u/{user}/status/{id}", get(apub::get_user_status))
        .route("/u/{user}/inbox", post(apub::post_user_inbox))
        .route("/inbox", post(apub::post_shared_inbox))
        .route("/api/feeds", post(api::post_feeds))
        .route("/api/accounts/{handle}", delete(api::delete_account))
        .route("/api/actions/vacuum", post(api::post_vacuum))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.as_str()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.as_str()),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not Found"),
            _ => {
                tracing::error!(err = %self, "internal error serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };
        error_response(status, msg)
    }
}

/// The JSON error body all endpoints use.
pub(crate) fn error_response(status: StatusCode, msg: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"error": msg, "status": status.as_u16()})),
    )
        .into_response()
}

/// Wrapper to respond with `application/activity+json`.
pub struct ApubJson<T: Serialize>(pub T);

impl<T: Serialize> IntoResponse for ApubJson<T> {
    fn into_response(self) -> Response {
        let mut response = Json(self.0).into_response();
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            crate::APUB_JSON_CONTENT_TYPE
                .parse()
                .expect("static content type"),
        );
        response
    }
}

/// `GET /metrics`, guarded by bearer auth.
pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let expected = &state.cfg.secrets.metrics_auth;
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if expected.is_empty() || presented != format!("Bearer {}", expected) {
        return Err(AppError::Unauthorized(
            "Missing or invalid metrics credentials".to_owned(),
        ));
    }
    Ok(state.metrics.render().into_response())
}
