//! Management API. Every route requires an `X-API-KEY` header matching one
//! of the configured keys.

use crate::error::AppError;
use crate::feeds::FeedStatus;
use crate::http::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Deserialize)]
pub struct FeedRequest {
    pub site_url: String,
}

#[derive(Serialize)]
pub struct FeedResponse {
    pub handle: String,
    pub user_url: String,
    pub status: &'static str,
}

fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let found = !presented.is_empty()
        && state
            .cfg
            .secrets
            .api_keys
            .iter()
            .any(|key| key == presented);
    if !found {
        let key_part: String = presented.chars().take(4).collect();
        warn!(%key_part, "API request with missing or invalid key");
        return Err(AppError::Unauthorized(
            "Missing or invalid API key".to_owned(),
        ));
    }
    Ok(())
}

fn status_label(status: FeedStatus) -> &'static str {
    match status {
        FeedStatus::New => "new",
        FeedStatus::AlreadyFollowed => "existing",
        FeedStatus::Error => "error",
        FeedStatus::Mastodon => "mastodon",
        FeedStatus::Banned => "banned",
        FeedStatus::OptOut => "optout",
    }
}

/// Creates (or reports) the parrot account behind a site URL.
pub async fn post_feeds(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FeedRequest>,
) -> Result<Response, AppError> {
    check_api_key(&state, &headers)?;
    let _obs = state.metrics.start_web_request_in("api/feeds");
    info!(site_url = %req.site_url, "POST /api/feeds");

    let (acct, status) = state.feed_follower.get_account_for_feed(&req.site_url).await?;
    match acct {
        Some(acct) => Ok(Json(FeedResponse {
            handle: acct.handle,
            user_url: acct.user_url,
            status: status_label(status),
        })
        .into_response()),
        None => Err(AppError::BadRequest(format!(
            "could not follow feed: {}",
            status_label(status)
        ))),
    }
}

pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_api_key(&state, &headers)?;
    let _obs = state.metrics.start_web_request_in("api/accounts");
    info!(%handle, "DELETE /api/accounts");

    let acct = state
        .repo
        .get_account(&handle)
        .await?
        .ok_or(AppError::NotFound)?;
    state.repo.brute_delete_account(acct.id).await?;
    Ok(Json("OK").into_response())
}

pub async fn post_vacuum(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_api_key(&state, &headers)?;
    let _obs = state.metrics.start_web_request_in("api/vacuum");
    info!("POST /api/actions/vacuum");

    state.repo.vacuum().await?;
    Ok(Json("OK").into_response())
}
