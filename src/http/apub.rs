//! The ActivityPub endpoints: webfinger, actor documents, statuses,
//! collection summaries and the inboxes.

use crate::error::AppError;
use crate::http::{ApubJson, AppState};
use crate::inbox::HandlerOutcome;
use crate::protocol::ActivityEnvelope;
use crate::signatures::{verify_body_digest, SigCheckOutcome};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

#[derive(Deserialize)]
pub struct WebfingerQuery {
    resource: String,
}

fn resource_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^acct:([^@]+)@([^@]+)$").expect("static regex"))
}

pub async fn get_webfinger(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebfingerQuery>,
) -> Result<Response, AppError> {
    let _obs = state.metrics.start_apub_request_in("webfinger");
    info!(resource = %query.resource, "handling webfinger GET");

    let Some(caps) = resource_regex().captures(&query.resource) else {
        return Err(AppError::BadRequest(
            "Missing or invalid 'resource' param".to_owned(),
        ));
    };
    let user = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

    let resp = state
        .udir
        .get_webfinger(user)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(resp).into_response())
}

fn accepts_json(headers: &HeaderMap) -> bool {
    let accept = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    ["application/json", "application/activity+json", "application/ld+json"]
        .iter()
        .any(|kind| accept.contains(kind))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let _obs = state.metrics.start_apub_request_in("user");
    info!(%user, "handling user GET");

    if !accepts_json(&headers) {
        // a human with a browser; show them the profile page instead
        return Ok(Redirect::to(&state.idb.user_profile(&user)).into_response());
    }
    let doc = state
        .udir
        .get_user_info(&user)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(ApubJson(doc).into_response())
}

pub async fn get_user_status(
    State(state): State<Arc<AppState>>,
    Path((user, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let _obs = state.metrics.start_apub_request_in("user/status");

    if !accepts_json(&headers) {
        return Ok(Redirect::to(&state.idb.user_profile(&user)).into_response());
    }
    let note = state
        .udir
        .get_user_status(&user, &id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(ApubJson(note).into_response())
}

pub async fn get_user_outbox(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Response, AppError> {
    let _obs = state.metrics.start_apub_request_in("user/outbox");
    let summary = state
        .udir
        .get_outbox_summary(&user)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(ApubJson(summary).into_response())
}

pub async fn get_user_followers(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Response, AppError> {
    let _obs = state.metrics.start_apub_request_in("user/followers");
    let summary = state
        .udir
        .get_followers_summary(&user)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(ApubJson(summary).into_response())
}

pub async fn get_user_following(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Response, AppError> {
    let _obs = state.metrics.start_apub_request_in("user/following");
    let summary = state
        .udir
        .get_following_summary(&user)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(ApubJson(summary).into_response())
}

pub async fn post_user_inbox(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    post_inbox(state, Some(user), method, uri, headers, body).await
}

pub async fn post_shared_inbox(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    post_inbox(state, None, method, uri, headers, body).await
}

async fn post_inbox(
    state: Arc<AppState>,
    user: Option<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let label = if user.is_none() { "inbox" } else { "user/inbox" };
    let _obs = state.metrics.start_apub_request_in(label);
    info!(?user, "handling inbox POST");

    if body.is_empty() {
        return Err(AppError::BadRequest(
            "Request body must not be empty".to_owned(),
        ));
    }
    debug!(body = %String::from_utf8_lossy(&body), "inbox request body");

    // first a rudimentary parse, to know the type and the actor
    let envelope: ActivityEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            info!(%err, "invalid JSON in request body");
            return Err(AppError::BadRequest(
                "Request body is not valid JSON".to_owned(),
            ));
        }
    };

    // signature check: body digest, then the signature itself, with the
    // signing key bound to the claimed actor
    let sig_problem = match verify_body_digest(headers.get("digest"), &body) {
        Err(problem) => Some(problem),
        Ok(()) => {
            match state
                .sig_checker
                .check(&envelope.actor, &method, &uri, &headers)
                .await?
            {
                SigCheckOutcome::Problem(problem) => Some(problem),
                SigCheckOutcome::Verified(sender) => {
                    if sender.id != envelope.actor {
                        warn!(signer = %sender.id, actor = %envelope.actor, "signer does not match actor");
                        return Err(AppError::Unauthorized(
                            "Signer does not match actor".to_owned(),
                        ));
                    }
                    return process_activity(&state, user, &envelope, &sender, &body).await;
                }
            }
        }
    };

    let problem = sig_problem.unwrap_or_default();
    if envelope.kind == "Delete" {
        // the departed user's key is usually gone along with them; nothing
        // we could verify, nothing we need to do
        info!("ignoring Delete request with unverified actor signature");
        return Ok(ok_response());
    }
    warn!(%problem, "incorrectly signed inbox POST request");
    Err(AppError::Unauthorized(format!(
        "Invalid HTTP signature: {}",
        problem
    )))
}

async fn process_activity(
    state: &Arc<AppState>,
    user: Option<String>,
    envelope: &ActivityEnvelope,
    sender: &crate::protocol::ActorDoc,
    body: &[u8],
) -> Result<Response, AppError> {
    let receiving_user = user.as_deref().unwrap_or_default();

    let outcome = match envelope.kind.as_str() {
        "Follow" => {
            state
                .inbox
                .handle_follow(receiving_user, sender, body)
                .await?
        }
        "Undo" => state.inbox.handle_undo(receiving_user, body).await?,
        "Create" if envelope.object_kind() == Some("Note") => {
            state.inbox.handle_create_note(envelope, sender, body).await?
        }
        _ => HandlerOutcome::Handled,
    };

    match outcome {
        HandlerOutcome::Handled => Ok(ok_response()),
        HandlerOutcome::Problem(problem) => {
            info!(kind = %envelope.kind, %problem, "invalid request");
            Err(AppError::BadRequest(format!("Bad request: {}", problem)))
        }
    }
}

fn ok_response() -> Response {
    Json("OK").into_response()
}
