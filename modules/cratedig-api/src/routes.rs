//! HTTP handlers for the polling API.
//!
//! Success bodies are JSON; failures are plain-text with a status drawn from
//! the error taxonomy, and clients retry `get_status` on a fixed interval
//! until it reports stage 3.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use tracing::warn;

use cratedig_common::CrateDigError;
use cratedig_crawler::progress;
use cratedig_graph::recommend;

use crate::AppState;

#[derive(Deserialize)]
pub struct UserQuery {
    username: String,
}

#[derive(Deserialize)]
pub struct RecommendationQuery {
    username: String,
    similar_boost: Option<f64>,
}

fn error_response(err: CrateDigError) -> Response {
    let status = match &err {
        CrateDigError::UnknownUser(_)
        | CrateDigError::CollectionTooSmall(_)
        | CrateDigError::NoActiveJob(_)
        | CrateDigError::Gone(_) => StatusCode::NOT_FOUND,
        CrateDigError::TransientFetch(_) => StatusCode::SERVICE_UNAVAILABLE,
        CrateDigError::PageFormat(_) => StatusCode::BAD_GATEWAY,
        CrateDigError::Database(_) | CrateDigError::Serialization(_) => {
            warn!(error = %err, "Internal error");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
                .into_response();
        }
    };
    (status, err.to_string()).into_response()
}

/// Resolve the user, refresh their own collection if needed, and start (or
/// attach to) the background crawl job. Idempotent: a fresh, fully-crawled
/// user gets an ack without any new work being enqueued.
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserQuery>,
) -> Response {
    match state.orchestrator.prepare_user(&params.username).await {
        Ok(fan_id) => {
            state
                .registry
                .start_or_attach(state.orchestrator.clone(), fan_id)
                .await;
            (StatusCode::OK, "User fetched successfully").into_response()
        }
        Err(err) => error_response(err),
    }
}

/// Poll the crawl's progress. Stage 3 means the caller should switch to
/// `get_recommendations`.
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserQuery>,
) -> Response {
    let cutoff = state.config.stale_cutoff();
    match progress::status_for(state.orchestrator.store(), &params.username, cutoff).await {
        Ok(target) => Json(target).into_response(),
        Err(err) => error_response(err),
    }
}

/// Scored recommendations for a fully-crawled user.
pub async fn get_recommendations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecommendationQuery>,
) -> Response {
    let boost = params
        .similar_boost
        .unwrap_or(recommend::DEFAULT_BOOST)
        .clamp(recommend::MIN_BOOST, recommend::MAX_BOOST);
    match recommend::recommendations_for(state.orchestrator.store(), &params.username, boost).await
    {
        Ok(recommendations) => Json(recommendations).into_response(),
        Err(err) => error_response(err),
    }
}
