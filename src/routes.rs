use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::config::PublicAppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{Itinerary, JobStatusReport, MapData};
use crate::payload::{parse_itinerary, to_snapshot};
use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/map-status", get(map_status))
        .route("/api/retry-geocoding", post(retry_geocoding))
        .route("/api/trips/:link/geocode", post(submit_trip))
        .route("/api/trips/:link/map-data", get(map_data))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    version: &'static str,
    queue_depth: usize,
    config: PublicAppConfig,
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queue_depth: state.queue.depth(),
        config: state.config.public_profile(),
    })
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    link: Option<String>,
}

async fn map_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> AppResult<Json<JobStatusReport>> {
    let link = query
        .link
        .filter(|link| !link.trim().is_empty())
        .ok_or_else(|| AppError::InvalidRequest("missing 'link' parameter".into()))?;
    Ok(Json(status_report(&state, &link)?))
}

async fn submit_trip(
    State(state): State<AppState>,
    Path(link): Path<String>,
    Json(body): Json<Value>,
) -> AppResult<(StatusCode, Json<JobStatusReport>)> {
    let itinerary = parse_itinerary(&body).map_err(|err| match err {
        AppError::Json(err) => AppError::Payload(err.to_string()),
        other => other,
    })?;
    state
        .store
        .save_trip(&link, &itinerary.title, &to_snapshot(&itinerary)?)?;
    queue_trip(&state, &link, itinerary, "submitted")?;
    Ok((StatusCode::ACCEPTED, Json(status_report(&state, &link)?)))
}

#[derive(Debug, Deserialize)]
struct RetryRequest {
    link: String,
}

async fn retry_geocoding(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> AppResult<(StatusCode, Json<JobStatusReport>)> {
    let link = request.link;
    if link.trim().is_empty() {
        return Err(AppError::InvalidRequest("missing 'link' parameter".into()));
    }
    if state.store.job_status(&link)?.is_none() {
        return Err(AppError::NotFound(link));
    }
    let snapshot = state.store.snapshot(&link)?.ok_or_else(|| {
        AppError::InvalidRequest(format!("trip {link} has no stored itinerary to geocode"))
    })?;
    let itinerary = parse_itinerary(&snapshot)?;
    queue_trip(&state, &link, itinerary, "retry")?;
    Ok((StatusCode::ACCEPTED, Json(status_report(&state, &link)?)))
}

async fn map_data(
    State(state): State<AppState>,
    Path(link): Path<String>,
) -> AppResult<Json<MapData>> {
    state
        .store
        .map_data(&link)?
        .map(Json)
        .ok_or(AppError::NotFound(link))
}

fn queue_trip(state: &AppState, link: &str, itinerary: Itinerary, reason: &str) -> AppResult<()> {
    let items = itinerary.items.len();
    let seq = state.queue.submit(state.store.as_ref(), link, itinerary)?;
    info!(trip = %link, seq, items, reason, "geocoding requested");
    state
        .journal
        .note("job_queued", link, json!({ "seq": seq, "items": items, "reason": reason }));
    Ok(())
}

fn status_report(state: &AppState, link: &str) -> AppResult<JobStatusReport> {
    let job = state
        .store
        .job_status(link)?
        .ok_or_else(|| AppError::NotFound(link.to_string()))?;
    Ok(JobStatusReport {
        link: link.to_string(),
        status: job.status,
        error: job.error,
        queue_depth: state.queue.depth(),
    })
}
