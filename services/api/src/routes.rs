use crate::infra::AppState;
use affiliation_sync::error::AppError;
use affiliation_sync::platform::{GroupId, UserId};
use affiliation_sync::verification::{
    BulkEnqueueSummary, EnqueueOutcome, ResolutionOutcome, SchedulerInfo,
};
use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub(crate) struct UserRequest {
    pub(crate) user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GroupRequest {
    pub(crate) group_id: GroupId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AliasRequest {
    pub(crate) alias: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct QueueStatus {
    pub(crate) size: usize,
    pub(crate) draining: bool,
    pub(crate) estimated_completion_secs: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct EnqueueResponse {
    pub(crate) added: bool,
    pub(crate) outcome: EnqueueOutcome,
    pub(crate) queue_size: usize,
}

pub(crate) fn router() -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/queue", get(queue_status).delete(clear_queue))
        .route("/api/v1/queue/users", post(enqueue_user))
        .route("/api/v1/queue/groups", post(enqueue_group))
        .route("/api/v1/exceptions", get(list_exceptions).post(add_exception))
        .route(
            "/api/v1/exceptions/:user_id",
            axum::routing::delete(remove_exception),
        )
        .route("/api/v1/aliases", get(list_aliases))
        .route(
            "/api/v1/aliases/:user_id",
            get(get_alias).put(set_alias).delete(remove_alias),
        )
        .route("/api/v1/settlements", get(list_settlements))
        .route("/api/v1/settlements/unmapped", get(unmapped_settlements))
        .route(
            "/api/v1/settlements/:name",
            put(map_settlement).delete(unmap_settlement),
        )
        .route("/api/v1/bulk-enqueue", post(bulk_enqueue))
        .route("/api/v1/scheduler", get(scheduler_info))
        .route("/api/v1/lookup/:user_id", get(lookup_user))
        .route("/api/v1/events/member-join", post(member_join))
}

pub(crate) async fn healthcheck() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn queue_status(Extension(state): Extension<AppState>) -> Json<QueueStatus> {
    let info = state.scheduler.info();
    Json(QueueStatus {
        size: info.queue_size,
        draining: info.draining,
        estimated_completion_secs: info.estimated_completion_secs,
    })
}

async fn clear_queue(Extension(state): Extension<AppState>) -> Json<Value> {
    let removed = state.scheduler.context().queue.clear();
    Json(json!({ "removed": removed }))
}

async fn enqueue_user(
    Extension(state): Extension<AppState>,
    Json(request): Json<UserRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    let outcome = state.scheduler.enqueue_user(request.user_id);
    if outcome == EnqueueOutcome::Excepted {
        return Err(AppError::Validation(format!(
            "user {} is on the exception list",
            request.user_id
        )));
    }
    Ok(Json(EnqueueResponse {
        added: outcome == EnqueueOutcome::Added,
        outcome,
        queue_size: state.scheduler.context().queue.size(),
    }))
}

async fn enqueue_group(
    Extension(state): Extension<AppState>,
    Json(request): Json<GroupRequest>,
) -> Result<Json<BulkEnqueueSummary>, AppError> {
    let summary = state.scheduler.enqueue_group(request.group_id).await?;
    Ok(Json(summary))
}

async fn list_exceptions(
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<UserId>>, AppError> {
    Ok(Json(state.scheduler.context().exceptions.list()?))
}

async fn add_exception(
    Extension(state): Extension<AppState>,
    Json(request): Json<UserRequest>,
) -> Result<Json<Value>, AppError> {
    let added = state.scheduler.context().exceptions.add(request.user_id)?;
    Ok(Json(json!({ "added": added })))
}

async fn remove_exception(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<Value>, AppError> {
    let removed = state.scheduler.context().exceptions.remove(UserId(user_id))?;
    if !removed {
        return Err(AppError::NotFound(format!("exception for user {user_id}")));
    }
    Ok(Json(json!({ "removed": true })))
}

async fn list_aliases(
    Extension(state): Extension<AppState>,
) -> Result<Json<BTreeMap<UserId, String>>, AppError> {
    Ok(Json(state.scheduler.context().aliases.list()?))
}

async fn get_alias(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<Value>, AppError> {
    let alias = state
        .scheduler
        .context()
        .aliases
        .get(UserId(user_id))?
        .ok_or_else(|| AppError::NotFound(format!("alias for user {user_id}")))?;
    Ok(Json(json!({ "user_id": user_id, "alias": alias })))
}

async fn set_alias(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<u64>,
    Json(request): Json<AliasRequest>,
) -> Result<Json<Value>, AppError> {
    state
        .scheduler
        .context()
        .aliases
        .set(UserId(user_id), &request.alias)?;
    Ok(Json(json!({ "user_id": user_id, "alias": request.alias })))
}

async fn remove_alias(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<Value>, AppError> {
    let removed = state.scheduler.context().aliases.remove(UserId(user_id))?;
    if !removed {
        return Err(AppError::NotFound(format!("alias for user {user_id}")));
    }
    Ok(Json(json!({ "removed": true })))
}

async fn list_settlements(
    Extension(state): Extension<AppState>,
) -> Result<Json<BTreeMap<String, GroupId>>, AppError> {
    Ok(Json(state.scheduler.context().settlements.list()?))
}

async fn unmapped_settlements(
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.scheduler.context().unmapped_settlements().await?))
}

async fn map_settlement(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
    Json(request): Json<GroupRequest>,
) -> Result<Json<Value>, AppError> {
    state
        .scheduler
        .context()
        .settlements
        .set(&name, request.group_id)?;
    Ok(Json(json!({ "settlement": name, "group_id": request.group_id })))
}

async fn unmap_settlement(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let removed = state.scheduler.context().settlements.remove(&name)?;
    if !removed {
        return Err(AppError::NotFound(format!("mapping for settlement {name}")));
    }
    Ok(Json(json!({ "removed": true })))
}

async fn bulk_enqueue(Extension(state): Extension<AppState>) -> Json<BulkEnqueueSummary> {
    Json(state.scheduler.bulk_enqueue().await)
}

async fn scheduler_info(Extension(state): Extension<AppState>) -> Json<SchedulerInfo> {
    Json(state.scheduler.info())
}

async fn lookup_user(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<u64>,
) -> Json<ResolutionOutcome> {
    Json(
        state
            .scheduler
            .context()
            .resolver
            .resolve(UserId(user_id))
            .await,
    )
}

async fn member_join(
    Extension(state): Extension<AppState>,
    Json(request): Json<UserRequest>,
) -> Json<Value> {
    let outcome = state.scheduler.on_member_join(request.user_id).await;
    Json(json!({ "enqueued": outcome == Some(EnqueueOutcome::Added), "outcome": outcome }))
}
