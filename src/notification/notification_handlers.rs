use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::{
    notification_dto::{HealthResponse, ListNotificationsQuery},
    notification_models::{NewNotification, Notification},
};
use crate::{error::Result, state::AppState};

/// Service liveness and open sync sessions
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.sessions.session_count(),
    })
}

/// Create a notification for a user
#[utoipa::path(
    post,
    path = "/api/notifications",
    request_body = NewNotification,
    responses(
        (status = 201, description = "Notification created", body = Notification),
        (status = 400, description = "Missing or empty required field")
    ),
    tag = "notifications"
)]
pub async fn create_notification(
    State(state): State<AppState>,
    Json(payload): Json<NewNotification>,
) -> Result<(StatusCode, Json<Notification>)> {
    // Backends validate required fields and reject with `AppError::Validation`.
    let notification = state.backend.insert(payload).await?;
    tracing::info!("Created notification {} for user {}", notification.id, notification.user_id);

    Ok((StatusCode::CREATED, Json(notification)))
}

/// Most recent notifications of a user, newest first
#[utoipa::path(
    get,
    path = "/api/users/{user_id}/notifications",
    params(
        ("user_id" = Uuid, Path, description = "Owner of the notifications"),
        ListNotificationsQuery
    ),
    responses(
        (status = 200, description = "List of notifications", body = Vec<Notification>)
    ),
    tag = "notifications"
)]
pub async fn list_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<ListNotificationsQuery>,
) -> Result<Json<Vec<Notification>>> {
    let limit = query
        .limit
        .unwrap_or(state.config.fetch_limit)
        .min(state.config.fetch_limit);

    let notifications = state.backend.fetch_recent(user_id, limit).await?;

    Ok(Json(notifications))
}
