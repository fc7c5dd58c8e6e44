//! Notification outbox for the email / in-app delivery channels

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::admin::ListQuery;
use crate::app::AppState;
use crate::error::ServiceError;
use crate::models::Notification;

/// Handler for GET /api/notifications/pending
pub async fn list_pending(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Notification>>, ServiceError> {
    let limit = query.limit.clamp(1, 1000);
    Ok(Json(state.store.pending_notifications(limit).await?))
}

/// Handler for GET /api/users/{user_id}/notifications
pub async fn list_for_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<Notification>>, ServiceError> {
    Ok(Json(state.store.notifications_for_user(user_id).await?))
}

/// Handler for POST /api/notifications/{notification_id}/delivered
pub async fn mark_delivered(
    State(state): State<Arc<AppState>>,
    Path(notification_id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    if state.store.mark_notification_delivered(notification_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServiceError::not_found("pending notification", notification_id))
    }
}
