//! Provider webhook endpoint
//!
//! `POST /api/webhooks/{provider}` where provider is coingate, stripe or yookassa.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::app::AppState;
use crate::error::{ErrorResponse, ServiceError};
use crate::models::Provider;

/// Webhook status policy: 400 for a missing signature or a processing
/// failure, 401 for a bad signature, 500 only for unexpected errors
fn webhook_status(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::Signature(_) => error.status_code(),
        ServiceError::NotFound { .. }
        | ServiceError::Validation(_)
        | ServiceError::IllegalPayoutTransition { .. } => StatusCode::BAD_REQUEST,
        ServiceError::Provider(_) | ServiceError::Repo(_) | ServiceError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Handler for POST /api/webhooks/{provider}
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(provider) = Provider::from_str(&provider) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "unknown_provider",
                format!("Unknown webhook provider: {}", provider),
            )),
        )
            .into_response();
    };

    match state.webhooks.handle(provider, &headers, &body).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(e) => {
            let status = webhook_status(&e);
            e.into_response_with(status)
        }
    }
}
