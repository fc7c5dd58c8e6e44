use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::PayoutStatus;
use crate::providers::ProviderError;
use crate::repos::RepoError;
use crate::webhooks::signature::SignatureError;

/// JSON error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// Service-level error taxonomy.
///
/// Business-rule rejections (below minimum, duplicate payout, insufficient
/// balance) are not errors; services return them as outcome enums.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Webhook signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Illegal payout transition {from} -> {to} for payout {payout_id}")]
    IllegalPayoutTransition {
        payout_id: Uuid,
        from: PayoutStatus,
        to: PayoutStatus,
    },

    #[error("Payout provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Storage error: {0}")]
    Repo(#[from] RepoError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ServiceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Signature(SignatureError::MissingHeader(_)) => StatusCode::BAD_REQUEST,
            ServiceError::Signature(_) => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::IllegalPayoutTransition { .. } => StatusCode::CONFLICT,
            ServiceError::Provider(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Repo(_) | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ServiceError::Signature(_) => "signature_error",
            ServiceError::NotFound { .. } => "not_found",
            ServiceError::Validation(_) => "validation_error",
            ServiceError::IllegalPayoutTransition { .. } => "illegal_transition",
            ServiceError::Provider(_) => "provider_error",
            ServiceError::Repo(_) => "database_error",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    /// Render with an explicit status; webhook endpoints collapse several
    /// error kinds into 400
    pub fn into_response_with(self, status: StatusCode) -> Response {
        // Internals never leak to callers
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed with internal error");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorResponse::new(self.code(), message))).into_response()
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.into_response_with(status)
    }
}
