//! Partner-facing payout endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::{ErrorResponse, ServiceError};
use crate::models::{CommissionPayout, PartnerBalance};
use crate::services::{PayoutRequest, PayoutRequestOutcome};

/// Handler for POST /api/partners/{partner_id}/payouts
///
/// 201 with the payout, or 400 with a human-readable reason when a business
/// rule rejects the request.
pub async fn request_payout(
    State(state): State<Arc<AppState>>,
    Path(partner_id): Path<Uuid>,
    Json(request): Json<PayoutRequest>,
) -> Result<Response, ServiceError> {
    let outcome = state.payout_requests.request_payout(partner_id, request).await?;

    let response = match outcome {
        PayoutRequestOutcome::Created { payout } => (StatusCode::CREATED, Json(payout)).into_response(),
        rejected => {
            let reason = rejected.rejection_reason().unwrap_or_default();
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("payout_rejected", reason)),
            )
                .into_response()
        }
    };
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub currency: Option<String>,
}

/// Handler for GET /api/partners/{partner_id}/balance?currency=USD
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    Path(partner_id): Path<Uuid>,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<PartnerBalance>, ServiceError> {
    Ok(Json(
        state
            .payout_requests
            .balance(partner_id, query.currency.as_deref())
            .await?,
    ))
}

/// Handler for GET /api/partners/{partner_id}/payouts
pub async fn list_payouts(
    State(state): State<Arc<AppState>>,
    Path(partner_id): Path<Uuid>,
) -> Result<Json<Vec<CommissionPayout>>, ServiceError> {
    Ok(Json(state.store.payouts_for_referrer(partner_id).await?))
}
