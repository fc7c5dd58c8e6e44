//! Operator endpoints: bulk/single payout runs, dispatch, re-queue,
//! failed webhook audit and replay, access reconciliation

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ServiceError;
use crate::models::{CommissionPayout, WebhookLogEntry};
use crate::services::aggregator::AggregateRequest;
use crate::services::{
    AggregateOutcome, BulkPayoutRequest, BulkPayoutSummary, DispatchOutcome, ReconcileReport,
};
use crate::webhooks::WebhookReceipt;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub status: &'static str,
    pub payout: CommissionPayout,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Handler for POST /api/admin/payouts/bulk
pub async fn run_bulk_payouts(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkPayoutRequest>,
) -> Result<Json<BulkPayoutSummary>, ServiceError> {
    Ok(Json(state.aggregator.aggregate_all(request).await?))
}

/// Handler for POST /api/admin/referrers/{referrer_id}/payouts
///
/// 201 when a payout was created, 200 with the structured outcome otherwise.
pub async fn aggregate_referrer(
    State(state): State<Arc<AppState>>,
    Path(referrer_id): Path<Uuid>,
    Json(request): Json<AggregateRequest>,
) -> Result<Response, ServiceError> {
    let minimum = request
        .minimum_payout
        .unwrap_or_else(|| state.aggregator.default_minimum());
    let currency = state.aggregator.currency(request.currency.as_deref())?;
    let outcome = state
        .aggregator
        .aggregate(
            referrer_id,
            &currency,
            request.period_start,
            request.period_end,
            minimum,
            request.payment_method,
            request.payment_details,
        )
        .await?;

    let status = match outcome {
        AggregateOutcome::Created { .. } => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

/// Handler for GET /api/admin/payouts/{payout_id}
pub async fn get_payout(
    State(state): State<Arc<AppState>>,
    Path(payout_id): Path<Uuid>,
) -> Result<Json<CommissionPayout>, ServiceError> {
    state
        .store
        .find_payout(payout_id)
        .await?
        .map(Json)
        .ok_or_else(|| ServiceError::not_found("payout", payout_id))
}

/// Handler for POST /api/admin/payouts/{payout_id}/dispatch
pub async fn dispatch_payout(
    State(state): State<Arc<AppState>>,
    Path(payout_id): Path<Uuid>,
) -> Result<Json<DispatchResponse>, ServiceError> {
    let response = match state.dispatcher.dispatch(payout_id).await? {
        DispatchOutcome::Paid(payout) => DispatchResponse {
            status: "paid",
            payout,
            reason: None,
        },
        DispatchOutcome::Failed { payout, reason } => DispatchResponse {
            status: "failed",
            payout,
            reason: Some(reason),
        },
    };
    Ok(Json(response))
}

/// Handler for POST /api/admin/payouts/{payout_id}/requeue
pub async fn requeue_payout(
    State(state): State<Arc<AppState>>,
    Path(payout_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CommissionPayout>), ServiceError> {
    let payout = state.dispatcher.requeue(payout_id).await?;
    Ok((StatusCode::CREATED, Json(payout)))
}

/// Handler for GET /api/admin/webhooks/failed
pub async fn list_failed_webhooks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<WebhookLogEntry>>, ServiceError> {
    let limit = query.limit.clamp(1, 1000);
    Ok(Json(state.store.failed_webhooks(limit).await?))
}

/// Handler for POST /api/admin/webhooks/{webhook_id}/replay
pub async fn replay_webhook(
    State(state): State<Arc<AppState>>,
    Path(webhook_id): Path<Uuid>,
) -> Result<Json<WebhookReceipt>, ServiceError> {
    Ok(Json(state.webhooks.replay(webhook_id).await?))
}

/// Handler for POST /api/admin/reconciliation/access
pub async fn reconcile_access(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReconcileReport>, ServiceError> {
    Ok(Json(state.reconciler.run().await?))
}
