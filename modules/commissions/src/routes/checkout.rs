//! Checkout glue: payment creation, referral links and download counting

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ServiceError;
use crate::models::{NewPayment, NewReferral, Payment, ProductAccessGrant, Referral};
use crate::money;

/// Handler for POST /api/payments
///
/// Creates the pending payment whose id is sent to the provider as the order id.
pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    Json(mut new): Json<NewPayment>,
) -> Result<(StatusCode, Json<Payment>), ServiceError> {
    if new.amount <= Decimal::ZERO {
        return Err(ServiceError::Validation("amount must be positive".to_string()));
    }
    // Commissions and payouts are keyed by this code
    new.currency = money::normalize_currency(&new.currency).ok_or_else(|| {
        ServiceError::Validation("currency must be a 3-letter code".to_string())
    })?;

    let payment = state.store.insert_payment(new).await?;
    tracing::info!(
        payment_id = %payment.id,
        user_id = %payment.user_id,
        product_id = %payment.product_id,
        provider = %payment.provider,
        "Payment created"
    );
    Ok((StatusCode::CREATED, Json(payment)))
}

/// Handler for GET /api/payments/{payment_id}
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<Payment>, ServiceError> {
    state
        .store
        .find_payment(payment_id)
        .await?
        .map(Json)
        .ok_or_else(|| ServiceError::not_found("payment", payment_id))
}

/// Handler for GET /api/payments/{payment_id}/access
pub async fn get_payment_access(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<Vec<ProductAccessGrant>>, ServiceError> {
    Ok(Json(state.store.grants_for_purchase(payment_id).await?))
}

/// Handler for POST /api/access/{grant_id}/downloads
pub async fn record_download(
    State(state): State<Arc<AppState>>,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<ProductAccessGrant>, ServiceError> {
    Ok(Json(state.access.record_download(grant_id).await?))
}

/// Handler for POST /api/referrals
pub async fn create_referral(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewReferral>,
) -> Result<(StatusCode, Json<Referral>), ServiceError> {
    let referral = state.commission.create_referral(new).await?;
    tracing::info!(
        referral_id = %referral.id,
        referrer_id = %referral.referrer_id,
        code = %referral.code,
        "Referral created"
    );
    Ok((StatusCode::CREATED, Json(referral)))
}

/// Handler for POST /api/referrals/{referral_id}/deactivate
pub async fn deactivate_referral(
    State(state): State<Arc<AppState>>,
    Path(referral_id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.commission.deactivate_referral(referral_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
