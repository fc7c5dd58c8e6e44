pub mod admin;
pub mod checkout;
pub mod health;
pub mod notifications;
pub mod partners;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::app::AppState;

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        // Provider webhooks
        .route("/api/webhooks/{provider}", post(webhooks::receive_webhook))
        // Checkout glue
        .route("/api/payments", post(checkout::create_payment))
        .route("/api/payments/{payment_id}", get(checkout::get_payment))
        .route("/api/payments/{payment_id}/access", get(checkout::get_payment_access))
        .route("/api/access/{grant_id}/downloads", post(checkout::record_download))
        .route("/api/referrals", post(checkout::create_referral))
        .route(
            "/api/referrals/{referral_id}/deactivate",
            post(checkout::deactivate_referral),
        )
        // Partners
        .route(
            "/api/partners/{partner_id}/payouts",
            post(partners::request_payout).get(partners::list_payouts),
        )
        .route("/api/partners/{partner_id}/balance", get(partners::get_balance))
        // Operators
        .route("/api/admin/payouts/bulk", post(admin::run_bulk_payouts))
        .route(
            "/api/admin/referrers/{referrer_id}/payouts",
            post(admin::aggregate_referrer),
        )
        .route("/api/admin/payouts/{payout_id}", get(admin::get_payout))
        .route(
            "/api/admin/payouts/{payout_id}/dispatch",
            post(admin::dispatch_payout),
        )
        .route(
            "/api/admin/payouts/{payout_id}/requeue",
            post(admin::requeue_payout),
        )
        .route("/api/admin/webhooks/failed", get(admin::list_failed_webhooks))
        .route(
            "/api/admin/webhooks/{webhook_id}/replay",
            post(admin::replay_webhook),
        )
        .route(
            "/api/admin/reconciliation/access",
            post(admin::reconcile_access),
        )
        // Notification outbox
        .route("/api/notifications/pending", get(notifications::list_pending))
        .route(
            "/api/notifications/{notification_id}/delivered",
            post(notifications::mark_delivered),
        )
        .route(
            "/api/users/{user_id}/notifications",
            get(notifications::list_for_user),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}
