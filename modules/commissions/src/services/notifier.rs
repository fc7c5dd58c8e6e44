use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{
    CommissionPayout, NewNotification, Notification, NotificationKind, Payment,
};
use crate::repos::Store;

/// Writes user-facing notifications to the store
///
/// Delivery failures are logged and swallowed; a notification never decides
/// the outcome of the state transition that triggered it.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn Store>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn notify(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Option<Notification> {
        match self
            .store
            .insert_notification(NewNotification {
                user_id,
                kind,
                payload,
            })
            .await
        {
            Ok(notification) => Some(notification),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    kind = kind.as_str(),
                    error = %e,
                    "Failed to enqueue notification"
                );
                None
            }
        }
    }

    pub async fn payout_processed(&self, payout: &CommissionPayout) {
        self.notify(
            payout.referrer_id,
            NotificationKind::PayoutProcessed,
            json!({
                "payout_id": payout.id,
                "amount": payout.net_amount,
                "currency": payout.currency,
                "payment_method": payout.payment_method,
            }),
        )
        .await;
    }

    pub async fn payout_completed(&self, payout: &CommissionPayout) {
        self.notify(
            payout.referrer_id,
            NotificationKind::PayoutCompleted,
            json!({
                "payout_id": payout.id,
                "amount": payout.net_amount,
                "currency": payout.currency,
                "transaction_id": payout.external_transaction_id,
            }),
        )
        .await;
    }

    pub async fn payout_failed(&self, payout: &CommissionPayout, error: &str) {
        self.notify(
            payout.referrer_id,
            NotificationKind::PayoutFailed,
            json!({
                "payout_id": payout.id,
                "amount": payout.net_amount,
                "currency": payout.currency,
                "error": error,
            }),
        )
        .await;
    }

    pub async fn purchase_completed(&self, payment: &Payment) {
        self.notify(
            payment.user_id,
            NotificationKind::PurchaseCompleted,
            json!({
                "purchase_id": payment.id,
                "product_id": payment.product_id,
                "amount": payment.amount,
                "currency": payment.currency,
            }),
        )
        .await;
    }
}
