use std::sync::Arc;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{Payment, PaymentStatus};
use crate::repos::Store;

/// Compare-and-set attempts before giving up on a contended payment row
const MAX_CAS_ATTEMPTS: usize = 3;

/// Result of applying a provider status to a payment
#[derive(Debug, Clone)]
pub enum StatusChange {
    /// The payment moved `from -> to`
    Applied {
        from: PaymentStatus,
        payment: Payment,
    },
    /// The payment already had the requested status (redelivery)
    Unchanged { payment: Payment },
    /// The transition is not legal from the current status; nothing was written
    Ignored {
        requested: PaymentStatus,
        payment: Payment,
    },
}

impl StatusChange {
    pub fn payment(&self) -> &Payment {
        match self {
            StatusChange::Applied { payment, .. }
            | StatusChange::Unchanged { payment }
            | StatusChange::Ignored { payment, .. } => payment,
        }
    }

    /// True when the payment now holds the requested status
    pub fn reached_target(&self) -> bool {
        !matches!(self, StatusChange::Ignored { .. })
    }
}

/// Single source of truth for payment status
#[derive(Clone)]
pub struct PaymentTracker {
    store: Arc<dyn Store>,
}

impl PaymentTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Move a payment to `next`, merging provider metadata.
    ///
    /// Safe under at-least-once delivery: re-applying the current status is
    /// `Unchanged`, an out-of-order status is `Ignored`. An unknown payment is
    /// `NotFound` and the caller must stop.
    pub async fn update_status(
        &self,
        payment_id: Uuid,
        next: PaymentStatus,
        provider_payment_id: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<StatusChange, ServiceError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let payment = self
                .store
                .find_payment(payment_id)
                .await?
                .ok_or_else(|| {
                    tracing::warn!(payment_id = %payment_id, "Webhook references unknown payment");
                    ServiceError::not_found("payment", payment_id)
                })?;

            let current = payment.status;
            if current == next {
                return Ok(StatusChange::Unchanged { payment });
            }

            if !current.can_transition_to(next) {
                tracing::warn!(
                    payment_id = %payment_id,
                    from = %current,
                    to = %next,
                    "Ignoring illegal payment transition"
                );
                return Ok(StatusChange::Ignored {
                    requested: next,
                    payment,
                });
            }

            if let Some(updated) = self
                .store
                .update_payment_status(
                    payment_id,
                    current,
                    next,
                    provider_payment_id.clone(),
                    metadata.clone(),
                )
                .await?
            {
                tracing::info!(
                    payment_id = %payment_id,
                    from = %current,
                    to = %next,
                    "Payment status updated"
                );
                return Ok(StatusChange::Applied {
                    from: current,
                    payment: updated,
                });
            }

            tracing::debug!(payment_id = %payment_id, "Payment status changed concurrently, retrying");
        }

        Err(ServiceError::Internal(format!(
            "payment {} kept changing during status update",
            payment_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewPayment, Provider};
    use crate::repos::{InMemoryStore, PaymentRepo};
    use rust_decimal::Decimal;
    use serde_json::json;

    async fn seeded() -> (PaymentTracker, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let payment = store
            .insert_payment(NewPayment {
                user_id: Uuid::new_v4(),
                product_id: Uuid::new_v4(),
                shop_id: None,
                amount: Decimal::new(25000, 2),
                currency: "USD".to_string(),
                provider: Provider::Stripe,
                referral_code: None,
            })
            .await
            .unwrap();
        (PaymentTracker::new(store), payment.id)
    }

    #[tokio::test]
    async fn second_success_is_unchanged() {
        let (tracker, id) = seeded().await;

        let first = tracker
            .update_status(id, PaymentStatus::Succeeded, Some("pi_1".into()), json!({"a": 1}))
            .await
            .unwrap();
        assert!(matches!(first, StatusChange::Applied { from: PaymentStatus::Pending, .. }));
        assert_eq!(first.payment().provider_payment_id.as_deref(), Some("pi_1"));

        let second = tracker
            .update_status(id, PaymentStatus::Succeeded, None, json!({}))
            .await
            .unwrap();
        assert!(matches!(second, StatusChange::Unchanged { .. }));
        assert_eq!(second.payment().metadata["a"], 1);
    }

    #[tokio::test]
    async fn succeeded_payment_does_not_revert() {
        let (tracker, id) = seeded().await;
        tracker
            .update_status(id, PaymentStatus::Succeeded, None, json!({}))
            .await
            .unwrap();

        let change = tracker
            .update_status(id, PaymentStatus::Cancelled, None, json!({}))
            .await
            .unwrap();
        assert!(matches!(change, StatusChange::Ignored { requested: PaymentStatus::Cancelled, .. }));
        assert_eq!(change.payment().status, PaymentStatus::Succeeded);
        assert!(!change.reached_target());
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let (tracker, _) = seeded().await;
        let err = tracker
            .update_status(Uuid::new_v4(), PaymentStatus::Succeeded, None, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { entity: "payment", .. }));
    }
}
