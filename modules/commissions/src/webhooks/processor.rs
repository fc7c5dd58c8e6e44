//! Inbound webhook pipeline
//!
//! verify -> log -> parse -> payment tracker -> access + commission -> notify
//!
//! Every delivery lands in the webhook log. Failures keep their error text so
//! an operator can replay them once the cause is fixed.

use axum::http::HeaderMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::events::{self, PaymentEventKind, ProviderEvent};
use super::signature;
use crate::error::ServiceError;
use crate::models::{NewWebhookLogEntry, PaymentStatus, Provider, WebhookStatus};
use crate::repos::Store;
use crate::services::{
    AccessGranter, CommissionCalculator, Notifier, PaymentTracker, StatusChange,
};

/// `event_type` recorded for deliveries that failed signature verification
pub const SIGNATURE_REJECTED: &str = "signature_rejected";
/// `event_type` recorded for deliveries that could not be decoded
pub const UNPARSEABLE: &str = "unparseable";

/// Shared secrets per provider
#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    pub coingate: String,
    pub stripe: String,
    pub yookassa: String,
}

impl WebhookSecrets {
    pub fn for_provider(&self, provider: Provider) -> &str {
        match provider {
            Provider::Coingate => &self.coingate,
            Provider::Stripe => &self.stripe,
            Provider::Yookassa => &self.yookassa,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceipt {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub processing_time_ms: u64,
}

pub struct WebhookProcessor {
    store: Arc<dyn Store>,
    tracker: PaymentTracker,
    access: AccessGranter,
    commission: CommissionCalculator,
    notifier: Notifier,
    secrets: WebhookSecrets,
    tolerance_secs: i64,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        tracker: PaymentTracker,
        access: AccessGranter,
        commission: CommissionCalculator,
        notifier: Notifier,
        secrets: WebhookSecrets,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            store,
            tracker,
            access,
            commission,
            notifier,
            secrets,
            tolerance_secs,
        }
    }

    /// Handle one delivery from `provider`
    pub async fn handle(
        &self,
        provider: Provider,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookReceipt, ServiceError> {
        let started = Instant::now();

        if let Err(e) = signature::verify(
            provider,
            body,
            headers,
            self.secrets.for_provider(provider),
            self.tolerance_secs,
        ) {
            tracing::warn!(provider = %provider, error = %e, "Webhook signature rejected");
            self.record_rejected(provider, body, SIGNATURE_REJECTED, &e.to_string())
                .await;
            return Err(e.into());
        }

        let event = match events::parse(provider, body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "Webhook payload rejected");
                self.record_rejected(provider, body, UNPARSEABLE, &e.to_string())
                    .await;
                return Err(ServiceError::Validation(e.to_string()));
            }
        };

        let entry = self
            .store
            .record_webhook(NewWebhookLogEntry {
                provider,
                event_id: event.event_id.clone(),
                event_type: Some(event.event_type.clone()),
                order_ref: event.order_ref.clone(),
                payload: payload_json(body),
            })
            .await?;

        if entry.status == WebhookStatus::Processed {
            tracing::info!(
                provider = %provider,
                event_id = ?entry.event_id,
                attempts = entry.attempt_count,
                "Duplicate webhook already processed"
            );
            return Ok(receipt(&event, started));
        }

        self.process_logged(entry.id, &event).await?;
        Ok(receipt(&event, started))
    }

    /// Re-run a stored failed delivery without re-checking its signature
    pub async fn replay(&self, webhook_id: Uuid) -> Result<WebhookReceipt, ServiceError> {
        let started = Instant::now();
        let entry = self
            .store
            .find_webhook(webhook_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("webhook event", webhook_id))?;

        if entry.status != WebhookStatus::Failed {
            return Err(ServiceError::Validation(format!(
                "webhook {} is {}; only failed events can be replayed",
                webhook_id,
                entry.status.as_str()
            )));
        }
        if entry.event_type.as_deref() == Some(SIGNATURE_REJECTED) {
            return Err(ServiceError::Validation(
                "deliveries that failed signature verification cannot be replayed".to_string(),
            ));
        }

        let raw = serde_json::to_vec(&entry.payload)
            .map_err(|e| ServiceError::Internal(format!("stored payload not serializable: {}", e)))?;
        let event = events::parse(entry.provider, &raw)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        tracing::info!(webhook_id = %webhook_id, provider = %entry.provider, "Replaying webhook");
        self.process_logged(entry.id, &event).await?;
        Ok(receipt(&event, started))
    }

    async fn process_logged(&self, log_id: Uuid, event: &ProviderEvent) -> Result<(), ServiceError> {
        match self.apply(event).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_webhook_processed(log_id).await {
                    tracing::error!(webhook_id = %log_id, error = %e, "Failed to mark webhook processed");
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    webhook_id = %log_id,
                    provider = %event.provider,
                    order_ref = ?event.order_ref,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed"
                );
                if let Err(log_err) = self.store.mark_webhook_failed(log_id, &e.to_string()).await {
                    tracing::error!(webhook_id = %log_id, error = %log_err, "Failed to mark webhook failed");
                }
                Err(e)
            }
        }
    }

    async fn apply(&self, event: &ProviderEvent) -> Result<(), ServiceError> {
        let Some(target) = event.kind.target_status() else {
            if let PaymentEventKind::Unhandled { status } = &event.kind {
                tracing::info!(
                    provider = %event.provider,
                    order_ref = ?event.order_ref,
                    status = %status,
                    "Unhandled webhook status acknowledged"
                );
            }
            return Ok(());
        };

        let payment_id = event
            .order_id()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let change = self
            .tracker
            .update_status(
                payment_id,
                target,
                event.provider_payment_id.clone(),
                event.metadata.clone(),
            )
            .await?;

        if !change.reached_target() {
            return Ok(());
        }
        let payment = change.payment();

        match target {
            PaymentStatus::Succeeded => {
                // Re-run on redelivery too; both steps are idempotent and a
                // retry is how a failed grant gets repaired
                self.access
                    .grant(payment.user_id, payment.product_id, payment.id)
                    .await?;
                self.commission.record_for_payment(payment).await?;

                if matches!(change, StatusChange::Applied { .. }) {
                    self.notifier.purchase_completed(payment).await;
                }
            }
            PaymentStatus::Refunded => {
                self.access.revoke_for_purchase(payment.id).await?;
                self.commission.void_for_purchase(payment.id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn record_rejected(&self, provider: Provider, body: &[u8], kind: &str, error: &str) {
        let entry = self
            .store
            .record_webhook(NewWebhookLogEntry {
                provider,
                event_id: None,
                event_type: Some(kind.to_string()),
                order_ref: None,
                payload: payload_json(body),
            })
            .await;

        match entry {
            Ok(entry) => {
                if let Err(e) = self.store.mark_webhook_failed(entry.id, error).await {
                    tracing::error!(webhook_id = %entry.id, error = %e, "Failed to mark webhook failed");
                }
            }
            Err(e) => tracing::error!(provider = %provider, error = %e, "Failed to log rejected webhook"),
        }
    }
}

fn receipt(event: &ProviderEvent, started: Instant) -> WebhookReceipt {
    WebhookReceipt {
        received: true,
        order_id: event.order_ref.clone(),
        processing_time_ms: started.elapsed().as_millis() as u64,
    }
}

/// Store JSON bodies as-is and anything else as a string
fn payload_json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(body).into_owned()))
}
