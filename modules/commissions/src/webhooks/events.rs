//! Typed provider webhook events
//!
//! Each provider's native JSON is decoded into its own serde shape and then
//! normalized into a [`ProviderEvent`]. Statuses this service does not act on
//! become [`PaymentEventKind::Unhandled`] instead of falling through.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PaymentStatus, Provider};

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Missing field {0}")]
    MissingField(&'static str),

    #[error("Order reference {0} is not a valid id")]
    InvalidOrderRef(String),
}

/// What a webhook asks the payment state machine to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventKind {
    Processing,
    Succeeded,
    Cancelled,
    Expired,
    Refunded,
    /// Acknowledged and logged, no state change
    Unhandled { status: String },
}

impl PaymentEventKind {
    /// Target payment status, `None` for unhandled events
    pub fn target_status(&self) -> Option<PaymentStatus> {
        match self {
            PaymentEventKind::Processing => Some(PaymentStatus::Processing),
            PaymentEventKind::Succeeded => Some(PaymentStatus::Succeeded),
            PaymentEventKind::Cancelled => Some(PaymentStatus::Cancelled),
            PaymentEventKind::Expired => Some(PaymentStatus::Expired),
            PaymentEventKind::Refunded => Some(PaymentStatus::Refunded),
            PaymentEventKind::Unhandled { .. } => None,
        }
    }
}

/// Provider-neutral view of an inbound payment webhook
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub provider: Provider,
    /// Provider's delivery key, used to de-duplicate the webhook log
    pub event_id: Option<String>,
    pub event_type: String,
    /// Our payment id as sent back by the provider; absent only on unhandled events
    pub order_ref: Option<String>,
    pub provider_payment_id: Option<String>,
    pub kind: PaymentEventKind,
    /// Merged into the payment's metadata
    pub metadata: Value,
}

impl ProviderEvent {
    pub fn order_id(&self) -> Result<Uuid, EventParseError> {
        let order_ref = self
            .order_ref
            .as_deref()
            .ok_or(EventParseError::MissingField("order_id"))?;
        Uuid::parse_str(order_ref)
            .map_err(|_| EventParseError::InvalidOrderRef(order_ref.to_string()))
    }
}

/// Handled kinds must name the order they apply to
fn require_order_ref(
    kind: &PaymentEventKind,
    order_ref: Option<String>,
    field: &'static str,
) -> Result<Option<String>, EventParseError> {
    match (kind, order_ref) {
        (_, Some(order_ref)) => Ok(Some(order_ref)),
        (PaymentEventKind::Unhandled { .. }, None) => Ok(None),
        (_, None) => Err(EventParseError::MissingField(field)),
    }
}

// ============================================================================
// COINGATE
// ============================================================================

#[derive(Debug, Deserialize)]
struct CoinGateCallback {
    id: Value,
    order_id: Option<String>,
    status: String,
    #[serde(default)]
    price_amount: Option<Value>,
    #[serde(default)]
    price_currency: Option<String>,
    #[serde(default)]
    receive_currency: Option<String>,
}

fn coingate_kind(status: &str) -> PaymentEventKind {
    match status {
        "pending" | "confirming" => PaymentEventKind::Processing,
        "paid" => PaymentEventKind::Succeeded,
        "invalid" | "canceled" => PaymentEventKind::Cancelled,
        "expired" => PaymentEventKind::Expired,
        "refunded" => PaymentEventKind::Refunded,
        other => PaymentEventKind::Unhandled {
            status: other.to_string(),
        },
    }
}

fn parse_coingate(body: &[u8]) -> Result<ProviderEvent, EventParseError> {
    let cb: CoinGateCallback = serde_json::from_slice(body)?;
    let kind = coingate_kind(&cb.status);
    let order_ref = require_order_ref(&kind, cb.order_id, "order_id")?;
    let coingate_id = match &cb.id {
        Value::String(s) => s.clone(),
        Value::Null => return Err(EventParseError::MissingField("id")),
        other => other.to_string(),
    };

    Ok(ProviderEvent {
        provider: Provider::Coingate,
        // CoinGate re-posts the same order once per status change
        event_id: Some(format!("{}:{}", coingate_id, cb.status)),
        event_type: cb.status.clone(),
        order_ref,
        provider_payment_id: Some(coingate_id),
        kind,
        metadata: json!({
            "coingate_status": cb.status,
            "price_amount": cb.price_amount,
            "price_currency": cb.price_currency,
            "receive_currency": cb.receive_currency,
        }),
    })
}

// ============================================================================
// STRIPE
// ============================================================================

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeObject,
}

#[derive(Debug, Deserialize)]
struct StripeObject {
    id: String,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    metadata: StripeMetadata,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StripeMetadata {
    #[serde(default)]
    order_id: Option<String>,
}

fn stripe_kind(event_type: &str) -> PaymentEventKind {
    match event_type {
        "payment_intent.processing" => PaymentEventKind::Processing,
        "payment_intent.succeeded" | "checkout.session.completed" => PaymentEventKind::Succeeded,
        "payment_intent.canceled" => PaymentEventKind::Cancelled,
        "checkout.session.expired" => PaymentEventKind::Expired,
        "charge.refunded" => PaymentEventKind::Refunded,
        other => PaymentEventKind::Unhandled {
            status: other.to_string(),
        },
    }
}

fn parse_stripe(body: &[u8]) -> Result<ProviderEvent, EventParseError> {
    let event: StripeEvent = serde_json::from_slice(body)?;
    let object = event.data.object;
    let kind = stripe_kind(&event.event_type);
    let order_ref = require_order_ref(
        &kind,
        object.metadata.order_id,
        "data.object.metadata.order_id",
    )?;
    // Charges point back at their intent; intents carry their own id
    let provider_payment_id = object.payment_intent.or(Some(object.id));

    Ok(ProviderEvent {
        provider: Provider::Stripe,
        event_id: Some(event.id),
        kind,
        metadata: json!({
            "stripe_event_type": &event.event_type,
            "amount_minor": object.amount,
            "currency": object.currency,
        }),
        event_type: event.event_type,
        order_ref,
        provider_payment_id,
    })
}

// ============================================================================
// YOOKASSA
// ============================================================================

#[derive(Debug, Deserialize)]
struct YooKassaNotification {
    event: String,
    object: YooKassaObject,
}

#[derive(Debug, Deserialize)]
struct YooKassaObject {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payment_id: Option<String>,
    #[serde(default)]
    metadata: YooKassaMetadata,
    #[serde(default)]
    amount: Option<YooKassaAmount>,
}

#[derive(Debug, Default, Deserialize)]
struct YooKassaMetadata {
    #[serde(default)]
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YooKassaAmount {
    value: String,
    currency: String,
}

fn yookassa_kind(event: &str) -> PaymentEventKind {
    match event {
        "payment.waiting_for_capture" => PaymentEventKind::Processing,
        "payment.succeeded" => PaymentEventKind::Succeeded,
        "payment.canceled" => PaymentEventKind::Cancelled,
        "refund.succeeded" => PaymentEventKind::Refunded,
        other => PaymentEventKind::Unhandled {
            status: other.to_string(),
        },
    }
}

fn parse_yookassa(body: &[u8]) -> Result<ProviderEvent, EventParseError> {
    let notification: YooKassaNotification = serde_json::from_slice(body)?;
    let object = notification.object;
    let kind = yookassa_kind(&notification.event);
    let order_ref = require_order_ref(&kind, object.metadata.order_id, "object.metadata.order_id")?;
    let provider_payment_id = object.payment_id.clone().or_else(|| Some(object.id.clone()));

    Ok(ProviderEvent {
        provider: Provider::Yookassa,
        // YooKassa has no delivery id; event name plus object id is unique
        event_id: Some(format!("{}:{}", notification.event, object.id)),
        kind,
        metadata: json!({
            "yookassa_event": &notification.event,
            "yookassa_status": object.status,
            "amount": object.amount.as_ref().map(|a| a.value.clone()),
            "currency": object.amount.as_ref().map(|a| a.currency.clone()),
        }),
        event_type: notification.event,
        order_ref,
        provider_payment_id,
    })
}

/// Decode a raw webhook body for `provider`
pub fn parse(provider: Provider, body: &[u8]) -> Result<ProviderEvent, EventParseError> {
    match provider {
        Provider::Coingate => parse_coingate(body),
        Provider::Stripe => parse_stripe(body),
        Provider::Yookassa => parse_yookassa(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coingate_paid_is_success() {
        let order = Uuid::new_v4();
        let body = format!(r#"{{"id":1207,"order_id":"{order}","status":"paid","price_amount":"250.00","price_currency":"USD"}}"#);
        let event = parse(Provider::Coingate, body.as_bytes()).unwrap();

        assert_eq!(event.kind, PaymentEventKind::Succeeded);
        assert_eq!(event.order_id().unwrap(), order);
        assert_eq!(event.event_id.as_deref(), Some("1207:paid"));
        assert_eq!(event.provider_payment_id.as_deref(), Some("1207"));
    }

    #[test]
    fn coingate_unknown_status_is_unhandled() {
        let body = br#"{"id":"7","order_id":"x","status":"new"}"#;
        let event = parse(Provider::Coingate, body).unwrap();
        assert_eq!(
            event.kind,
            PaymentEventKind::Unhandled {
                status: "new".to_string()
            }
        );
        assert_eq!(event.kind.target_status(), None);
    }

    #[test]
    fn coingate_missing_order_id_rejected() {
        let err = parse(Provider::Coingate, br#"{"id":7,"status":"paid"}"#).unwrap_err();
        assert!(matches!(err, EventParseError::MissingField("order_id")));
    }

    #[test]
    fn stripe_refund_points_to_intent() {
        let body = br#"{
            "id": "evt_1",
            "type": "charge.refunded",
            "data": {"object": {"id": "ch_1", "payment_intent": "pi_9", "metadata": {"order_id": "o-1"}}}
        }"#;
        let event = parse(Provider::Stripe, body).unwrap();

        assert_eq!(event.kind, PaymentEventKind::Refunded);
        assert_eq!(event.provider_payment_id.as_deref(), Some("pi_9"));
        assert_eq!(event.event_id.as_deref(), Some("evt_1"));
        assert!(matches!(event.order_id(), Err(EventParseError::InvalidOrderRef(_))));
    }

    #[test]
    fn stripe_unknown_type_is_unhandled() {
        let body = br#"{"id":"evt_2","type":"customer.created","data":{"object":{"id":"cus_1","metadata":{"order_id":"o"}}}}"#;
        let event = parse(Provider::Stripe, body).unwrap();
        assert!(matches!(event.kind, PaymentEventKind::Unhandled { .. }));
    }

    #[test]
    fn stripe_unhandled_type_needs_no_order_id() {
        let body = br#"{"id":"evt_x","type":"customer.created","data":{"object":{"id":"cus_1"}}}"#;
        let event = parse(Provider::Stripe, body).unwrap();

        assert_eq!(
            event.kind,
            PaymentEventKind::Unhandled {
                status: "customer.created".to_string()
            }
        );
        assert_eq!(event.order_ref, None);
        assert!(matches!(event.order_id(), Err(EventParseError::MissingField(_))));
    }

    #[test]
    fn stripe_handled_type_still_requires_order_id() {
        let body = br#"{"id":"evt_3","type":"payment_intent.succeeded","data":{"object":{"id":"pi_3"}}}"#;
        let err = parse(Provider::Stripe, body).unwrap_err();
        assert!(matches!(
            err,
            EventParseError::MissingField("data.object.metadata.order_id")
        ));
    }

    #[test]
    fn yookassa_unhandled_event_needs_no_order_id() {
        let body = br#"{"type":"notification","event":"payout.succeeded","object":{"id":"po-1"}}"#;
        let event = parse(Provider::Yookassa, body).unwrap();
        assert!(matches!(event.kind, PaymentEventKind::Unhandled { .. }));
        assert_eq!(event.order_ref, None);
    }

    #[test]
    fn yookassa_waiting_for_capture_is_processing() {
        let body = br#"{
            "type": "notification",
            "event": "payment.waiting_for_capture",
            "object": {"id": "2d1", "status": "waiting_for_capture",
                       "amount": {"value": "990.00", "currency": "RUB"},
                       "metadata": {"order_id": "o-2"}}
        }"#;
        let event = parse(Provider::Yookassa, body).unwrap();

        assert_eq!(event.kind, PaymentEventKind::Processing);
        assert_eq!(event.event_id.as_deref(), Some("payment.waiting_for_capture:2d1"));
        assert_eq!(event.metadata["amount"], "990.00");
    }

    #[test]
    fn garbage_body_is_invalid_json() {
        let err = parse(Provider::Yookassa, b"not json").unwrap_err();
        assert!(matches!(err, EventParseError::InvalidJson(_)));
    }
}
