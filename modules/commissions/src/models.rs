use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// PAYMENTS
// ============================================================================

/// Payment provider that can deliver webhooks for an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Coingate,
    Stripe,
    Yookassa,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Coingate => "coingate",
            Provider::Stripe => "stripe",
            Provider::Yookassa => "yookassa",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "coingate" => Some(Provider::Coingate),
            "stripe" => Some(Provider::Stripe),
            "yookassa" => Some(Provider::Yookassa),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a payment / order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Cancelled,
    Expired,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "processing" => Some(PaymentStatus::Processing),
            "succeeded" => Some(PaymentStatus::Succeeded),
            "cancelled" => Some(PaymentStatus::Cancelled),
            "expired" => Some(PaymentStatus::Expired),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    /// Legal forward transitions. `succeeded -> refunded` is the only
    /// way out of a successful payment.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Succeeded)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Processing, Succeeded)
                | (Processing, Cancelled)
                | (Processing, Expired)
                | (Succeeded, Refunded)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted purchase (payment intent / order)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Checkout initiation input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub user_id: Uuid,
    pub product_id: Uuid,
    #[serde(default)]
    pub shop_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub provider: Provider,
    #[serde(default)]
    pub referral_code: Option<String>,
}

// ============================================================================
// ACCESS GRANTS
// ============================================================================

/// A buyer's entitlement to download a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductAccessGrant {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub purchase_id: Uuid,
    pub download_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProductAccessGrant {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map_or(true, |exp| exp > now)
    }
}

// ============================================================================
// REFERRALS
// ============================================================================

/// Durable link between a referrer and a product or shop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub referrer_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<Uuid>,
    pub commission_percent: Decimal,
    pub code: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Referral {
    /// A referral targets either a single product or every product of a shop.
    pub fn covers(&self, product_id: Uuid, shop_id: Option<Uuid>) -> bool {
        self.product_id == Some(product_id)
            || (self.shop_id.is_some() && self.shop_id == shop_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReferral {
    pub referrer_id: Uuid,
    #[serde(default)]
    pub product_id: Option<Uuid>,
    #[serde(default)]
    pub shop_id: Option<Uuid>,
    pub commission_percent: Decimal,
    pub code: String,
}

/// One commission-eligible purchase attributed to a referral
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralConversion {
    pub id: Uuid,
    pub referral_id: Uuid,
    pub referrer_id: Uuid,
    pub purchase_id: Uuid,
    pub purchase_amount: Decimal,
    pub commission_amount: Decimal,
    pub currency: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewConversion {
    pub referral_id: Uuid,
    pub referrer_id: Uuid,
    pub purchase_id: Uuid,
    pub purchase_amount: Decimal,
    pub commission_amount: Decimal,
    pub currency: String,
}

// ============================================================================
// PAYOUTS
// ============================================================================

/// Payout state machine: pending -> processing -> {paid | failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Paid,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PayoutStatus::Pending),
            "processing" => Some(PayoutStatus::Processing),
            "paid" => Some(PayoutStatus::Paid),
            "failed" => Some(PayoutStatus::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: PayoutStatus) -> bool {
        matches!(
            (self, next),
            (PayoutStatus::Pending, PayoutStatus::Processing)
                | (PayoutStatus::Processing, PayoutStatus::Paid)
                | (PayoutStatus::Processing, PayoutStatus::Failed)
        )
    }

    /// Pending and processing payouts are still in flight.
    pub fn is_open(&self) -> bool {
        matches!(self, PayoutStatus::Pending | PayoutStatus::Processing)
    }
}

impl std::fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a payout reaches the referrer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentMethod {
    Paypal,
    BankTransfer,
    Crypto,
    Other(String),
}

impl PaymentMethod {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Crypto => "crypto",
            PaymentMethod::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for PaymentMethod {
    fn from(s: String) -> Self {
        match s.as_str() {
            "paypal" => PaymentMethod::Paypal,
            "bank_transfer" => PaymentMethod::BankTransfer,
            "crypto" => PaymentMethod::Crypto,
            _ => PaymentMethod::Other(s),
        }
    }
}

impl From<&str> for PaymentMethod {
    fn from(s: &str) -> Self {
        PaymentMethod::from(s.to_string())
    }
}

impl From<PaymentMethod> for String {
    fn from(m: PaymentMethod) -> Self {
        m.as_str().to_string()
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated payable unit for one referrer over one period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionPayout {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// All amounts are in this currency; conversions in other currencies get their own payout
    pub currency: String,
    pub total_amount: Decimal,
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
    pub status: PayoutStatus,
    pub payment_method: PaymentMethod,
    pub payment_details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requeued_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayout {
    pub referrer_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub currency: String,
    pub total_amount: Decimal,
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub payment_details: serde_json::Value,
    pub notes: Option<String>,
    pub requeued_from: Option<Uuid>,
}

/// Fields written alongside a payout status transition
#[derive(Debug, Clone, Default)]
pub struct PayoutUpdate {
    pub external_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
}

/// One referrer's earnings in one currency; the unit a bulk run pays out
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayoutUnit {
    pub referrer_id: Uuid,
    pub currency: String,
}

/// Partner earnings ledger for one currency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerBalance {
    pub partner_id: Uuid,
    pub currency: String,
    /// Sum of verified commissions
    pub total_earned: Decimal,
    /// Sum of payouts that are pending, processing or paid
    pub requested: Decimal,
    pub available: Decimal,
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PayoutProcessed,
    PayoutCompleted,
    PayoutFailed,
    PurchaseCompleted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PayoutProcessed => "payout_processed",
            NotificationKind::PayoutCompleted => "payout_completed",
            NotificationKind::PayoutFailed => "payout_failed",
            NotificationKind::PurchaseCompleted => "purchase_completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "payout_processed" => Some(NotificationKind::PayoutProcessed),
            "payout_completed" => Some(NotificationKind::PayoutCompleted),
            "payout_failed" => Some(NotificationKind::PayoutFailed),
            "purchase_completed" => Some(NotificationKind::PurchaseCompleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

// ============================================================================
// WEBHOOK LOG
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Received,
    Processed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Received => "received",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "received" => Some(WebhookStatus::Received),
            "processed" => Some(WebhookStatus::Processed),
            "failed" => Some(WebhookStatus::Failed),
            _ => None,
        }
    }
}

/// Audit record of one inbound webhook delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLogEntry {
    pub id: Uuid,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_ref: Option<String>,
    pub status: WebhookStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub payload: serde_json::Value,
    pub attempt_count: i32,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookLogEntry {
    pub provider: Provider,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub order_ref: Option<String>,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payout_state_machine_only_moves_forward() {
        use PayoutStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Paid));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Paid));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn succeeded_payment_only_leaves_via_refund() {
        use PaymentStatus::*;
        assert!(Succeeded.can_transition_to(Refunded));
        assert!(!Succeeded.can_transition_to(Pending));
        assert!(!Succeeded.can_transition_to(Cancelled));
        assert!(!Refunded.can_transition_to(Succeeded));
        assert!(!Cancelled.can_transition_to(Succeeded));
    }

    #[test]
    fn payment_method_round_trips_through_strings() {
        let m: PaymentMethod = serde_json::from_str("\"bank_transfer\"").unwrap();
        assert_eq!(m, PaymentMethod::BankTransfer);

        let other: PaymentMethod = serde_json::from_str("\"gift_card\"").unwrap();
        assert_eq!(other, PaymentMethod::Other("gift_card".to_string()));
        assert_eq!(serde_json::to_string(&other).unwrap(), "\"gift_card\"");
    }

    #[test]
    fn shop_referral_covers_every_product_in_shop() {
        let shop = Uuid::new_v4();
        let referral = Referral {
            id: Uuid::new_v4(),
            referrer_id: Uuid::new_v4(),
            product_id: None,
            shop_id: Some(shop),
            commission_percent: Decimal::new(10, 0),
            code: "SHOP10".to_string(),
            active: true,
            created_at: Utc::now(),
        };

        assert!(referral.covers(Uuid::new_v4(), Some(shop)));
        assert!(!referral.covers(Uuid::new_v4(), None));
        assert!(!referral.covers(Uuid::new_v4(), Some(Uuid::new_v4())));
    }
}
