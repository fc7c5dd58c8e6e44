//! Persistence seams
//!
//! Each concern gets a small async trait. `PgStore` backs production and
//! `InMemoryStore` backs dev/test; both enforce the same uniqueness rules so
//! idempotency does not depend on which one is wired in.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    CommissionPayout, NewConversion, NewNotification, NewPayment, NewPayout, NewReferral,
    NewWebhookLogEntry, Notification, PartnerBalance, Payment, PaymentStatus, PayoutStatus,
    PayoutUnit, PayoutUpdate, ProductAccessGrant, Referral, ReferralConversion, WebhookLogEntry,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Stored value could not be decoded: {0}")]
    Decode(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Whether an insert created a new row or found the existing one
#[derive(Debug, Clone)]
pub struct Upserted<T> {
    pub value: T,
    pub created: bool,
}

/// Rule checked atomically together with a payout insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutGuard {
    /// No non-failed payout may exist for the same (referrer, period_start, period_end, currency)
    UniquePeriod,
    /// No pending/processing payout may exist for the referrer in that currency
    NoOpenPayout,
}

/// Result of an atomic payout insert
#[derive(Debug, Clone)]
pub enum PayoutInsert {
    Created(CommissionPayout),
    DuplicatePeriod { existing_id: Uuid },
    OpenPayoutExists { existing_id: Uuid },
    InsufficientBalance { available: Decimal },
}

#[async_trait]
pub trait PaymentRepo: Send + Sync {
    async fn insert_payment(&self, new: NewPayment) -> RepoResult<Payment>;

    async fn find_payment(&self, id: Uuid) -> RepoResult<Option<Payment>>;

    /// Compare-and-set on status. Returns `None` when the stored status is no
    /// longer `expected`.
    async fn update_payment_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        next: PaymentStatus,
        provider_payment_id: Option<String>,
        metadata: serde_json::Value,
    ) -> RepoResult<Option<Payment>>;

    /// Succeeded payments with no active grant for their purchase
    async fn succeeded_payments_without_grant(&self, limit: i64) -> RepoResult<Vec<Payment>>;
}

#[async_trait]
pub trait AccessRepo: Send + Sync {
    async fn insert_grant_if_absent(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        purchase_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> RepoResult<Upserted<ProductAccessGrant>>;

    async fn find_grant(&self, id: Uuid) -> RepoResult<Option<ProductAccessGrant>>;

    async fn grants_for_purchase(&self, purchase_id: Uuid) -> RepoResult<Vec<ProductAccessGrant>>;

    /// Marks active grants of a purchase revoked; returns how many changed
    async fn revoke_grants_for_purchase(&self, purchase_id: Uuid) -> RepoResult<u64>;

    /// Increments the download counter of an active grant
    async fn increment_download(&self, grant_id: Uuid) -> RepoResult<Option<ProductAccessGrant>>;
}

#[async_trait]
pub trait ReferralRepo: Send + Sync {
    async fn insert_referral(&self, new: NewReferral) -> RepoResult<Referral>;

    /// Active referral with this code that covers the product (directly or via its shop)
    async fn find_active_referral(
        &self,
        code: &str,
        product_id: Uuid,
        shop_id: Option<Uuid>,
    ) -> RepoResult<Option<Referral>>;

    async fn deactivate_referral(&self, id: Uuid) -> RepoResult<bool>;

    async fn insert_conversion_if_absent(
        &self,
        new: NewConversion,
    ) -> RepoResult<Upserted<ReferralConversion>>;

    async fn conversions_for_purchase(&self, purchase_id: Uuid) -> RepoResult<Vec<ReferralConversion>>;

    /// Un-verifies conversions of a refunded purchase; returns how many changed
    async fn void_conversions_for_purchase(&self, purchase_id: Uuid) -> RepoResult<u64>;

    /// Sum of the referrer's verified commissions in `currency` created within [start, end]
    async fn verified_commission_total(
        &self,
        referrer_id: Uuid,
        currency: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> RepoResult<Decimal>;

    /// Distinct (referrer, currency) pairs with a verified conversion within [start, end]
    async fn payout_units(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> RepoResult<Vec<PayoutUnit>>;

    async fn earliest_verified_conversion(
        &self,
        referrer_id: Uuid,
        currency: &str,
    ) -> RepoResult<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait PayoutRepo: Send + Sync {
    /// Inserts a pending payout if `guard` holds and the referrer's available
    /// balance in the payout's currency covers `total_amount`. The checks and
    /// the insert are atomic.
    async fn insert_payout(&self, new: NewPayout, guard: PayoutGuard) -> RepoResult<PayoutInsert>;

    async fn find_payout(&self, id: Uuid) -> RepoResult<Option<CommissionPayout>>;

    /// Compare-and-set on status. Returns `None` when the stored status is no
    /// longer `from`.
    async fn transition_payout(
        &self,
        id: Uuid,
        from: PayoutStatus,
        to: PayoutStatus,
        update: PayoutUpdate,
    ) -> RepoResult<Option<CommissionPayout>>;

    async fn payouts_for_referrer(&self, referrer_id: Uuid) -> RepoResult<Vec<CommissionPayout>>;

    async fn partner_balance(&self, partner_id: Uuid, currency: &str) -> RepoResult<PartnerBalance>;
}

#[async_trait]
pub trait NotificationRepo: Send + Sync {
    async fn insert_notification(&self, new: NewNotification) -> RepoResult<Notification>;

    async fn pending_notifications(&self, limit: i64) -> RepoResult<Vec<Notification>>;

    async fn notifications_for_user(&self, user_id: Uuid) -> RepoResult<Vec<Notification>>;

    async fn mark_notification_delivered(&self, id: Uuid) -> RepoResult<bool>;
}

#[async_trait]
pub trait WebhookRepo: Send + Sync {
    /// Records a delivery. A redelivery of a known (provider, event_id) bumps
    /// the attempt count and returns the existing entry.
    async fn record_webhook(&self, new: NewWebhookLogEntry) -> RepoResult<WebhookLogEntry>;

    async fn mark_webhook_processed(&self, id: Uuid) -> RepoResult<()>;

    async fn mark_webhook_failed(&self, id: Uuid, error: &str) -> RepoResult<()>;

    async fn find_webhook(&self, id: Uuid) -> RepoResult<Option<WebhookLogEntry>>;

    async fn failed_webhooks(&self, limit: i64) -> RepoResult<Vec<WebhookLogEntry>>;
}

/// Everything the services need from persistence
pub trait Store:
    PaymentRepo + AccessRepo + ReferralRepo + PayoutRepo + NotificationRepo + WebhookRepo
{
}

impl<T> Store for T where
    T: PaymentRepo + AccessRepo + ReferralRepo + PayoutRepo + NotificationRepo + WebhookRepo
{
}
