//! Postgres implementation of the store traits
//!
//! Idempotency and duplicate suppression rest on the unique constraints in
//! `db/migrations`; payout creation additionally takes a per-referrer advisory
//! lock so the balance check and the insert see a consistent ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use super::{
    AccessRepo, NotificationRepo, PaymentRepo, PayoutGuard, PayoutInsert, PayoutRepo,
    ReferralRepo, RepoError, RepoResult, Upserted, WebhookRepo,
};
use crate::models::{
    CommissionPayout, NewConversion, NewNotification, NewPayment, NewPayout, NewReferral,
    NewWebhookLogEntry, Notification, NotificationKind, PartnerBalance, Payment, PaymentMethod,
    PaymentStatus, PayoutStatus, PayoutUnit, PayoutUpdate, ProductAccessGrant, Provider, Referral,
    ReferralConversion, WebhookLogEntry, WebhookStatus,
};

const PAYMENT_COLUMNS: &str = "id, user_id, product_id, shop_id, amount, currency, status, provider, \
     provider_payment_id, referral_code, metadata, created_at, updated_at";

const GRANT_COLUMNS: &str =
    "id, user_id, product_id, purchase_id, download_count, expires_at, revoked_at, created_at";

const REFERRAL_COLUMNS: &str =
    "id, referrer_id, product_id, shop_id, commission_percent, code, active, created_at";

const CONVERSION_COLUMNS: &str = "id, referral_id, referrer_id, purchase_id, purchase_amount, \
     commission_amount, currency, verified, created_at";

const PAYOUT_COLUMNS: &str = "id, referrer_id, period_start, period_end, currency, total_amount, \
     fee_amount, net_amount, status, payment_method, payment_details, notes, \
     external_transaction_id, failure_reason, requeued_from, created_at, updated_at";

const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, payload, created_at, delivered_at";

const WEBHOOK_COLUMNS: &str = "id, provider, event_id, event_type, order_ref, status, error, \
     payload, attempt_count, received_at, processed_at";

/// Store implementation backed by a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// ROW TYPES
// ============================================================================

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    product_id: Uuid,
    shop_id: Option<Uuid>,
    amount: Decimal,
    currency: String,
    status: String,
    provider: String,
    provider_payment_id: Option<String>,
    referral_code: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = RepoError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            user_id: row.user_id,
            product_id: row.product_id,
            shop_id: row.shop_id,
            amount: row.amount,
            currency: row.currency,
            status: PaymentStatus::from_str(&row.status)
                .ok_or_else(|| RepoError::Decode(format!("payment status {}", row.status)))?,
            provider: Provider::from_str(&row.provider)
                .ok_or_else(|| RepoError::Decode(format!("provider {}", row.provider)))?,
            provider_payment_id: row.provider_payment_id,
            referral_code: row.referral_code,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct GrantRow {
    id: Uuid,
    user_id: Uuid,
    product_id: Uuid,
    purchase_id: Uuid,
    download_count: i32,
    expires_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<GrantRow> for ProductAccessGrant {
    fn from(row: GrantRow) -> Self {
        ProductAccessGrant {
            id: row.id,
            user_id: row.user_id,
            product_id: row.product_id,
            purchase_id: row.purchase_id,
            download_count: row.download_count,
            expires_at: row.expires_at,
            revoked_at: row.revoked_at,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct ReferralRow {
    id: Uuid,
    referrer_id: Uuid,
    product_id: Option<Uuid>,
    shop_id: Option<Uuid>,
    commission_percent: Decimal,
    code: String,
    active: bool,
    created_at: DateTime<Utc>,
}

impl From<ReferralRow> for Referral {
    fn from(row: ReferralRow) -> Self {
        Referral {
            id: row.id,
            referrer_id: row.referrer_id,
            product_id: row.product_id,
            shop_id: row.shop_id,
            commission_percent: row.commission_percent,
            code: row.code,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct ConversionRow {
    id: Uuid,
    referral_id: Uuid,
    referrer_id: Uuid,
    purchase_id: Uuid,
    purchase_amount: Decimal,
    commission_amount: Decimal,
    currency: String,
    verified: bool,
    created_at: DateTime<Utc>,
}

impl From<ConversionRow> for ReferralConversion {
    fn from(row: ConversionRow) -> Self {
        ReferralConversion {
            id: row.id,
            referral_id: row.referral_id,
            referrer_id: row.referrer_id,
            purchase_id: row.purchase_id,
            purchase_amount: row.purchase_amount,
            commission_amount: row.commission_amount,
            currency: row.currency,
            verified: row.verified,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct PayoutRow {
    id: Uuid,
    referrer_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    currency: String,
    total_amount: Decimal,
    fee_amount: Decimal,
    net_amount: Decimal,
    status: String,
    payment_method: String,
    payment_details: serde_json::Value,
    notes: Option<String>,
    external_transaction_id: Option<String>,
    failure_reason: Option<String>,
    requeued_from: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PayoutRow> for CommissionPayout {
    type Error = RepoError;

    fn try_from(row: PayoutRow) -> Result<Self, Self::Error> {
        Ok(CommissionPayout {
            id: row.id,
            referrer_id: row.referrer_id,
            period_start: row.period_start,
            period_end: row.period_end,
            currency: row.currency,
            total_amount: row.total_amount,
            fee_amount: row.fee_amount,
            net_amount: row.net_amount,
            status: PayoutStatus::from_str(&row.status)
                .ok_or_else(|| RepoError::Decode(format!("payout status {}", row.status)))?,
            payment_method: PaymentMethod::from(row.payment_method),
            payment_details: row.payment_details,
            notes: row.notes,
            external_transaction_id: row.external_transaction_id,
            failure_reason: row.failure_reason,
            requeued_from: row.requeued_from,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct NotificationRow {
    id: Uuid,
    user_id: Uuid,
    kind: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = RepoError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            user_id: row.user_id,
            kind: NotificationKind::from_str(&row.kind)
                .ok_or_else(|| RepoError::Decode(format!("notification kind {}", row.kind)))?,
            payload: row.payload,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
        })
    }
}

#[derive(FromRow)]
struct WebhookRow {
    id: Uuid,
    provider: String,
    event_id: Option<String>,
    event_type: Option<String>,
    order_ref: Option<String>,
    status: String,
    error: Option<String>,
    payload: serde_json::Value,
    attempt_count: i32,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WebhookRow> for WebhookLogEntry {
    type Error = RepoError;

    fn try_from(row: WebhookRow) -> Result<Self, Self::Error> {
        Ok(WebhookLogEntry {
            id: row.id,
            provider: Provider::from_str(&row.provider)
                .ok_or_else(|| RepoError::Decode(format!("provider {}", row.provider)))?,
            event_id: row.event_id,
            event_type: row.event_type,
            order_ref: row.order_ref,
            status: WebhookStatus::from_str(&row.status)
                .ok_or_else(|| RepoError::Decode(format!("webhook status {}", row.status)))?,
            error: row.error,
            payload: row.payload,
            attempt_count: row.attempt_count,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

fn collect<R, T>(rows: Vec<R>) -> RepoResult<Vec<T>>
where
    T: TryFrom<R, Error = RepoError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Earned vs. requested ledger for one partner in one currency
async fn fetch_balance(
    conn: &mut PgConnection,
    partner_id: Uuid,
    currency: &str,
) -> Result<PartnerBalance, sqlx::Error> {
    let (total_earned, requested): (Decimal, Decimal) = sqlx::query_as(
        r#"
        SELECT
            COALESCE((
                SELECT SUM(commission_amount)
                FROM referral_conversions
                WHERE referrer_id = $1 AND currency = $2 AND verified
            ), 0) AS total_earned,
            COALESCE((
                SELECT SUM(total_amount)
                FROM commission_payouts
                WHERE referrer_id = $1 AND currency = $2 AND status <> 'failed'
            ), 0) AS requested
        "#,
    )
    .bind(partner_id)
    .bind(currency)
    .fetch_one(conn)
    .await?;

    Ok(PartnerBalance {
        partner_id,
        currency: currency.to_string(),
        total_earned,
        requested,
        available: (total_earned - requested).max(Decimal::ZERO),
    })
}

// ============================================================================
// PAYMENTS
// ============================================================================

#[async_trait]
impl PaymentRepo for PgStore {
    async fn insert_payment(&self, new: NewPayment) -> RepoResult<Payment> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            INSERT INTO payments (id, user_id, product_id, shop_id, amount, currency, status, provider, referral_code)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.product_id)
        .bind(new.shop_id)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.provider.as_str())
        .bind(&new.referral_code)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn find_payment(&self, id: Uuid) -> RepoResult<Option<Payment>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        next: PaymentStatus,
        provider_payment_id: Option<String>,
        metadata: serde_json::Value,
    ) -> RepoResult<Option<Payment>> {
        // jsonb || only merges objects
        let metadata = if metadata.is_object() {
            metadata
        } else {
            serde_json::json!({})
        };

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            UPDATE payments
            SET status = $3,
                provider_payment_id = COALESCE($4, provider_payment_id),
                metadata = metadata || $5,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(provider_payment_id)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn succeeded_payments_without_grant(&self, limit: i64) -> RepoResult<Vec<Payment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments p
            WHERE p.status = 'succeeded'
              AND NOT EXISTS (
                  SELECT 1 FROM product_access_grants g WHERE g.purchase_id = p.id
              )
            ORDER BY p.updated_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }
}

// ============================================================================
// ACCESS GRANTS
// ============================================================================

#[async_trait]
impl AccessRepo for PgStore {
    async fn insert_grant_if_absent(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        purchase_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> RepoResult<Upserted<ProductAccessGrant>> {
        let inserted = sqlx::query_as::<_, GrantRow>(&format!(
            r#"
            INSERT INTO product_access_grants (id, user_id, product_id, purchase_id, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, product_id, purchase_id) DO NOTHING
            RETURNING {GRANT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(product_id)
        .bind(purchase_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(Upserted {
                value: row.into(),
                created: true,
            });
        }

        let existing = sqlx::query_as::<_, GrantRow>(&format!(
            r#"
            SELECT {GRANT_COLUMNS}
            FROM product_access_grants
            WHERE user_id = $1 AND product_id = $2 AND purchase_id = $3
            "#
        ))
        .bind(user_id)
        .bind(product_id)
        .bind(purchase_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Upserted {
            value: existing.into(),
            created: false,
        })
    }

    async fn find_grant(&self, id: Uuid) -> RepoResult<Option<ProductAccessGrant>> {
        let row = sqlx::query_as::<_, GrantRow>(&format!(
            "SELECT {GRANT_COLUMNS} FROM product_access_grants WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn grants_for_purchase(&self, purchase_id: Uuid) -> RepoResult<Vec<ProductAccessGrant>> {
        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            "SELECT {GRANT_COLUMNS} FROM product_access_grants WHERE purchase_id = $1"
        ))
        .bind(purchase_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn revoke_grants_for_purchase(&self, purchase_id: Uuid) -> RepoResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE product_access_grants
            SET revoked_at = NOW()
            WHERE purchase_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(purchase_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn increment_download(&self, grant_id: Uuid) -> RepoResult<Option<ProductAccessGrant>> {
        let row = sqlx::query_as::<_, GrantRow>(&format!(
            r#"
            UPDATE product_access_grants
            SET download_count = download_count + 1
            WHERE id = $1
              AND revoked_at IS NULL
              AND (expires_at IS NULL OR expires_at > NOW())
            RETURNING {GRANT_COLUMNS}
            "#
        ))
        .bind(grant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }
}

// ============================================================================
// REFERRALS & CONVERSIONS
// ============================================================================

#[async_trait]
impl ReferralRepo for PgStore {
    async fn insert_referral(&self, new: NewReferral) -> RepoResult<Referral> {
        let result = sqlx::query_as::<_, ReferralRow>(&format!(
            r#"
            INSERT INTO referrals (id, referrer_id, product_id, shop_id, commission_percent, code)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {REFERRAL_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.referrer_id)
        .bind(new.product_id)
        .bind(new.shop_id)
        .bind(new.commission_percent)
        .bind(&new.code)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.into()),
            Err(e) if is_unique_violation(&e) => Err(RepoError::Conflict(format!(
                "active referral code {} already exists",
                new.code
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_active_referral(
        &self,
        code: &str,
        product_id: Uuid,
        shop_id: Option<Uuid>,
    ) -> RepoResult<Option<Referral>> {
        let row = sqlx::query_as::<_, ReferralRow>(&format!(
            r#"
            SELECT {REFERRAL_COLUMNS}
            FROM referrals
            WHERE code = $1
              AND active
              AND (product_id = $2 OR (shop_id IS NOT NULL AND shop_id = $3))
            LIMIT 1
            "#
        ))
        .bind(code)
        .bind(product_id)
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn deactivate_referral(&self, id: Uuid) -> RepoResult<bool> {
        let result = sqlx::query("UPDATE referrals SET active = FALSE WHERE id = $1 AND active")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_conversion_if_absent(
        &self,
        new: NewConversion,
    ) -> RepoResult<Upserted<ReferralConversion>> {
        let inserted = sqlx::query_as::<_, ConversionRow>(&format!(
            r#"
            INSERT INTO referral_conversions (
                id, referral_id, referrer_id, purchase_id,
                purchase_amount, commission_amount, currency, verified
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)
            ON CONFLICT (referral_id, purchase_id) DO NOTHING
            RETURNING {CONVERSION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.referral_id)
        .bind(new.referrer_id)
        .bind(new.purchase_id)
        .bind(new.purchase_amount)
        .bind(new.commission_amount)
        .bind(&new.currency)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(Upserted {
                value: row.into(),
                created: true,
            });
        }

        let existing = sqlx::query_as::<_, ConversionRow>(&format!(
            r#"
            SELECT {CONVERSION_COLUMNS}
            FROM referral_conversions
            WHERE referral_id = $1 AND purchase_id = $2
            "#
        ))
        .bind(new.referral_id)
        .bind(new.purchase_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Upserted {
            value: existing.into(),
            created: false,
        })
    }

    async fn conversions_for_purchase(&self, purchase_id: Uuid) -> RepoResult<Vec<ReferralConversion>> {
        let rows = sqlx::query_as::<_, ConversionRow>(&format!(
            "SELECT {CONVERSION_COLUMNS} FROM referral_conversions WHERE purchase_id = $1"
        ))
        .bind(purchase_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn void_conversions_for_purchase(&self, purchase_id: Uuid) -> RepoResult<u64> {
        let result = sqlx::query(
            "UPDATE referral_conversions SET verified = FALSE WHERE purchase_id = $1 AND verified",
        )
        .bind(purchase_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn verified_commission_total(
        &self,
        referrer_id: Uuid,
        currency: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> RepoResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(commission_amount), 0)
            FROM referral_conversions
            WHERE referrer_id = $1
              AND currency = $2
              AND verified
              AND created_at >= $3
              AND created_at <= $4
            "#,
        )
        .bind(referrer_id)
        .bind(currency)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn payout_units(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> RepoResult<Vec<PayoutUnit>> {
        let units: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT referrer_id, currency
            FROM referral_conversions
            WHERE verified
              AND created_at >= $1
              AND created_at <= $2
            ORDER BY referrer_id, currency
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await?;

        Ok(units
            .into_iter()
            .map(|(referrer_id, currency)| PayoutUnit {
                referrer_id,
                currency,
            })
            .collect())
    }

    async fn earliest_verified_conversion(
        &self,
        referrer_id: Uuid,
        currency: &str,
    ) -> RepoResult<Option<DateTime<Utc>>> {
        let earliest: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MIN(created_at)
            FROM referral_conversions
            WHERE referrer_id = $1 AND currency = $2 AND verified
            "#,
        )
        .bind(referrer_id)
        .bind(currency)
        .fetch_one(&self.pool)
        .await?;

        Ok(earliest)
    }
}

// ============================================================================
// PAYOUTS
// ============================================================================

#[async_trait]
impl PayoutRepo for PgStore {
    async fn insert_payout(&self, new: NewPayout, guard: PayoutGuard) -> RepoResult<PayoutInsert> {
        let mut tx = self.pool.begin().await?;

        // Serialize payout creation per referrer for the rest of the transaction
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(new.referrer_id.to_string())
            .execute(&mut *tx)
            .await?;

        let duplicate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM commission_payouts
            WHERE referrer_id = $1 AND period_start = $2 AND period_end = $3
              AND currency = $4 AND status <> 'failed'
            LIMIT 1
            "#,
        )
        .bind(new.referrer_id)
        .bind(new.period_start)
        .bind(new.period_end)
        .bind(&new.currency)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(existing_id) = duplicate {
            tx.rollback().await?;
            return Ok(PayoutInsert::DuplicatePeriod { existing_id });
        }

        if guard == PayoutGuard::NoOpenPayout {
            let open: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT id FROM commission_payouts
                WHERE referrer_id = $1 AND currency = $2
                  AND status IN ('pending', 'processing')
                ORDER BY created_at ASC
                LIMIT 1
                "#,
            )
            .bind(new.referrer_id)
            .bind(&new.currency)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(existing_id) = open {
                tx.rollback().await?;
                return Ok(PayoutInsert::OpenPayoutExists { existing_id });
            }
        }

        let balance = fetch_balance(&mut tx, new.referrer_id, &new.currency).await?;
        if new.total_amount > balance.available {
            tx.rollback().await?;
            return Ok(PayoutInsert::InsufficientBalance {
                available: balance.available,
            });
        }

        let inserted = sqlx::query_as::<_, PayoutRow>(&format!(
            r#"
            INSERT INTO commission_payouts (
                id, referrer_id, period_start, period_end, currency,
                total_amount, fee_amount, net_amount, status,
                payment_method, payment_details, notes, requeued_from
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10, $11, $12)
            RETURNING {PAYOUT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.referrer_id)
        .bind(new.period_start)
        .bind(new.period_end)
        .bind(&new.currency)
        .bind(new.total_amount)
        .bind(new.fee_amount)
        .bind(new.net_amount)
        .bind(new.payment_method.as_str())
        .bind(&new.payment_details)
        .bind(&new.notes)
        .bind(new.requeued_from)
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(row) => {
                tx.commit().await?;
                Ok(PayoutInsert::Created(row.try_into()?))
            }
            Err(e) if is_unique_violation(&e) => {
                // Lost a race the advisory lock did not cover; report the winner
                tx.rollback().await?;
                let existing_id: Uuid = sqlx::query_scalar(
                    r#"
                    SELECT id FROM commission_payouts
                    WHERE referrer_id = $1 AND period_start = $2 AND period_end = $3
                      AND currency = $4 AND status <> 'failed'
                    "#,
                )
                .bind(new.referrer_id)
                .bind(new.period_start)
                .bind(new.period_end)
                .bind(&new.currency)
                .fetch_one(&self.pool)
                .await?;
                Ok(PayoutInsert::DuplicatePeriod { existing_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_payout(&self, id: Uuid) -> RepoResult<Option<CommissionPayout>> {
        let row = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM commission_payouts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CommissionPayout::try_from).transpose()
    }

    async fn transition_payout(
        &self,
        id: Uuid,
        from: PayoutStatus,
        to: PayoutStatus,
        update: PayoutUpdate,
    ) -> RepoResult<Option<CommissionPayout>> {
        let row = sqlx::query_as::<_, PayoutRow>(&format!(
            r#"
            UPDATE commission_payouts
            SET status = $3,
                external_transaction_id = COALESCE($4, external_transaction_id),
                failure_reason = COALESCE($5, failure_reason),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {PAYOUT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(update.external_transaction_id)
        .bind(update.failure_reason)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CommissionPayout::try_from).transpose()
    }

    async fn payouts_for_referrer(&self, referrer_id: Uuid) -> RepoResult<Vec<CommissionPayout>> {
        let rows = sqlx::query_as::<_, PayoutRow>(&format!(
            r#"
            SELECT {PAYOUT_COLUMNS}
            FROM commission_payouts
            WHERE referrer_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn partner_balance(&self, partner_id: Uuid, currency: &str) -> RepoResult<PartnerBalance> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_balance(&mut conn, partner_id, currency).await?)
    }
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

#[async_trait]
impl NotificationRepo for PgStore {
    async fn insert_notification(&self, new: NewNotification) -> RepoResult<Notification> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            INSERT INTO notifications (id, user_id, kind, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.kind.as_str())
        .bind(&new.payload)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn pending_notifications(&self, limit: i64) -> RepoResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE delivered_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn notifications_for_user(&self, user_id: Uuid) -> RepoResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn mark_notification_delivered(&self, id: Uuid) -> RepoResult<bool> {
        let result = sqlx::query(
            "UPDATE notifications SET delivered_at = NOW() WHERE id = $1 AND delivered_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// WEBHOOK LOG
// ============================================================================

#[async_trait]
impl WebhookRepo for PgStore {
    async fn record_webhook(&self, new: NewWebhookLogEntry) -> RepoResult<WebhookLogEntry> {
        let row = sqlx::query_as::<_, WebhookRow>(&format!(
            r#"
            INSERT INTO webhook_events (id, provider, event_id, event_type, order_ref, status, payload)
            VALUES ($1, $2, $3, $4, $5, 'received', $6)
            ON CONFLICT (provider, event_id) WHERE event_id IS NOT NULL
            DO UPDATE SET attempt_count = webhook_events.attempt_count + 1
            RETURNING {WEBHOOK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.provider.as_str())
        .bind(&new.event_id)
        .bind(&new.event_type)
        .bind(&new.order_ref)
        .bind(&new.payload)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn mark_webhook_processed(&self, id: Uuid) -> RepoResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processed', error = NULL, processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_webhook_failed(&self, id: Uuid, error: &str) -> RepoResult<()> {
        sqlx::query("UPDATE webhook_events SET status = 'failed', error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn find_webhook(&self, id: Uuid) -> RepoResult<Option<WebhookLogEntry>> {
        let row = sqlx::query_as::<_, WebhookRow>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookLogEntry::try_from).transpose()
    }

    async fn failed_webhooks(&self, limit: i64) -> RepoResult<Vec<WebhookLogEntry>> {
        let rows = sqlx::query_as::<_, WebhookRow>(&format!(
            r#"
            SELECT {WEBHOOK_COLUMNS}
            FROM webhook_events
            WHERE status = 'failed'
            ORDER BY received_at DESC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }
}
