//! In-memory implementation of the store traits for tests and local development
//!
//! All state sits behind one async mutex, so every trait method is atomic the
//! same way a single Postgres transaction would be.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AccessRepo, NotificationRepo, PaymentRepo, PayoutGuard, PayoutInsert, PayoutRepo,
    ReferralRepo, RepoError, RepoResult, Upserted, WebhookRepo,
};
use crate::models::{
    CommissionPayout, NewConversion, NewNotification, NewPayment, NewPayout, NewReferral,
    NewWebhookLogEntry, Notification, PartnerBalance, Payment, PaymentStatus, PayoutStatus,
    PayoutUnit, PayoutUpdate, ProductAccessGrant, Referral, ReferralConversion, WebhookLogEntry,
    WebhookStatus,
};

#[derive(Default)]
struct State {
    payments: HashMap<Uuid, Payment>,
    grants: Vec<ProductAccessGrant>,
    referrals: Vec<Referral>,
    conversions: Vec<ReferralConversion>,
    payouts: Vec<CommissionPayout>,
    notifications: Vec<Notification>,
    webhooks: Vec<WebhookLogEntry>,
}

impl State {
    fn balance(&self, partner_id: Uuid, currency: &str) -> PartnerBalance {
        let total_earned: Decimal = self
            .conversions
            .iter()
            .filter(|c| c.referrer_id == partner_id && c.verified && c.currency == currency)
            .map(|c| c.commission_amount)
            .sum();
        let requested: Decimal = self
            .payouts
            .iter()
            .filter(|p| {
                p.referrer_id == partner_id
                    && p.currency == currency
                    && p.status != PayoutStatus::Failed
            })
            .map(|p| p.total_amount)
            .sum();

        PartnerBalance {
            partner_id,
            currency: currency.to_string(),
            total_earned,
            requested,
            available: (total_earned - requested).max(Decimal::ZERO),
        }
    }
}

/// Store implementation using in-process collections
///
/// Suitable for unit/integration tests and for running the service without
/// Postgres (`STORE_TYPE=inmemory`). Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentRepo for InMemoryStore {
    async fn insert_payment(&self, new: NewPayment) -> RepoResult<Payment> {
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            product_id: new.product_id,
            shop_id: new.shop_id,
            amount: new.amount,
            currency: new.currency,
            status: PaymentStatus::Pending,
            provider: new.provider,
            provider_payment_id: None,
            referral_code: new.referral_code,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .payments
            .insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn find_payment(&self, id: Uuid) -> RepoResult<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&id).cloned())
    }

    async fn update_payment_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        next: PaymentStatus,
        provider_payment_id: Option<String>,
        metadata: serde_json::Value,
    ) -> RepoResult<Option<Payment>> {
        let mut state = self.state.lock().await;
        let Some(payment) = state.payments.get_mut(&id) else {
            return Ok(None);
        };
        if payment.status != expected {
            return Ok(None);
        }

        payment.status = next;
        if provider_payment_id.is_some() {
            payment.provider_payment_id = provider_payment_id;
        }
        merge_metadata(&mut payment.metadata, metadata);
        payment.updated_at = Utc::now();
        Ok(Some(payment.clone()))
    }

    async fn succeeded_payments_without_grant(&self, limit: i64) -> RepoResult<Vec<Payment>> {
        let state = self.state.lock().await;
        let mut missing: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Succeeded)
            .filter(|p| !state.grants.iter().any(|g| g.purchase_id == p.id))
            .cloned()
            .collect();
        missing.sort_by_key(|p| p.updated_at);
        missing.truncate(limit.max(0) as usize);
        Ok(missing)
    }
}

#[async_trait]
impl AccessRepo for InMemoryStore {
    async fn insert_grant_if_absent(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        purchase_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> RepoResult<Upserted<ProductAccessGrant>> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.grants.iter().find(|g| {
            g.user_id == user_id && g.product_id == product_id && g.purchase_id == purchase_id
        }) {
            return Ok(Upserted {
                value: existing.clone(),
                created: false,
            });
        }

        let grant = ProductAccessGrant {
            id: Uuid::new_v4(),
            user_id,
            product_id,
            purchase_id,
            download_count: 0,
            expires_at,
            revoked_at: None,
            created_at: Utc::now(),
        };
        state.grants.push(grant.clone());
        Ok(Upserted {
            value: grant,
            created: true,
        })
    }

    async fn find_grant(&self, id: Uuid) -> RepoResult<Option<ProductAccessGrant>> {
        let state = self.state.lock().await;
        Ok(state.grants.iter().find(|g| g.id == id).cloned())
    }

    async fn grants_for_purchase(&self, purchase_id: Uuid) -> RepoResult<Vec<ProductAccessGrant>> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .filter(|g| g.purchase_id == purchase_id)
            .cloned()
            .collect())
    }

    async fn revoke_grants_for_purchase(&self, purchase_id: Uuid) -> RepoResult<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut revoked = 0;
        for grant in state
            .grants
            .iter_mut()
            .filter(|g| g.purchase_id == purchase_id && g.revoked_at.is_none())
        {
            grant.revoked_at = Some(now);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn increment_download(&self, grant_id: Uuid) -> RepoResult<Option<ProductAccessGrant>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let Some(grant) = state
            .grants
            .iter_mut()
            .find(|g| g.id == grant_id && g.is_active(now))
        else {
            return Ok(None);
        };
        grant.download_count += 1;
        Ok(Some(grant.clone()))
    }
}

#[async_trait]
impl ReferralRepo for InMemoryStore {
    async fn insert_referral(&self, new: NewReferral) -> RepoResult<Referral> {
        let mut state = self.state.lock().await;
        if state.referrals.iter().any(|r| r.code == new.code && r.active) {
            return Err(RepoError::Conflict(format!(
                "active referral code {} already exists",
                new.code
            )));
        }

        let referral = Referral {
            id: Uuid::new_v4(),
            referrer_id: new.referrer_id,
            product_id: new.product_id,
            shop_id: new.shop_id,
            commission_percent: new.commission_percent,
            code: new.code,
            active: true,
            created_at: Utc::now(),
        };
        state.referrals.push(referral.clone());
        Ok(referral)
    }

    async fn find_active_referral(
        &self,
        code: &str,
        product_id: Uuid,
        shop_id: Option<Uuid>,
    ) -> RepoResult<Option<Referral>> {
        let state = self.state.lock().await;
        Ok(state
            .referrals
            .iter()
            .find(|r| r.active && r.code == code && r.covers(product_id, shop_id))
            .cloned())
    }

    async fn deactivate_referral(&self, id: Uuid) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        match state.referrals.iter_mut().find(|r| r.id == id && r.active) {
            Some(referral) => {
                referral.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_conversion_if_absent(
        &self,
        new: NewConversion,
    ) -> RepoResult<Upserted<ReferralConversion>> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .conversions
            .iter()
            .find(|c| c.referral_id == new.referral_id && c.purchase_id == new.purchase_id)
        {
            return Ok(Upserted {
                value: existing.clone(),
                created: false,
            });
        }

        let conversion = ReferralConversion {
            id: Uuid::new_v4(),
            referral_id: new.referral_id,
            referrer_id: new.referrer_id,
            purchase_id: new.purchase_id,
            purchase_amount: new.purchase_amount,
            commission_amount: new.commission_amount,
            currency: new.currency,
            verified: true,
            created_at: Utc::now(),
        };
        state.conversions.push(conversion.clone());
        Ok(Upserted {
            value: conversion,
            created: true,
        })
    }

    async fn conversions_for_purchase(&self, purchase_id: Uuid) -> RepoResult<Vec<ReferralConversion>> {
        let state = self.state.lock().await;
        Ok(state
            .conversions
            .iter()
            .filter(|c| c.purchase_id == purchase_id)
            .cloned()
            .collect())
    }

    async fn void_conversions_for_purchase(&self, purchase_id: Uuid) -> RepoResult<u64> {
        let mut state = self.state.lock().await;
        let mut voided = 0;
        for conversion in state
            .conversions
            .iter_mut()
            .filter(|c| c.purchase_id == purchase_id && c.verified)
        {
            conversion.verified = false;
            voided += 1;
        }
        Ok(voided)
    }

    async fn verified_commission_total(
        &self,
        referrer_id: Uuid,
        currency: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> RepoResult<Decimal> {
        let state = self.state.lock().await;
        Ok(state
            .conversions
            .iter()
            .filter(|c| {
                c.referrer_id == referrer_id
                    && c.verified
                    && c.currency == currency
                    && c.created_at >= period_start
                    && c.created_at <= period_end
            })
            .map(|c| c.commission_amount)
            .sum())
    }

    async fn payout_units(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> RepoResult<Vec<PayoutUnit>> {
        let state = self.state.lock().await;
        let mut units: Vec<PayoutUnit> = Vec::new();
        for c in state.conversions.iter().filter(|c| {
            c.verified && c.created_at >= period_start && c.created_at <= period_end
        }) {
            let unit = PayoutUnit {
                referrer_id: c.referrer_id,
                currency: c.currency.clone(),
            };
            if !units.contains(&unit) {
                units.push(unit);
            }
        }
        Ok(units)
    }

    async fn earliest_verified_conversion(
        &self,
        referrer_id: Uuid,
        currency: &str,
    ) -> RepoResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state
            .conversions
            .iter()
            .filter(|c| c.referrer_id == referrer_id && c.verified && c.currency == currency)
            .map(|c| c.created_at)
            .min())
    }
}

#[async_trait]
impl PayoutRepo for InMemoryStore {
    async fn insert_payout(&self, new: NewPayout, guard: PayoutGuard) -> RepoResult<PayoutInsert> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.payouts.iter().find(|p| {
            p.referrer_id == new.referrer_id
                && p.period_start == new.period_start
                && p.period_end == new.period_end
                && p.currency == new.currency
                && p.status != PayoutStatus::Failed
        }) {
            return Ok(PayoutInsert::DuplicatePeriod {
                existing_id: existing.id,
            });
        }

        if guard == PayoutGuard::NoOpenPayout {
            if let Some(open) = state.payouts.iter().find(|p| {
                p.referrer_id == new.referrer_id && p.currency == new.currency && p.status.is_open()
            })
            {
                return Ok(PayoutInsert::OpenPayoutExists {
                    existing_id: open.id,
                });
            }
        }

        let balance = state.balance(new.referrer_id, &new.currency);
        if new.total_amount > balance.available {
            return Ok(PayoutInsert::InsufficientBalance {
                available: balance.available,
            });
        }

        let now = Utc::now();
        let payout = CommissionPayout {
            id: Uuid::new_v4(),
            referrer_id: new.referrer_id,
            period_start: new.period_start,
            period_end: new.period_end,
            currency: new.currency,
            total_amount: new.total_amount,
            fee_amount: new.fee_amount,
            net_amount: new.net_amount,
            status: PayoutStatus::Pending,
            payment_method: new.payment_method,
            payment_details: new.payment_details,
            notes: new.notes,
            external_transaction_id: None,
            failure_reason: None,
            requeued_from: new.requeued_from,
            created_at: now,
            updated_at: now,
        };
        state.payouts.push(payout.clone());
        Ok(PayoutInsert::Created(payout))
    }

    async fn find_payout(&self, id: Uuid) -> RepoResult<Option<CommissionPayout>> {
        let state = self.state.lock().await;
        Ok(state.payouts.iter().find(|p| p.id == id).cloned())
    }

    async fn transition_payout(
        &self,
        id: Uuid,
        from: PayoutStatus,
        to: PayoutStatus,
        update: PayoutUpdate,
    ) -> RepoResult<Option<CommissionPayout>> {
        let mut state = self.state.lock().await;
        let Some(payout) = state
            .payouts
            .iter_mut()
            .find(|p| p.id == id && p.status == from)
        else {
            return Ok(None);
        };

        payout.status = to;
        if update.external_transaction_id.is_some() {
            payout.external_transaction_id = update.external_transaction_id;
        }
        if update.failure_reason.is_some() {
            payout.failure_reason = update.failure_reason;
        }
        payout.updated_at = Utc::now();
        Ok(Some(payout.clone()))
    }

    async fn payouts_for_referrer(&self, referrer_id: Uuid) -> RepoResult<Vec<CommissionPayout>> {
        let state = self.state.lock().await;
        Ok(state
            .payouts
            .iter()
            .filter(|p| p.referrer_id == referrer_id)
            .cloned()
            .collect())
    }

    async fn partner_balance(&self, partner_id: Uuid, currency: &str) -> RepoResult<PartnerBalance> {
        Ok(self.state.lock().await.balance(partner_id, currency))
    }
}

#[async_trait]
impl NotificationRepo for InMemoryStore {
    async fn insert_notification(&self, new: NewNotification) -> RepoResult<Notification> {
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            kind: new.kind,
            payload: new.payload,
            created_at: Utc::now(),
            delivered_at: None,
        };
        self.state
            .lock()
            .await
            .notifications
            .push(notification.clone());
        Ok(notification)
    }

    async fn pending_notifications(&self, limit: i64) -> RepoResult<Vec<Notification>> {
        let state = self.state.lock().await;
        Ok(state
            .notifications
            .iter()
            .filter(|n| n.delivered_at.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn notifications_for_user(&self, user_id: Uuid) -> RepoResult<Vec<Notification>> {
        let state = self.state.lock().await;
        Ok(state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn mark_notification_delivered(&self, id: Uuid) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        match state
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.delivered_at.is_none())
        {
            Some(n) => {
                n.delivered_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl WebhookRepo for InMemoryStore {
    async fn record_webhook(&self, new: NewWebhookLogEntry) -> RepoResult<WebhookLogEntry> {
        let mut state = self.state.lock().await;
        if let Some(event_id) = new.event_id.as_deref() {
            if let Some(existing) = state
                .webhooks
                .iter_mut()
                .find(|w| w.provider == new.provider && w.event_id.as_deref() == Some(event_id))
            {
                existing.attempt_count += 1;
                return Ok(existing.clone());
            }
        }

        let entry = WebhookLogEntry {
            id: Uuid::new_v4(),
            provider: new.provider,
            event_id: new.event_id,
            event_type: new.event_type,
            order_ref: new.order_ref,
            status: WebhookStatus::Received,
            error: None,
            payload: new.payload,
            attempt_count: 1,
            received_at: Utc::now(),
            processed_at: None,
        };
        state.webhooks.push(entry.clone());
        Ok(entry)
    }

    async fn mark_webhook_processed(&self, id: Uuid) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.webhooks.iter_mut().find(|w| w.id == id) {
            entry.status = WebhookStatus::Processed;
            entry.error = None;
            entry.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_webhook_failed(&self, id: Uuid, error: &str) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.webhooks.iter_mut().find(|w| w.id == id) {
            entry.status = WebhookStatus::Failed;
            entry.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn find_webhook(&self, id: Uuid) -> RepoResult<Option<WebhookLogEntry>> {
        let state = self.state.lock().await;
        Ok(state.webhooks.iter().find(|w| w.id == id).cloned())
    }

    async fn failed_webhooks(&self, limit: i64) -> RepoResult<Vec<WebhookLogEntry>> {
        let state = self.state.lock().await;
        let mut failed: Vec<WebhookLogEntry> = state
            .webhooks
            .iter()
            .filter(|w| w.status == WebhookStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }
}

/// Shallow merge of provider metadata into the stored object
pub(crate) fn merge_metadata(target: &mut serde_json::Value, incoming: serde_json::Value) {
    match (target.as_object_mut(), incoming) {
        (Some(existing), serde_json::Value::Object(new)) => {
            for (k, v) in new {
                existing.insert(k, v);
            }
        }
        (_, serde_json::Value::Null) => {}
        (_, other) => *target = other,
    }
}
