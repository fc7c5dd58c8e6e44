use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{NewConversion, NewReferral, Payment, PaymentStatus, Referral, ReferralConversion};
use crate::money;
use crate::repos::{RepoError, Store};

#[derive(Debug, Clone)]
pub enum CommissionOutcome {
    /// No active referral matches the code for this product or its shop
    NoReferral,
    /// The purchase is not confirmed; nothing is recorded for pending payments
    NotConfirmed,
    Recorded(ReferralConversion),
    /// A conversion for this referral and purchase already exists
    AlreadyRecorded(ReferralConversion),
}

/// Referral lookup and commission bookkeeping
#[derive(Clone)]
pub struct CommissionCalculator {
    store: Arc<dyn Store>,
}

impl CommissionCalculator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record the commission for a confirmed payment, if it carries a referral code
    pub async fn record_for_payment(&self, payment: &Payment) -> Result<CommissionOutcome, ServiceError> {
        if payment.status != PaymentStatus::Succeeded {
            return Ok(CommissionOutcome::NotConfirmed);
        }
        let Some(code) = payment.referral_code.as_deref() else {
            return Ok(CommissionOutcome::NoReferral);
        };

        self.compute_and_record(
            code,
            payment.product_id,
            payment.shop_id,
            payment.id,
            payment.amount,
            &payment.currency,
        )
        .await
    }

    /// Compute `amount * percent / 100` rounded half-up to the currency's
    /// minor unit and record it once as a verified conversion.
    ///
    /// The amount is fixed at this point; later changes to the referral's
    /// percent never touch recorded conversions.
    pub async fn compute_and_record(
        &self,
        referral_code: &str,
        product_id: Uuid,
        shop_id: Option<Uuid>,
        purchase_id: Uuid,
        purchase_amount: Decimal,
        currency: &str,
    ) -> Result<CommissionOutcome, ServiceError> {
        let Some(referral) = self
            .store
            .find_active_referral(referral_code, product_id, shop_id)
            .await?
        else {
            tracing::debug!(
                purchase_id = %purchase_id,
                referral_code = %referral_code,
                "No active referral for purchase"
            );
            return Ok(CommissionOutcome::NoReferral);
        };

        let commission_amount =
            money::percent_of(purchase_amount, referral.commission_percent, currency);

        let upserted = self
            .store
            .insert_conversion_if_absent(NewConversion {
                referral_id: referral.id,
                referrer_id: referral.referrer_id,
                purchase_id,
                purchase_amount,
                commission_amount,
                currency: currency.to_string(),
            })
            .await?;

        if upserted.created {
            tracing::info!(
                purchase_id = %purchase_id,
                referral_id = %referral.id,
                referrer_id = %referral.referrer_id,
                commission = %commission_amount,
                currency = %currency,
                "Referral commission recorded"
            );
            Ok(CommissionOutcome::Recorded(upserted.value))
        } else {
            Ok(CommissionOutcome::AlreadyRecorded(upserted.value))
        }
    }

    /// Un-verify the conversions of a refunded purchase so they drop out of
    /// future payouts and of the partner's available balance
    pub async fn void_for_purchase(&self, purchase_id: Uuid) -> Result<u64, ServiceError> {
        let voided = self.store.void_conversions_for_purchase(purchase_id).await?;
        if voided > 0 {
            tracing::info!(purchase_id = %purchase_id, voided, "Referral conversions voided");
        }
        Ok(voided)
    }

    pub async fn create_referral(&self, new: NewReferral) -> Result<Referral, ServiceError> {
        if new.product_id.is_none() && new.shop_id.is_none() {
            return Err(ServiceError::Validation(
                "referral must target a product or a shop".to_string(),
            ));
        }
        if new.commission_percent < Decimal::ZERO || new.commission_percent > Decimal::ONE_HUNDRED {
            return Err(ServiceError::Validation(
                "commission_percent must be between 0 and 100".to_string(),
            ));
        }
        if new.code.trim().is_empty() {
            return Err(ServiceError::Validation("code must not be empty".to_string()));
        }

        match self.store.insert_referral(new).await {
            Ok(referral) => Ok(referral),
            Err(RepoError::Conflict(msg)) => Err(ServiceError::Validation(msg)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn deactivate_referral(&self, referral_id: Uuid) -> Result<(), ServiceError> {
        if self.store.deactivate_referral(referral_id).await? {
            tracing::info!(referral_id = %referral_id, "Referral deactivated");
            Ok(())
        } else {
            Err(ServiceError::not_found("active referral", referral_id))
        }
    }
}
