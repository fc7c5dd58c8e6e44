use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{CommissionPayout, NewPayout, PartnerBalance, PaymentMethod};
use crate::money;
use crate::repos::{PayoutGuard, PayoutInsert, Store};
use crate::services::payout_currency;

/// Partner-facing payout request body
#[derive(Debug, Clone, Deserialize)]
pub struct PayoutRequest {
    pub amount: Decimal,
    /// Defaults to the service's default currency
    #[serde(default)]
    pub currency: Option<String>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payment_details: serde_json::Value,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PayoutRequestOutcome {
    BelowMinimum { minimum: Decimal },
    OpenRequestExists { payout_id: Uuid },
    InsufficientBalance { available: Decimal },
    Created { payout: CommissionPayout },
}

impl PayoutRequestOutcome {
    /// Human-readable rejection reason, `None` for `Created`
    pub fn rejection_reason(&self) -> Option<String> {
        match self {
            PayoutRequestOutcome::BelowMinimum { minimum } => {
                Some(format!("Minimum payout amount is {}", minimum))
            }
            PayoutRequestOutcome::OpenRequestExists { payout_id } => Some(format!(
                "A pending payout request already exists ({})",
                payout_id
            )),
            PayoutRequestOutcome::InsufficientBalance { available } => {
                Some(format!("Insufficient balance: {} available", available))
            }
            PayoutRequestOutcome::Created { .. } => None,
        }
    }
}

/// Partner-initiated payouts against the earned-minus-requested ledger
pub struct PayoutRequestService {
    store: Arc<dyn Store>,
    minimum_payout: Decimal,
    default_currency: String,
}

impl PayoutRequestService {
    pub fn new(store: Arc<dyn Store>, minimum_payout: Decimal, default_currency: String) -> Self {
        Self {
            store,
            minimum_payout,
            default_currency,
        }
    }

    /// Ledger in `currency`; earnings in other currencies are not counted
    pub async fn balance(
        &self,
        partner_id: Uuid,
        currency: Option<&str>,
    ) -> Result<PartnerBalance, ServiceError> {
        let currency = payout_currency(currency, &self.default_currency)?;
        Ok(self.store.partner_balance(partner_id, &currency).await?)
    }

    /// Create a pending payout for the partner. The record waits for an
    /// operator dispatch; nothing is sent to a provider here.
    pub async fn request_payout(
        &self,
        partner_id: Uuid,
        request: PayoutRequest,
    ) -> Result<PayoutRequestOutcome, ServiceError> {
        if request.amount <= Decimal::ZERO {
            return Err(ServiceError::Validation("amount must be positive".to_string()));
        }
        let currency = payout_currency(request.currency.as_deref(), &self.default_currency)?;
        let scale = money::minor_unit_scale(&currency);
        if request.amount.normalize().scale() > scale {
            return Err(ServiceError::Validation(format!(
                "amount must have at most {} decimal places for {}",
                scale, currency
            )));
        }
        if request.amount < self.minimum_payout {
            return Ok(PayoutRequestOutcome::BelowMinimum {
                minimum: self.minimum_payout,
            });
        }

        let Some(period_start) = self
            .store
            .earliest_verified_conversion(partner_id, &currency)
            .await?
        else {
            return Ok(PayoutRequestOutcome::InsufficientBalance {
                available: Decimal::ZERO,
            });
        };

        let fees = money::fee_breakdown(&request.payment_method, request.amount, &currency);
        let new = NewPayout {
            referrer_id: partner_id,
            period_start,
            period_end: Utc::now(),
            currency,
            total_amount: fees.total,
            fee_amount: fees.fee,
            net_amount: fees.net,
            payment_method: request.payment_method,
            payment_details: request.payment_details,
            notes: request.notes,
            requeued_from: None,
        };

        let outcome = match self.store.insert_payout(new, PayoutGuard::NoOpenPayout).await? {
            PayoutInsert::Created(payout) => {
                tracing::info!(
                    payout_id = %payout.id,
                    partner_id = %partner_id,
                    amount = %payout.total_amount,
                    currency = %payout.currency,
                    "Partner payout requested"
                );
                PayoutRequestOutcome::Created { payout }
            }
            PayoutInsert::OpenPayoutExists { existing_id }
            | PayoutInsert::DuplicatePeriod { existing_id } => PayoutRequestOutcome::OpenRequestExists {
                payout_id: existing_id,
            },
            PayoutInsert::InsufficientBalance { available } => {
                PayoutRequestOutcome::InsufficientBalance { available }
            }
        };

        if let Some(reason) = outcome.rejection_reason() {
            tracing::info!(partner_id = %partner_id, reason = %reason, "Partner payout request rejected");
        }
        Ok(outcome)
    }
}
