//! Commission payout aggregation
//!
//! Sums verified commissions per referrer and currency over a period and turns
//! them into exactly one payout record. Amounts in different currencies are
//! never added together. Duplicate suppression, the balance check and the
//! insert happen atomically inside the store.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{CommissionPayout, NewPayout, PaymentMethod, PayoutUnit};
use crate::money;
use crate::repos::{PayoutGuard, PayoutInsert, Store};
use crate::services::dispatcher::{DispatchOutcome, PayoutDispatcher};
use crate::services::payout_currency;

/// Structured result of one aggregation; rejections are not errors
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AggregateOutcome {
    BelowMinimum { total: Decimal },
    AlreadyExists { payout_id: Uuid },
    InsufficientBalance { total: Decimal, available: Decimal },
    Created { payout: CommissionPayout },
}

/// Input of a single-referrer aggregation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Defaults to the service's default currency
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub minimum_payout: Option<Decimal>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payment_details: serde_json::Value,
}

/// Operator/cron input of a bulk run
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPayoutRequest {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(default)]
    pub minimum_payout: Option<Decimal>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payment_details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkDetailStatus {
    Processed,
    Skipped,
    Failed,
}

/// Audit entry for one referrer of a bulk run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPayoutDetail {
    pub referrer_id: Uuid,
    pub currency: String,
    pub status: BulkDetailStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPayoutSummary {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Paid totals keyed by currency
    pub total_amount: BTreeMap<String, Decimal>,
    pub details: Vec<BulkPayoutDetail>,
}

pub struct PayoutAggregator {
    store: Arc<dyn Store>,
    dispatcher: Arc<PayoutDispatcher>,
    default_minimum: Decimal,
    default_currency: String,
    concurrency: usize,
}

impl PayoutAggregator {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<PayoutDispatcher>,
        default_minimum: Decimal,
        default_currency: String,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            dispatcher,
            default_minimum,
            default_currency,
            concurrency: concurrency.max(1),
        }
    }

    pub fn default_minimum(&self) -> Decimal {
        self.default_minimum
    }

    /// Validated `requested` code, or the default currency
    pub fn currency(&self, requested: Option<&str>) -> Result<String, ServiceError> {
        payout_currency(requested, &self.default_currency)
    }

    /// Aggregate one referrer's earnings in `currency` and enqueue the created
    /// payout for dispatch
    pub async fn aggregate(
        &self,
        referrer_id: Uuid,
        currency: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        minimum_payout: Decimal,
        payment_method: PaymentMethod,
        payment_details: serde_json::Value,
    ) -> Result<AggregateOutcome, ServiceError> {
        let outcome = self
            .create_payout(
                referrer_id,
                currency,
                period_start,
                period_end,
                minimum_payout,
                payment_method,
                payment_details,
            )
            .await?;

        if let AggregateOutcome::Created { payout } = &outcome {
            self.dispatcher.queue().enqueue(payout.id).await;
        }
        Ok(outcome)
    }

    async fn create_payout(
        &self,
        referrer_id: Uuid,
        currency: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        minimum_payout: Decimal,
        payment_method: PaymentMethod,
        payment_details: serde_json::Value,
    ) -> Result<AggregateOutcome, ServiceError> {
        if period_start > period_end {
            return Err(ServiceError::Validation(
                "period_start must not be after period_end".to_string(),
            ));
        }
        if minimum_payout < Decimal::ZERO {
            return Err(ServiceError::Validation(
                "minimum payout must not be negative".to_string(),
            ));
        }

        let total = self
            .store
            .verified_commission_total(referrer_id, currency, period_start, period_end)
            .await?;

        if total < minimum_payout || total <= Decimal::ZERO {
            tracing::debug!(
                referrer_id = %referrer_id,
                currency = %currency,
                total = %total,
                minimum = %minimum_payout,
                "Commissions below minimum payout"
            );
            return Ok(AggregateOutcome::BelowMinimum { total });
        }

        let fees = money::fee_breakdown(&payment_method, total, currency);
        let new = NewPayout {
            referrer_id,
            period_start,
            period_end,
            currency: currency.to_string(),
            total_amount: fees.total,
            fee_amount: fees.fee,
            net_amount: fees.net,
            payment_method,
            payment_details,
            notes: None,
            requeued_from: None,
        };

        match self.store.insert_payout(new, PayoutGuard::UniquePeriod).await? {
            PayoutInsert::Created(payout) => {
                tracing::info!(
                    payout_id = %payout.id,
                    referrer_id = %referrer_id,
                    currency = %payout.currency,
                    total = %payout.total_amount,
                    fee = %payout.fee_amount,
                    net = %payout.net_amount,
                    "Commission payout created"
                );
                Ok(AggregateOutcome::Created { payout })
            }
            PayoutInsert::DuplicatePeriod { existing_id }
            | PayoutInsert::OpenPayoutExists { existing_id } => {
                tracing::info!(
                    referrer_id = %referrer_id,
                    payout_id = %existing_id,
                    "Payout already exists for period"
                );
                Ok(AggregateOutcome::AlreadyExists {
                    payout_id: existing_id,
                })
            }
            PayoutInsert::InsufficientBalance { available } => {
                tracing::info!(
                    referrer_id = %referrer_id,
                    total = %total,
                    available = %available,
                    "Period total exceeds available balance"
                );
                Ok(AggregateOutcome::InsufficientBalance { total, available })
            }
        }
    }

    /// Aggregate and dispatch every (referrer, currency) pair with verified
    /// conversions in the period. Units run with bounded parallelism; one
    /// unit's failure is recorded in its detail entry and never stops the batch.
    pub async fn aggregate_all(&self, request: BulkPayoutRequest) -> Result<BulkPayoutSummary, ServiceError> {
        if request.period_start > request.period_end {
            return Err(ServiceError::Validation(
                "periodStart must not be after periodEnd".to_string(),
            ));
        }
        let minimum = request.minimum_payout.unwrap_or(self.default_minimum);

        let units = self
            .store
            .payout_units(request.period_start, request.period_end)
            .await?;

        tracing::info!(
            units = units.len(),
            period_start = %request.period_start,
            period_end = %request.period_end,
            minimum = %minimum,
            "Starting bulk payout run"
        );

        let request = &request;
        let details: Vec<BulkPayoutDetail> = stream::iter(units)
            .map(|unit| {
                let span = tracing::info_span!(
                    "payout_unit",
                    referrer_id = %unit.referrer_id,
                    currency = %unit.currency
                );
                self.run_unit(unit, request, minimum).instrument(span)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = BulkPayoutSummary {
            total: details.len(),
            processed: 0,
            skipped: 0,
            failed: 0,
            total_amount: BTreeMap::new(),
            details: Vec::with_capacity(details.len()),
        };
        for detail in details {
            match detail.status {
                BulkDetailStatus::Processed => {
                    summary.processed += 1;
                    *summary
                        .total_amount
                        .entry(detail.currency.clone())
                        .or_insert(Decimal::ZERO) += detail.amount.unwrap_or_default();
                }
                BulkDetailStatus::Skipped => summary.skipped += 1,
                BulkDetailStatus::Failed => summary.failed += 1,
            }
            summary.details.push(detail);
        }

        tracing::info!(
            total = summary.total,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            total_amount = ?summary.total_amount,
            "Bulk payout run finished"
        );
        Ok(summary)
    }

    async fn run_unit(
        &self,
        unit: PayoutUnit,
        request: &BulkPayoutRequest,
        minimum: Decimal,
    ) -> BulkPayoutDetail {
        let PayoutUnit {
            referrer_id,
            currency,
        } = unit;
        let detail = |status: BulkDetailStatus,
                      payout_id: Option<Uuid>,
                      amount: Option<Decimal>,
                      reason: Option<String>| BulkPayoutDetail {
            referrer_id,
            currency: currency.clone(),
            status,
            payout_id,
            amount,
            reason,
        };

        let outcome = match self
            .create_payout(
                referrer_id,
                &currency,
                request.period_start,
                request.period_end,
                minimum,
                request.payment_method.clone(),
                request.payment_details.clone(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(referrer_id = %referrer_id, error = %e, "Payout aggregation failed");
                return detail(BulkDetailStatus::Failed, None, None, Some(e.to_string()));
            }
        };

        let payout = match outcome {
            AggregateOutcome::Created { payout } => payout,
            AggregateOutcome::BelowMinimum { total } => {
                return detail(
                    BulkDetailStatus::Skipped,
                    None,
                    Some(total),
                    Some("below minimum payout".to_string()),
                )
            }
            AggregateOutcome::AlreadyExists { payout_id } => {
                return detail(
                    BulkDetailStatus::Skipped,
                    Some(payout_id),
                    None,
                    Some("payout already exists for period".to_string()),
                )
            }
            AggregateOutcome::InsufficientBalance { total, available } => {
                return detail(
                    BulkDetailStatus::Skipped,
                    None,
                    Some(total),
                    Some(format!("insufficient balance (available {})", available)),
                )
            }
        };

        match self.dispatcher.dispatch(payout.id).await {
            Ok(DispatchOutcome::Paid(paid)) => detail(
                BulkDetailStatus::Processed,
                Some(paid.id),
                Some(paid.total_amount),
                None,
            ),
            Ok(DispatchOutcome::Failed { payout, reason }) => detail(
                BulkDetailStatus::Failed,
                Some(payout.id),
                Some(payout.total_amount),
                Some(reason),
            ),
            Err(e) => {
                tracing::error!(payout_id = %payout.id, error = %e, "Payout dispatch errored");
                detail(
                    BulkDetailStatus::Failed,
                    Some(payout.id),
                    Some(payout.total_amount),
                    Some(e.to_string()),
                )
            }
        }
    }
}
