//! Payout dispatch: pending -> processing -> {paid | failed}
//!
//! Every step is a compare-and-set in the store, so a payout can only move
//! forward. The provider call always runs under a timeout, and a failed
//! payout is never retried automatically; `requeue` is the explicit path.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::{CommissionPayout, NewPayout, PayoutStatus, PayoutUpdate};
use crate::providers::{ProviderError, ProviderRegistry};
use crate::repos::{PayoutGuard, PayoutInsert, Store};
use crate::services::notifier::Notifier;

/// Capacity of the dispatch channel
pub const DISPATCH_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Paid(CommissionPayout),
    Failed {
        payout: CommissionPayout,
        reason: String,
    },
}

impl DispatchOutcome {
    pub fn payout(&self) -> &CommissionPayout {
        match self {
            DispatchOutcome::Paid(payout) | DispatchOutcome::Failed { payout, .. } => payout,
        }
    }
}

/// Sending half of the dispatch queue
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<Uuid>,
}

/// Receiving half, drained by [`spawn_dispatch_worker`]
pub struct DispatchReceiver {
    rx: mpsc::Receiver<Uuid>,
}

pub fn dispatch_queue(capacity: usize) -> (DispatchQueue, DispatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (DispatchQueue { tx }, DispatchReceiver { rx })
}

impl DispatchQueue {
    /// Hand a pending payout to the worker. The payout stays `pending` (and
    /// can be dispatched by an operator) if the worker is gone.
    pub async fn enqueue(&self, payout_id: Uuid) {
        if self.tx.send(payout_id).await.is_err() {
            tracing::error!(payout_id = %payout_id, "Dispatch queue closed; payout left pending");
        } else {
            tracing::debug!(payout_id = %payout_id, "Payout enqueued for dispatch");
        }
    }
}

pub struct PayoutDispatcher {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    notifier: Notifier,
    queue: DispatchQueue,
    timeout: Duration,
}

impl PayoutDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        notifier: Notifier,
        queue: DispatchQueue,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            providers,
            notifier,
            queue,
            timeout,
        }
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Drive one pending payout through its provider
    pub async fn dispatch(&self, payout_id: Uuid) -> Result<DispatchOutcome, ServiceError> {
        let started = Instant::now();
        let processing = self
            .transition(payout_id, PayoutStatus::Pending, PayoutStatus::Processing, PayoutUpdate::default())
            .await?;

        tracing::info!(
            payout_id = %payout_id,
            referrer_id = %processing.referrer_id,
            method = %processing.payment_method,
            net_amount = %processing.net_amount,
            "Payout processing"
        );
        self.notifier.payout_processed(&processing).await;

        match self.transfer(&processing).await {
            Ok(transaction_id) => {
                let paid = self
                    .transition(
                        payout_id,
                        PayoutStatus::Processing,
                        PayoutStatus::Paid,
                        PayoutUpdate {
                            external_transaction_id: Some(transaction_id),
                            failure_reason: None,
                        },
                    )
                    .await?;
                tracing::info!(
                    payout_id = %payout_id,
                    transaction_id = ?paid.external_transaction_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Payout paid"
                );
                self.notifier.payout_completed(&paid).await;
                Ok(DispatchOutcome::Paid(paid))
            }
            Err(e) => {
                let reason = e.to_string();
                let failed = self
                    .transition(
                        payout_id,
                        PayoutStatus::Processing,
                        PayoutStatus::Failed,
                        PayoutUpdate {
                            external_transaction_id: None,
                            failure_reason: Some(reason.clone()),
                        },
                    )
                    .await?;
                tracing::warn!(
                    payout_id = %payout_id,
                    error = %reason,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Payout failed"
                );
                self.notifier.payout_failed(&failed, &reason).await;
                Ok(DispatchOutcome::Failed {
                    payout: failed,
                    reason,
                })
            }
        }
    }

    async fn transfer(&self, payout: &CommissionPayout) -> Result<String, ProviderError> {
        let provider = self
            .providers
            .for_method(&payout.payment_method)
            .ok_or_else(|| ProviderError::NotConfigured(payout.payment_method.to_string()))?;

        tracing::debug!(payout_id = %payout.id, provider = provider.name(), "Calling payout provider");
        match tokio::time::timeout(self.timeout, provider.transfer(payout)).await {
            Ok(result) => result.map(|receipt| receipt.transaction_id),
            Err(_) => Err(ProviderError::Timeout(self.timeout.as_secs())),
        }
    }

    async fn transition(
        &self,
        payout_id: Uuid,
        from: PayoutStatus,
        to: PayoutStatus,
        update: PayoutUpdate,
    ) -> Result<CommissionPayout, ServiceError> {
        if let Some(payout) = self.store.transition_payout(payout_id, from, to, update).await? {
            return Ok(payout);
        }

        let current = self
            .store
            .find_payout(payout_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("payout", payout_id))?;
        Err(ServiceError::IllegalPayoutTransition {
            payout_id,
            from: current.status,
            to,
        })
    }

    /// Create a fresh pending payout from a failed one and enqueue it.
    ///
    /// The failed record stays failed; the new one points back at it.
    pub async fn requeue(&self, failed_payout_id: Uuid) -> Result<CommissionPayout, ServiceError> {
        let failed = self
            .store
            .find_payout(failed_payout_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("payout", failed_payout_id))?;

        if failed.status != PayoutStatus::Failed {
            return Err(ServiceError::Validation(format!(
                "payout {} is {}; only failed payouts can be re-queued",
                failed.id, failed.status
            )));
        }

        let new = NewPayout {
            referrer_id: failed.referrer_id,
            period_start: failed.period_start,
            period_end: failed.period_end,
            currency: failed.currency.clone(),
            total_amount: failed.total_amount,
            fee_amount: failed.fee_amount,
            net_amount: failed.net_amount,
            payment_method: failed.payment_method.clone(),
            payment_details: failed.payment_details.clone(),
            notes: failed.notes.clone(),
            requeued_from: Some(failed.id),
        };

        match self.store.insert_payout(new, PayoutGuard::UniquePeriod).await? {
            PayoutInsert::Created(payout) => {
                tracing::info!(
                    payout_id = %payout.id,
                    requeued_from = %failed.id,
                    referrer_id = %payout.referrer_id,
                    "Failed payout re-queued"
                );
                self.queue.enqueue(payout.id).await;
                Ok(payout)
            }
            PayoutInsert::DuplicatePeriod { existing_id }
            | PayoutInsert::OpenPayoutExists { existing_id } => Err(ServiceError::Validation(format!(
                "payout {} already covers this period",
                existing_id
            ))),
            PayoutInsert::InsufficientBalance { available } => Err(ServiceError::Validation(format!(
                "available balance {} no longer covers {}",
                available, failed.total_amount
            ))),
        }
    }
}

/// Spawn the task that dispatches enqueued payouts one at a time
pub fn spawn_dispatch_worker(
    dispatcher: Arc<PayoutDispatcher>,
    receiver: DispatchReceiver,
) -> JoinHandle<()> {
    let mut rx = receiver.rx;
    tokio::spawn(async move {
        tracing::info!("Starting payout dispatch worker...");
        while let Some(payout_id) = rx.recv().await {
            if let Err(e) = dispatcher.dispatch(payout_id).await {
                // Usually an operator or bulk run dispatched it first
                tracing::warn!(payout_id = %payout_id, error = %e, "Queued dispatch skipped");
            }
        }
        tracing::info!("Payout dispatch worker stopped");
    })
}
