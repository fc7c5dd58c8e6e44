use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::ServiceError;
use crate::repos::Store;
use crate::services::access::AccessGranter;
use crate::services::commission::{CommissionCalculator, CommissionOutcome};

/// Payments examined per sweep
const SWEEP_BATCH: i64 = 500;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub granted: usize,
    pub commissions_recorded: usize,
    pub failed: usize,
}

/// Repairs succeeded payments that never got their access grant
pub struct AccessReconciler {
    store: Arc<dyn Store>,
    access: AccessGranter,
    commission: CommissionCalculator,
}

impl AccessReconciler {
    pub fn new(store: Arc<dyn Store>, access: AccessGranter, commission: CommissionCalculator) -> Self {
        Self {
            store,
            access,
            commission,
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport, ServiceError> {
        let payments = self.store.succeeded_payments_without_grant(SWEEP_BATCH).await?;
        let mut report = ReconcileReport {
            scanned: payments.len(),
            ..Default::default()
        };

        for payment in payments {
            if let Err(e) = self
                .access
                .grant(payment.user_id, payment.product_id, payment.id)
                .await
            {
                tracing::error!(purchase_id = %payment.id, error = %e, "Reconciliation grant failed");
                report.failed += 1;
                continue;
            }
            report.granted += 1;

            // The webhook may have failed before the commission step too
            match self.commission.record_for_payment(&payment).await {
                Ok(CommissionOutcome::Recorded(_)) => report.commissions_recorded += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(purchase_id = %payment.id, error = %e, "Reconciliation commission failed");
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            tracing::warn!(
                scanned = report.scanned,
                granted = report.granted,
                commissions_recorded = report.commissions_recorded,
                failed = report.failed,
                "Access reconciliation repaired missing grants"
            );
        }
        Ok(report)
    }
}

/// Run the sweep every `interval` until the process exits
pub fn spawn_reconciliation_task(reconciler: Arc<AccessReconciler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "Starting access reconciliation task...");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = reconciler.run().await {
                tracing::error!(error = %e, "Access reconciliation sweep failed");
            }
        }
    })
}
