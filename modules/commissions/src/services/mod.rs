pub mod access;
pub mod aggregator;
pub mod commission;
pub mod dispatcher;
pub mod notifier;
pub mod payment_tracker;
pub mod payout_requests;
pub mod reconciliation;

pub use access::AccessGranter;
pub use aggregator::{AggregateOutcome, BulkPayoutRequest, BulkPayoutSummary, PayoutAggregator};
pub use commission::{CommissionCalculator, CommissionOutcome};
pub use dispatcher::{DispatchOutcome, DispatchQueue, PayoutDispatcher};
pub use notifier::Notifier;
pub use payment_tracker::{PaymentTracker, StatusChange};
pub use payout_requests::{PayoutRequest, PayoutRequestOutcome, PayoutRequestService};
pub use reconciliation::{AccessReconciler, ReconcileReport};

use crate::error::ServiceError;

/// Currency a payout call runs in: the requested code, validated, or `default`
pub(crate) fn payout_currency(requested: Option<&str>, default: &str) -> Result<String, ServiceError> {
    match requested {
        None => Ok(default.to_string()),
        Some(code) => crate::money::normalize_currency(code).ok_or_else(|| {
            ServiceError::Validation(format!("currency {:?} is not a 3-letter code", code))
        }),
    }
}
