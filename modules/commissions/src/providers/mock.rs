use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use super::{PayoutProvider, ProviderError, TransferReceipt};
use crate::models::CommissionPayout;

/// Mock payout provider for development and testing
///
/// - If `payment_details.account` starts with "fail_", the transfer is rejected
/// - Otherwise it succeeds after the configured delay
pub struct MockPayoutProvider {
    delay: Duration,
}

impl MockPayoutProvider {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    /// Simulated network latency; long delays exercise the dispatch timeout
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for MockPayoutProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayoutProvider for MockPayoutProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn transfer(&self, payout: &CommissionPayout) -> Result<TransferReceipt, ProviderError> {
        tracing::info!(
            payout_id = %payout.id,
            referrer_id = %payout.referrer_id,
            net_amount = %payout.net_amount,
            method = %payout.payment_method,
            "Processing mock transfer"
        );

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let account = payout
            .payment_details
            .get("account")
            .and_then(|a| a.as_str())
            .unwrap_or_default();
        if account.starts_with("fail_") {
            tracing::warn!(
                payout_id = %payout.id,
                account = %account,
                "Mock transfer failed (triggered by account)"
            );
            return Err(ProviderError::Rejected(
                "Transfer declined: account cannot receive funds".to_string(),
            ));
        }

        Ok(TransferReceipt {
            transaction_id: format!("mock_tx_{}", Uuid::new_v4().simple()),
        })
    }
}
