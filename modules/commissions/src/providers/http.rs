use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::{PayoutProvider, ProviderError, TransferReceipt};
use crate::models::CommissionPayout;

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    payout_id: Uuid,
    referrer_id: Uuid,
    amount: String,
    currency: &'a str,
    method: &'a str,
    details: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    transaction_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Generic JSON transfer API client
///
/// POSTs `{base_url}/transfers` with a bearer key. The payout id is sent as
/// the `Idempotency-Key` so a retried request cannot pay twice.
pub struct HttpPayoutProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPayoutProvider {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl PayoutProvider for HttpPayoutProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn transfer(&self, payout: &CommissionPayout) -> Result<TransferReceipt, ProviderError> {
        let url = format!("{}/transfers", self.base_url);
        let body = TransferRequest {
            payout_id: payout.id,
            referrer_id: payout.referrer_id,
            amount: payout.net_amount.to_string(),
            currency: &payout.currency,
            method: payout.payment_method.as_str(),
            details: &payout.payment_details,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", payout.id.to_string())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(
                payout_id = %payout.id,
                status = %status,
                body = %text,
                "Transfer API returned error status"
            );
            return Err(ProviderError::Rejected(format!("HTTP {}: {}", status, text)));
        }

        let parsed: TransferResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        match (parsed.transaction_id, parsed.error) {
            (Some(transaction_id), _) if !transaction_id.is_empty() => {
                Ok(TransferReceipt { transaction_id })
            }
            (_, Some(error)) => Err(ProviderError::Rejected(error)),
            _ => Err(ProviderError::InvalidResponse(
                "response carried no transaction_id".to_string(),
            )),
        }
    }
}
