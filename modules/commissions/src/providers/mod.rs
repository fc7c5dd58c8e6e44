//! External payout transfer mechanisms
//!
//! A [`PayoutProvider`] moves money for one payout. The dispatcher looks the
//! provider up by payment method in a [`ProviderRegistry`] built at startup.

pub mod http;
pub mod mock;

pub use http::HttpPayoutProvider;
pub use mock::MockPayoutProvider;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{CommissionPayout, PaymentMethod};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Transfer rejected by provider: {0}")]
    Rejected(String),

    #[error("Provider transport error: {0}")]
    Transport(String),

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),

    #[error("Provider call timed out after {0}s")]
    Timeout(u64),

    #[error("No payout provider configured for method {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

/// Successful transfer result
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub transaction_id: String,
}

#[async_trait]
pub trait PayoutProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send `payout.net_amount` to the referrer. Must not be retried blindly;
    /// a second call may pay twice.
    async fn transfer(&self, payout: &CommissionPayout) -> Result<TransferReceipt, ProviderError>;
}

/// Payment method -> provider routing table
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<PaymentMethod, Arc<dyn PayoutProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, method: PaymentMethod, provider: Arc<dyn PayoutProvider>) -> Self {
        self.providers.insert(method, provider);
        self
    }

    /// Routes every built-in method to the same provider
    pub fn uniform(provider: Arc<dyn PayoutProvider>) -> Self {
        Self::new()
            .with(PaymentMethod::Paypal, provider.clone())
            .with(PaymentMethod::BankTransfer, provider.clone())
            .with(PaymentMethod::Crypto, provider)
    }

    pub fn for_method(&self, method: &PaymentMethod) -> Option<Arc<dyn PayoutProvider>> {
        self.providers.get(method).cloned()
    }
}
