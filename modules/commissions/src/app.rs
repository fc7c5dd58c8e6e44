//! Composition root: builds every service once and hands them to the router

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::providers::ProviderRegistry;
use crate::repos::Store;
use crate::services::dispatcher::{dispatch_queue, DispatchReceiver, DISPATCH_QUEUE_CAPACITY};
use crate::services::{
    AccessGranter, AccessReconciler, CommissionCalculator, Notifier, PaymentTracker,
    PayoutAggregator, PayoutDispatcher, PayoutRequestService,
};
use crate::webhooks::{WebhookProcessor, WebhookSecrets};

/// Service-level knobs, separate from process concerns like host/port
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub webhook_secrets: WebhookSecrets,
    pub webhook_tolerance_secs: i64,
    pub minimum_payout: Decimal,
    pub default_currency: String,
    pub provider_timeout: Duration,
    pub bulk_concurrency: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            webhook_secrets: WebhookSecrets::default(),
            webhook_tolerance_secs: crate::webhooks::signature::DEFAULT_TOLERANCE_SECS,
            minimum_payout: Decimal::new(50, 0),
            default_currency: "USD".to_string(),
            provider_timeout: Duration::from_secs(30),
            bulk_concurrency: 4,
        }
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            webhook_secrets: WebhookSecrets {
                coingate: config.coingate_webhook_secret.clone(),
                stripe: config.stripe_webhook_secret.clone(),
                yookassa: config.yookassa_webhook_secret.clone(),
            },
            webhook_tolerance_secs: config.webhook_tolerance_secs,
            minimum_payout: config.minimum_payout,
            default_currency: config.default_currency.clone(),
            provider_timeout: Duration::from_secs(config.payout_provider_timeout_secs),
            bulk_concurrency: config.bulk_payout_concurrency,
        }
    }
}

/// Shared handler state
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub webhooks: WebhookProcessor,
    pub access: AccessGranter,
    pub commission: CommissionCalculator,
    pub aggregator: PayoutAggregator,
    pub dispatcher: Arc<PayoutDispatcher>,
    pub payout_requests: PayoutRequestService,
    pub reconciler: Arc<AccessReconciler>,
}

impl AppState {
    /// Wire the services. The returned receiver must be handed to
    /// `spawn_dispatch_worker` or enqueued payouts are never dispatched.
    pub fn build(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        settings: ServiceSettings,
    ) -> (Arc<AppState>, DispatchReceiver) {
        let notifier = Notifier::new(store.clone());
        let tracker = PaymentTracker::new(store.clone());
        let access = AccessGranter::new(store.clone());
        let commission = CommissionCalculator::new(store.clone());

        let (queue, receiver) = dispatch_queue(DISPATCH_QUEUE_CAPACITY);
        let dispatcher = Arc::new(PayoutDispatcher::new(
            store.clone(),
            providers,
            notifier.clone(),
            queue,
            settings.provider_timeout,
        ));

        let state = AppState {
            webhooks: WebhookProcessor::new(
                store.clone(),
                tracker,
                access.clone(),
                commission.clone(),
                notifier,
                settings.webhook_secrets,
                settings.webhook_tolerance_secs,
            ),
            aggregator: PayoutAggregator::new(
                store.clone(),
                dispatcher.clone(),
                settings.minimum_payout,
                settings.default_currency.clone(),
                settings.bulk_concurrency,
            ),
            payout_requests: PayoutRequestService::new(
                store.clone(),
                settings.minimum_payout,
                settings.default_currency,
            ),
            reconciler: Arc::new(AccessReconciler::new(
                store.clone(),
                access.clone(),
                commission.clone(),
            )),
            dispatcher,
            access,
            commission,
            store,
        };

        (Arc::new(state), receiver)
    }
}
