pub mod events;
pub mod processor;
pub mod signature;

pub use events::{PaymentEventKind, ProviderEvent};
pub use processor::{WebhookProcessor, WebhookReceipt, WebhookSecrets};
pub use signature::SignatureError;
