use async_trait::async_trait;

use crate::{domain::PhoneNumber, messaging::types::SendReceipt, Result};

/// Outbound carrier port.
///
/// A carrier-level refusal comes back as a receipt without an external id; `Err` is
/// reserved for transport failures. Callers that record outcomes treat both alike.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send(&self, from: &PhoneNumber, to: &PhoneNumber, text: &str) -> Result<SendReceipt>;

    /// Point the sender number's inbound replies at `callback_url`. Idempotent.
    async fn register_inbound_webhook(&self, sender: &PhoneNumber, callback_url: &str)
        -> Result<()>;
}
