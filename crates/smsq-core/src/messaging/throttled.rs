use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::PhoneNumber,
    messaging::{port::MessagingGateway, types::SendReceipt},
    Result,
};

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return how long to wait before using it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Gateway decorator enforcing the carrier's per-account send cap across every
/// concurrently running campaign of this process.
///
/// Campaign throttles only space sends within one execution; this caps their sum.
pub struct ThrottledGateway {
    inner: Arc<dyn MessagingGateway>,
    account: Mutex<IntervalLimiter>,
}

impl ThrottledGateway {
    pub fn new(inner: Arc<dyn MessagingGateway>, min_interval: Duration) -> Self {
        Self {
            inner,
            account: Mutex::new(IntervalLimiter::new(min_interval)),
        }
    }

    async fn throttle(&self) {
        let wait = { self.account.lock().await.reserve() };
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingGateway for ThrottledGateway {
    async fn send(&self, from: &PhoneNumber, to: &PhoneNumber, text: &str) -> Result<SendReceipt> {
        self.throttle().await;
        self.inner.send(from, to, text).await
    }

    async fn register_inbound_webhook(
        &self,
        sender: &PhoneNumber,
        callback_url: &str,
    ) -> Result<()> {
        // Number management has its own, much looser limit.
        self.inner.register_inbound_webhook(sender, callback_url).await
    }
}
