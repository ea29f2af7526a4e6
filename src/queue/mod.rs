//! Message queue seam: the broker interface the engine publishes to and consumes
//! from, an in-memory broker, and the admission-gated consumer loop.

pub mod consumer;
pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

/// A message taken off a queue, pending acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub body: Vec<u8>,
}

impl Delivery {
    /// A detached delivery, for feeding a handler directly.
    pub fn from_body(queue: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: 0,
            queue: queue.to_string(),
            body: body.into(),
        }
    }
}

/// Queue broker. Publishing with a non-zero delay goes through the delayed
/// exchange and becomes visible to consumers once the delay has elapsed.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, body: Vec<u8>, delay: Duration) -> Result<(), String>;

    /// Wait for the next message on a queue.
    async fn consume(&self, queue: &str) -> Result<Delivery, String>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), String>;
}
