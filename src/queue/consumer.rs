//! Consumer loop: admission-gated pull from the command queue.
//!
//! A permit is taken from the handler's gate before the next message is pulled,
//! so no more than `queue_max_concurrency` deliveries are ever unacknowledged.
//! Each delivery is acknowledged once processing finishes, whatever the result;
//! redelivery happens through republishing, never through nack.

use super::{Broker, Delivery};
use crate::core::handler::DeliveryHandler;
use crate::core::types::CommandResult;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

pub struct Consumer {
    handler: Arc<DeliveryHandler>,
    broker: Arc<dyn Broker>,
    queue: String,
}

impl Consumer {
    pub fn new(handler: Arc<DeliveryHandler>, broker: Arc<dyn Broker>) -> Self {
        let queue = handler.config().command_queue_name.clone();
        Self {
            handler,
            broker,
            queue,
        }
    }

    /// Consume until the broker fails. In-flight deliveries are awaited before
    /// the error is returned.
    pub async fn run(&self) -> Result<(), String> {
        info!(
            queue = %self.queue,
            concurrency = self.handler.config().queue_max_concurrency,
            "consuming"
        );
        let gate = self.handler.gate();
        let mut tasks = JoinSet::new();
        let result = loop {
            let permit = match Arc::clone(&gate).acquire_owned().await {
                Ok(p) => p,
                Err(e) => break Err(format!("admission gate closed: {}", e)),
            };
            let delivery = match self.broker.consume(&self.queue).await {
                Ok(d) => d,
                Err(e) => break Err(format!("consume from {}: {}", self.queue, e)),
            };
            tasks.spawn(handle(
                Arc::clone(&self.handler),
                Arc::clone(&self.broker),
                delivery,
                permit,
            ));
            // Reap finished tasks so the set does not grow unbounded.
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "delivery task panicked");
                }
            }
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "delivery task panicked");
            }
        }
        result
    }
}

async fn handle(
    handler: Arc<DeliveryHandler>,
    broker: Arc<dyn Broker>,
    delivery: Delivery,
    permit: OwnedSemaphorePermit,
) -> CommandResult {
    let (requeued, result) = handler.process(&delivery).await;
    debug!(tag = delivery.tag, requeued, result = %result, "processed");
    if let Err(e) = broker.ack(&delivery).await {
        error!(tag = delivery.tag, error = %e, "ack failed");
    }
    drop(permit);
    result
}
