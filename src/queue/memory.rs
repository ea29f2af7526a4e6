//! In-process broker with per-message scheduled delivery.
//!
//! Used in local mode and in tests. Every publication is kept in a history so a
//! run can be inspected afterwards.

use super::{Broker, Delivery};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// One recorded publication.
#[derive(Debug, Clone)]
pub struct Published {
    pub queue: String,
    pub body: Vec<u8>,
    pub delay: Duration,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, VecDeque<Delivery>>,
    unacked: HashSet<u64>,
    scheduled: usize,
    next_tag: u64,
    history: Vec<Published>,
}

impl Inner {
    fn push(&mut self, queue: &str, body: Vec<u8>) {
        self.next_tag += 1;
        let delivery = Delivery {
            tag: self.next_tag,
            queue: queue.to_string(),
            body,
        };
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(delivery);
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the next ready message without waiting.
    pub fn try_consume(&self, queue: &str) -> Option<Delivery> {
        let mut inner = self.lock();
        let delivery = inner.queues.get_mut(queue)?.pop_front()?;
        inner.unacked.insert(delivery.tag);
        Some(delivery)
    }

    /// Messages ready on a queue.
    pub fn pending(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Delayed messages not yet delivered to their queue.
    pub fn scheduled(&self) -> usize {
        self.lock().scheduled
    }

    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Every publication so far, in order.
    pub fn history(&self) -> Vec<Published> {
        self.lock().history.clone()
    }

    /// Publications to one queue.
    pub fn published_to(&self, queue: &str) -> Vec<Published> {
        self.lock()
            .history
            .iter()
            .filter(|p| p.queue == queue)
            .cloned()
            .collect()
    }

    /// Remove and return all ready messages on a queue.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).map(|d| d.body).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, body: Vec<u8>, delay: Duration) -> Result<(), String> {
        {
            let mut inner = self.lock();
            inner.history.push(Published {
                queue: queue.to_string(),
                body: body.clone(),
                delay,
            });
            if delay.is_zero() {
                inner.push(queue, body);
                drop(inner);
                self.notify.notify_waiters();
                return Ok(());
            }
            inner.scheduled += 1;
        }

        let inner = Arc::clone(&self.inner);
        let notify = Arc::clone(&self.notify);
        let queue = queue.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.scheduled -= 1;
                inner.push(&queue, body);
            }
            notify.notify_waiters();
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Delivery, String> {
        loop {
            // Created before the check so a publish in between is not missed.
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_consume(queue) {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), String> {
        if self.lock().unacked.remove(&delivery.tag) {
            Ok(())
        } else {
            Err(format!("unknown delivery tag {}", delivery.tag))
        }
    }
}
