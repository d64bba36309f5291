use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::delivery::WebhookDelivery;

/// A bounded queue of deliveries waiting for their first attempt. Pushing never blocks: when the
/// queue is full the oldest delivery is evicted and handed back to the caller.
pub struct PendingQueue {
    deliveries: Mutex<VecDeque<WebhookDelivery>>,
    capacity: usize,
    notify: Notify,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            deliveries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<WebhookDelivery>> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a delivery, returning the evicted one if the queue was full.
    pub fn push(&self, delivery: WebhookDelivery) -> Option<WebhookDelivery> {
        let evicted = {
            let mut deliveries = self.lock();
            let evicted = if deliveries.len() >= self.capacity {
                deliveries.pop_front()
            } else {
                None
            };
            deliveries.push_back(delivery);
            evicted
        };

        self.notify.notify_one();
        evicted
    }

    pub fn pop(&self) -> Option<WebhookDelivery> {
        self.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<WebhookDelivery> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Wait until something was pushed since the last wake-up.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
