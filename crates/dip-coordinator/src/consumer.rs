//! Budgeted batch consumer over a shared work queue
//!
//! One `consume` call drains at most `message_limit` items within roughly
//! `time_limit`. Items are fetched in batches of up to [`MAX_BATCH_SIZE`],
//! each batch is handled concurrently, and budgets are checked only between
//! batches: a batch that has started always finishes, so a call can run
//! past its deadline by one batch.
//!
//! Handler failures leave the item unacknowledged. The queue redelivers it
//! after its visibility timeout, so handlers must tolerate running more
//! than once for the same item.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backend::WorkQueue;
use crate::config::{DEFAULT_MESSAGE_LIMIT, DEFAULT_TIME_LIMIT_SECS};
use crate::error::{CoordinatorError, Result};
use crate::types::WorkItem;

/// Largest batch a single receive may ask for
pub const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOptions {
    pub message_limit: usize,
    pub time_limit: Duration,
    /// Hide received items for this long; the queue's default when `None`
    pub visibility_timeout: Option<Duration>,
    pub delete_on_success: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            message_limit: DEFAULT_MESSAGE_LIMIT,
            time_limit: Duration::from_secs(DEFAULT_TIME_LIMIT_SECS),
            visibility_timeout: None,
            delete_on_success: true,
        }
    }
}

/// Remaining count and deadline of one `consume` call
#[derive(Debug, Clone, Copy)]
pub struct ConsumptionBudget {
    remaining: usize,
    deadline: Instant,
}

impl ConsumptionBudget {
    pub fn start(options: &ConsumerOptions) -> Self {
        Self {
            remaining: options.message_limit,
            deadline: Instant::now() + options.time_limit,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_spent(&self) -> bool {
        self.remaining == 0 || Instant::now() >= self.deadline
    }

    /// Size of the next batch to request
    pub fn next_chunk(&self) -> usize {
        self.remaining.min(MAX_BATCH_SIZE)
    }

    /// Charge a fetch against the budget by the size requested, not received
    fn charge(&mut self, requested: usize) {
        self.remaining = self.remaining.saturating_sub(requested);
    }
}

pub struct BoundedConsumer {
    queue: Arc<dyn WorkQueue>,
    options: ConsumerOptions,
}

impl BoundedConsumer {
    pub fn new(queue: Arc<dyn WorkQueue>, options: ConsumerOptions) -> Self {
        Self { queue, options }
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Process items until the count or time budget runs out.
    ///
    /// Returns the number of items whose handler succeeded (and, when
    /// deleting on success, whose deletion succeeded). Only queue receive
    /// failures abort the call.
    #[instrument(skip(self, handler), fields(limit = self.options.message_limit))]
    pub async fn consume<H, Fut>(&self, handler: H) -> Result<usize>
    where
        H: Fn(WorkItem) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut budget = ConsumptionBudget::start(&self.options);
        let mut succeeded = 0;
        let mut batches = 0;

        while !budget.is_spent() {
            let chunk = budget.next_chunk();
            succeeded += self.process_batch(chunk, &handler).await?;
            budget.charge(chunk);
            batches += 1;
        }

        info!(succeeded, batches, "Consumer finished");
        Ok(succeeded)
    }

    /// Receive one batch of up to `size` items and handle them concurrently
    pub async fn process_batch<H, Fut>(&self, size: usize, handler: &H) -> Result<usize>
    where
        H: Fn(WorkItem) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if size > MAX_BATCH_SIZE {
            return Err(CoordinatorError::BatchTooLarge {
                requested: size,
                max: MAX_BATCH_SIZE,
            });
        }

        let items = self
            .queue
            .receive(size, self.options.visibility_timeout)
            .await?;
        debug!(requested = size, received = items.len(), "Dispatching batch");

        let outcomes = join_all(items.into_iter().map(|item| self.process_item(item, handler))).await;
        Ok(outcomes.into_iter().filter(|ok| *ok).count())
    }

    async fn process_item<H, Fut>(&self, item: WorkItem, handler: &H) -> bool
    where
        H: Fn(WorkItem) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let id = item.id.clone();
        let receipt = item.receipt_token.clone();
        let receive_count = item.receive_count;

        if let Err(e) = handler(item).await {
            warn!(
                item_id = %id,
                receive_count,
                error = %e,
                "Handler failed, leaving item for redelivery"
            );
            return false;
        }

        if !self.options.delete_on_success {
            return true;
        }

        match self.queue.delete(&receipt).await {
            Ok(()) => {
                debug!(item_id = %id, "Acknowledged item");
                true
            },
            Err(e) => {
                warn!(item_id = %id, error = %e, "Failed to acknowledge item");
                false
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::MemoryWorkQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn consumer(queue: Arc<MemoryWorkQueue>, message_limit: usize) -> BoundedConsumer {
        BoundedConsumer::new(
            queue,
            ConsumerOptions {
                message_limit,
                ..ConsumerOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn test_stops_at_message_limit() {
        let queue = Arc::new(MemoryWorkQueue::new());
        for i in 0..20 {
            queue.push(format!("item-{i}")).await;
        }

        let processed = consumer(queue.clone(), 5)
            .consume(|_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(processed, 5);
        assert_eq!(queue.pending_len().await, 15);
        assert_eq!(queue.requested_sizes().await, vec![5]);
    }

    #[tokio::test]
    async fn test_large_limit_is_chunked() {
        let queue = Arc::new(MemoryWorkQueue::new());
        for i in 0..30 {
            queue.push(format!("item-{i}")).await;
        }

        let processed = consumer(queue.clone(), 25)
            .consume(|_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(processed, 25);
        assert_eq!(queue.requested_sizes().await, vec![10, 10, 5]);
        assert_eq!(queue.deleted_ids().await.len(), 25);
    }

    #[tokio::test]
    async fn test_failed_item_is_not_acknowledged() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let x = queue.push("X").await;
        let y = queue.push("Y").await;
        let z = queue.push("Z").await;

        let processed = consumer(queue.clone(), 3)
            .consume(|item| async move {
                if item.body == "X" {
                    anyhow::bail!("cannot handle X");
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(processed, 2);
        let deleted = queue.deleted_ids().await;
        assert!(deleted.contains(&y));
        assert!(deleted.contains(&z));
        assert!(!deleted.contains(&x));
        assert_eq!(queue.in_flight_len().await, 1);

        queue.expire_in_flight().await;
        let redelivered = queue.receive(10, None).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, x);
        assert_eq!(redelivered[0].receive_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_checked_between_batches() {
        let queue = Arc::new(MemoryWorkQueue::new());
        for i in 0..30 {
            queue.push(format!("item-{i}")).await;
        }

        let consumer = BoundedConsumer::new(
            queue.clone(),
            ConsumerOptions {
                message_limit: 30,
                time_limit: Duration::from_secs(5),
                ..ConsumerOptions::default()
            },
        );

        let started = Instant::now();
        let processed = consumer
            .consume(|_| async {
                tokio::time::sleep(Duration::from_secs(4)).await;
                Ok(())
            })
            .await
            .unwrap();

        // Batch 1 ends at 4s (under the limit), batch 2 runs to 8s
        assert_eq!(processed, 20);
        assert_eq!(queue.receive_calls(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently_within_batch() {
        let queue = Arc::new(MemoryWorkQueue::new());
        for i in 0..4 {
            queue.push(format!("item-{i}")).await;
        }
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        consumer(queue.clone(), 4)
            .consume(|_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_batch_over_max_rejected_before_receive() {
        let queue = Arc::new(MemoryWorkQueue::new());
        let consumer = consumer(queue.clone(), 11);

        let err = consumer
            .process_batch(11, &|_| async { Ok(()) })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::BatchTooLarge {
                requested: 11,
                max: 10
            }
        ));
        assert_eq!(queue.receive_calls(), 0);
    }

    #[tokio::test]
    async fn test_keep_items_when_delete_disabled() {
        let queue = Arc::new(MemoryWorkQueue::new());
        queue.push("a").await;

        let consumer = BoundedConsumer::new(
            queue.clone(),
            ConsumerOptions {
                delete_on_success: false,
                ..ConsumerOptions::default()
            },
        );
        let processed = consumer.consume(|_| async { Ok(()) }).await.unwrap();

        assert_eq!(processed, 1);
        assert!(queue.deleted_ids().await.is_empty());
        assert_eq!(queue.in_flight_len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_delete_is_not_a_success() {
        let queue = Arc::new(MemoryWorkQueue::new());
        queue.push("a").await;
        queue.fail_deletes().await;

        let processed = consumer(queue.clone(), 1)
            .consume(|_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(processed, 0);
    }

    #[tokio::test]
    async fn test_empty_queue_spends_budget() {
        let queue = Arc::new(MemoryWorkQueue::new());

        let processed = consumer(queue.clone(), 15)
            .consume(|_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(processed, 0);
        assert_eq!(queue.requested_sizes().await, vec![10, 5]);
    }
}
