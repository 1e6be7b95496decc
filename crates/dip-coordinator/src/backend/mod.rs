//! Backend interfaces
//!
//! The coordination primitives never talk to AWS or HTTP directly. They go
//! through the traits below, so each primitive can run against the real
//! services in production and against the in-memory backends in tests.
//!
//! - [`LockStore`]: durable listing of lock records (S3 in production)
//! - [`WorkQueue`]: receive/delete message queue (SQS in production)
//! - [`PageFetcher`]: one page of a cursor-paginated scan or query

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::types::{LockRecord, Page, WorkItem};

pub mod memory;
pub mod s3;
pub mod search;
pub mod sqs;

pub use memory::{MemoryLockStore, MemoryWorkQueue, VecPageFetcher};
pub use s3::{S3ListingFetcher, S3LockStore, S3PrefixFetcher};
pub use search::{SearchCursor, SearchFetcher};
pub use sqs::SqsWorkQueue;

/// Durable store of lock records, shared by every caller of a semaphore
#[async_trait]
pub trait LockStore: Send + Sync {
    /// All records held for `resource`, stale ones included
    async fn list(&self, resource: &str) -> Result<Vec<LockRecord>>;

    /// Write a record. Its timestamp may be replaced by the store's own clock.
    async fn put(&self, record: &LockRecord) -> Result<()>;

    /// Remove a record. Removing a missing record succeeds.
    async fn delete(&self, resource: &str, token: &str) -> Result<()>;

    /// Every resource name that currently has at least one record
    async fn resources(&self) -> Result<Vec<String>>;
}

/// Shared work queue with explicit acknowledgment
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Receive up to `max` items, hiding them for `visibility_timeout`
    /// (the queue's default when `None`)
    async fn receive(&self, max: usize, visibility_timeout: Option<Duration>)
        -> Result<Vec<WorkItem>>;

    /// Acknowledge a delivery so it is never redelivered
    async fn delete(&self, receipt_token: &str) -> Result<()>;
}

/// Fetch strategy for [`crate::paged::PagedResultQueue`]
///
/// `cursor` is `None` for the first page and otherwise the cursor returned
/// with the previous page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    type Item: Send;
    type Cursor: Send + Sync;

    async fn fetch_page(
        &self,
        cursor: Option<&Self::Cursor>,
    ) -> Result<Page<Self::Item, Self::Cursor>>;
}
