//! DIP Coordinator
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Coordination primitives for stateless ingest workers that share scarce
//! providers, a work queue and large paged listings.
//!
//! - **[`ConnectionSemaphore`]**: caps concurrent connections per named
//!   resource using lock records in a shared store
//! - **[`BoundedConsumer`]**: drains a work queue in batches of at most
//!   ten, bounded by a message count and a wall-clock budget
//! - **[`PagedResultQueue`]**: walks a cursor-paginated backend one page
//!   at a time behind `peek`/`shift`
//! - **[`LockSweeper`]**: deletes lock records abandoned by crashed workers
//!
//! Backends live behind the traits in [`backend`]; S3, SQS and an HTTP
//! search service are provided, plus in-memory versions for tests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dip_coordinator::backend::{MemoryLockStore, MemoryWorkQueue};
//! use dip_coordinator::{BoundedConsumer, ConnectionSemaphore, ConsumerOptions, SemaphoreConfig};
//!
//! # async fn run() -> dip_coordinator::Result<()> {
//! let semaphore = ConnectionSemaphore::new(Arc::new(MemoryLockStore::new()), SemaphoreConfig::default());
//! let consumer = BoundedConsumer::new(Arc::new(MemoryWorkQueue::new()), ConsumerOptions::default());
//!
//! let processed = consumer
//!     .consume(|item| {
//!         let semaphore = semaphore.clone();
//!         async move {
//!             semaphore
//!                 .with_permit("ftp-host-a", Some(2), async move {
//!                     tracing::info!(item_id = %item.id, "transferring");
//!                 })
//!                 .await?;
//!             Ok(())
//!         }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod consumer;
pub mod error;
pub mod paged;
pub mod semaphore;
pub mod sweep;
pub mod types;

// Re-export commonly used types
pub use config::CoordinatorConfig;
pub use consumer::{BoundedConsumer, ConsumerOptions, MAX_BATCH_SIZE};
pub use error::{CoordinatorError, Result};
pub use paged::PagedResultQueue;
pub use semaphore::{ConnectionSemaphore, SemaphoreConfig};
pub use sweep::{LockSweeper, SweepReport};
pub use types::{LockRecord, LockToken, ObjectSummary, Page, WorkItem};
