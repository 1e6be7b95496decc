//! Distributed counting semaphore over a shared lock store
//!
//! Each admitted caller writes one [`LockRecord`] under the resource name.
//! A caller is admitted when fewer than `limit` non-stale records exist.
//! Listing and writing are separate store calls, so two callers racing for
//! the last slot may both get in: the limit is soft. Records abandoned by
//! crashed callers stop counting once they age past `stale_after` and are
//! cleaned up by [`crate::sweep::LockSweeper`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::backend::LockStore;
use crate::config::{
    DEFAULT_LOCK_MAX_ATTEMPTS, DEFAULT_LOCK_RETRY_DELAY_MS, DEFAULT_LOCK_STALE_AFTER_SECS,
};
use crate::error::{CoordinatorError, Result};
use crate::types::{LockRecord, LockToken};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreConfig {
    /// Records older than this are ignored when counting holders
    pub stale_after: Duration,
    /// Wait between admission attempts while saturated
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(DEFAULT_LOCK_STALE_AFTER_SECS),
            retry_delay: Duration::from_millis(DEFAULT_LOCK_RETRY_DELAY_MS),
            max_attempts: DEFAULT_LOCK_MAX_ATTEMPTS,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionSemaphore {
    store: Arc<dyn LockStore>,
    config: SemaphoreConfig,
}

impl ConnectionSemaphore {
    pub fn new(store: Arc<dyn LockStore>, config: SemaphoreConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SemaphoreConfig {
        &self.config
    }

    /// Take one slot on `resource`, waiting while it is saturated.
    ///
    /// `limit: None` admits immediately without touching the store.
    /// Fails with [`CoordinatorError::ResourcesLocked`] once `max_attempts`
    /// listings in a row found the resource full.
    #[instrument(skip(self))]
    pub async fn acquire(&self, resource: &str, limit: Option<u32>) -> Result<LockToken> {
        validate_resource(resource)?;

        let Some(limit) = limit else {
            debug!("No connection limit, admitting without a lock record");
            return Ok(LockToken::unlimited(resource));
        };
        if limit == 0 {
            return Err(CoordinatorError::Config(format!(
                "connection limit for '{resource}' must be at least 1"
            )));
        }

        let mut attempts = 0;
        loop {
            attempts += 1;

            let active = self.active_count(resource).await?;
            if active < limit as usize {
                let record = LockRecord::new(resource);
                self.store.put(&record).await?;

                info!(
                    token = %record.token,
                    active = active + 1,
                    limit,
                    attempts,
                    "Acquired connection slot"
                );
                return Ok(record.into());
            }

            if attempts >= self.config.max_attempts {
                warn!(active, limit, attempts, "Giving up on saturated resource");
                return Err(CoordinatorError::ResourcesLocked {
                    resource: resource.to_string(),
                    attempts,
                });
            }

            debug!(
                active,
                limit,
                "Resource saturated, attempt {}/{}",
                attempts,
                self.config.max_attempts
            );
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Drop the record for `token`. Releasing twice is not an error.
    #[instrument(skip(self))]
    pub async fn release(&self, resource: &str, token: &str) -> Result<()> {
        validate_resource(resource)?;
        self.store.delete(resource, token).await?;
        debug!("Released connection slot");
        Ok(())
    }

    pub async fn release_token(&self, token: &LockToken) -> Result<()> {
        match token.token() {
            Some(t) => self.release(token.resource(), t).await,
            None => Ok(()),
        }
    }

    /// Holders of `resource` that still count against its limit
    pub async fn active_count(&self, resource: &str) -> Result<usize> {
        let now = Utc::now();
        let records = self.store.list(resource).await?;
        Ok(records
            .iter()
            .filter(|r| !r.is_stale(now, self.config.stale_after))
            .count())
    }

    /// Run `work` while holding a slot on `resource`.
    ///
    /// The slot is released whatever `work` returns. A failed release is
    /// logged and left for the stale threshold to reclaim.
    pub async fn with_permit<F, T>(&self, resource: &str, limit: Option<u32>, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let token = self.acquire(resource, limit).await?;
        let output = work.await;

        if let Err(e) = self.release_token(&token).await {
            warn!(
                resource = %token.resource(),
                token = ?token.token(),
                error = %e,
                "Failed to release connection slot"
            );
        }

        Ok(output)
    }
}

/// Resource names become a single key segment
fn validate_resource(resource: &str) -> Result<()> {
    if resource.is_empty() || resource.contains('/') {
        return Err(CoordinatorError::InvalidResource(resource.to_string()));
    }
    Ok(())
}
