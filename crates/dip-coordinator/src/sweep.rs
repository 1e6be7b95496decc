//! Removal of abandoned lock records
//!
//! `acquire` only ignores stale records; a caller that crashed between
//! acquire and release leaves its record behind forever. The sweep deletes
//! those records so listings stay small. Meant to run on a schedule.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::backend::LockStore;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub stale: usize,
    pub deleted: usize,
    pub failed: usize,
}

pub struct LockSweeper {
    store: Arc<dyn LockStore>,
    stale_after: Duration,
}

impl LockSweeper {
    pub fn new(store: Arc<dyn LockStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// Delete stale records of `resource`, or of every resource when `None`.
    ///
    /// A record that fails to delete is counted and skipped; listing
    /// failures abort the sweep.
    #[instrument(skip(self))]
    pub async fn sweep(&self, resource: Option<&str>) -> Result<SweepReport> {
        let resources = match resource {
            Some(name) => vec![name.to_string()],
            None => self.store.resources().await?,
        };

        let now = Utc::now();
        let mut report = SweepReport::default();

        for name in &resources {
            let records = self.store.list(name).await?;
            report.scanned += records.len();

            for record in records.iter().filter(|r| r.is_stale(now, self.stale_after)) {
                report.stale += 1;
                match self.store.delete(name, &record.token).await {
                    Ok(()) => {
                        report.deleted += 1;
                        info!(
                            resource = %name,
                            token = %record.token,
                            age_secs = record.age(now).as_secs(),
                            "Deleted stale lock"
                        );
                    },
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            resource = %name,
                            token = %record.token,
                            error = %e,
                            "Failed to delete stale lock"
                        );
                    },
                }
            }
        }

        info!(
            resources = resources.len(),
            scanned = report.scanned,
            stale = report.stale,
            deleted = report.deleted,
            failed = report.failed,
            "Lock sweep complete"
        );
        Ok(report)
    }
}
