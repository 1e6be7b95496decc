//! In-memory backends for tests and local dry runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LockStore, PageFetcher, WorkQueue};
use crate::error::{CoordinatorError, Result};
use crate::types::{LockRecord, Page, WorkItem};

/// Lock store backed by a map keyed on `(resource, token)`
#[derive(Default)]
pub struct MemoryLockStore {
    records: Mutex<BTreeMap<(String, String), DateTime<Utc>>>,
    list_calls: AtomicUsize,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record with an explicit timestamp, e.g. to plant an abandoned lock
    pub async fn insert(&self, record: LockRecord) {
        self.records
            .lock()
            .await
            .insert((record.resource_name, record.token), record.created_at);
    }

    /// Number of records for `resource`, stale ones included
    pub async fn count(&self, resource: &str) -> usize {
        self.records
            .lock()
            .await
            .keys()
            .filter(|(r, _)| r == resource)
            .count()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn list(&self, resource: &str) -> Result<Vec<LockRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.records.lock().await;

        Ok(records
            .iter()
            .filter(|((r, _), _)| r == resource)
            .map(|((r, token), created_at)| LockRecord {
                resource_name: r.clone(),
                token: token.clone(),
                created_at: *created_at,
            })
            .collect())
    }

    async fn put(&self, record: &LockRecord) -> Result<()> {
        self.records.lock().await.insert(
            (record.resource_name.clone(), record.token.clone()),
            record.created_at,
        );
        Ok(())
    }

    async fn delete(&self, resource: &str, token: &str) -> Result<()> {
        self.records
            .lock()
            .await
            .remove(&(resource.to_string(), token.to_string()));
        Ok(())
    }

    async fn resources(&self) -> Result<Vec<String>> {
        let records = self.records.lock().await;
        let mut names: Vec<String> = records.keys().map(|(r, _)| r.clone()).collect();
        names.dedup();
        Ok(names)
    }
}

/// FIFO queue with SQS-like receive/delete semantics
///
/// Received items move in flight and stay hidden until deleted or until
/// [`expire_in_flight`](Self::expire_in_flight) simulates the visibility
/// timeout running out.
#[derive(Default)]
pub struct MemoryWorkQueue {
    state: Mutex<QueueState>,
    receive_calls: AtomicUsize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(String, String, u32)>,
    in_flight: HashMap<String, (String, String, u32)>,
    deleted: Vec<String>,
    requested: Vec<usize>,
    fail_deletes: bool,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a body and return the new item's id
    pub async fn push(&self, body: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        self.state
            .lock()
            .await
            .pending
            .push_back((id.clone(), body.into(), 0));
        id
    }

    /// Make every in-flight item visible again
    pub async fn expire_in_flight(&self) {
        let mut state = self.state.lock().await;
        let returned: Vec<_> = state.in_flight.drain().map(|(_, item)| item).collect();
        state.pending.extend(returned);
    }

    /// Make every subsequent delete fail
    pub async fn fail_deletes(&self) {
        self.state.lock().await.fail_deletes = true;
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Ids of acknowledged items, in deletion order
    pub async fn deleted_ids(&self) -> Vec<String> {
        self.state.lock().await.deleted.clone()
    }

    /// Batch size requested by each receive call
    pub async fn requested_sizes(&self) -> Vec<usize> {
        self.state.lock().await.requested.clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn receive(
        &self,
        max: usize,
        _visibility_timeout: Option<Duration>,
    ) -> Result<Vec<WorkItem>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.requested.push(max);

        let mut items = Vec::new();
        while items.len() < max {
            let Some((id, body, count)) = state.pending.pop_front() else {
                break;
            };
            let receipt = Uuid::new_v4().to_string();
            let receive_count = count + 1;
            state
                .in_flight
                .insert(receipt.clone(), (id.clone(), body.clone(), receive_count));
            items.push(WorkItem {
                id,
                body,
                receipt_token: receipt,
                receive_count,
            });
        }

        Ok(items)
    }

    async fn delete(&self, receipt_token: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_deletes {
            return Err(CoordinatorError::Queue("delete rejected".to_string()));
        }

        match state.in_flight.remove(receipt_token) {
            Some((id, _, _)) => {
                state.deleted.push(id);
                Ok(())
            },
            None => Err(CoordinatorError::Queue(format!(
                "receipt handle is invalid: {receipt_token}"
            ))),
        }
    }
}

/// Page fetcher replaying a fixed list of pages
///
/// The cursor is the index of the next page to serve.
pub struct VecPageFetcher<T> {
    pages: Vec<Page<T, usize>>,
    fail_at: Option<usize>,
    failed: AtomicBool,
}

impl<T> VecPageFetcher<T> {
    pub fn new(pages: Vec<Page<T, usize>>) -> Self {
        Self {
            pages,
            fail_at: None,
            failed: AtomicBool::new(false),
        }
    }

    /// Fail the first request for page `index`, then serve it normally
    pub fn fail_once_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }
}

#[async_trait]
impl<T> PageFetcher for VecPageFetcher<T>
where
    T: Clone + Send + Sync,
{
    type Item = T;
    type Cursor = usize;

    async fn fetch_page(&self, cursor: Option<&usize>) -> Result<Page<T, usize>> {
        let index = cursor.copied().unwrap_or(0);

        if self.fail_at == Some(index) && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(CoordinatorError::Storage(format!("injected failure on page {index}")));
        }

        self.pages
            .get(index)
            .cloned()
            .ok_or_else(|| CoordinatorError::Pagination(format!("no page at index {index}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_store_roundtrip() {
        let store = MemoryLockStore::new();
        let record = LockRecord::new("ftp-host-a");
        store.put(&record).await.unwrap();
        store.put(&LockRecord::new("ftp-host-b")).await.unwrap();

        let listed = store.list("ftp-host-a").await.unwrap();
        assert_eq!(listed, vec![record.clone()]);
        assert_eq!(store.resources().await.unwrap(), vec!["ftp-host-a", "ftp-host-b"]);

        store.delete("ftp-host-a", &record.token).await.unwrap();
        store.delete("ftp-host-a", &record.token).await.unwrap();
        assert_eq!(store.count("ftp-host-a").await, 0);
    }

    #[tokio::test]
    async fn test_queue_hides_in_flight_items() {
        let queue = MemoryWorkQueue::new();
        for i in 0..3 {
            queue.push(format!("item-{i}")).await;
        }

        let first = queue.receive(2, None).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(queue.in_flight_len().await, 2);

        let second = queue.receive(10, None).await.unwrap();
        assert_eq!(second.len(), 1);

        queue.delete(&first[0].receipt_token).await.unwrap();
        assert!(queue.delete(&first[0].receipt_token).await.is_err());

        queue.expire_in_flight().await;
        let redelivered = queue.receive(10, None).await.unwrap();
        assert_eq!(redelivered.len(), 2);
        assert!(redelivered.iter().all(|item| item.receive_count == 2));
        assert_eq!(queue.requested_sizes().await, vec![2, 10, 10]);
    }
}
