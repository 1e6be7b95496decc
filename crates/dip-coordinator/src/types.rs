//! Core data types shared by the coordination primitives

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

/// One held unit of a scarce resource (maps to `lock/{resource}/{token}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource_name: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

impl LockRecord {
    /// New record with a fresh random token, stamped now
    pub fn new(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            token: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }

    /// Age relative to `now`; records from the future count as brand new
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.age(now) >= stale_after
    }
}

/// Handle returned by a successful admission
///
/// Unlimited admissions carry no token: nothing was written, so there is
/// nothing to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    resource: String,
    token: Option<String>,
}

impl LockToken {
    pub(crate) fn unlimited(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            token: None,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_unlimited(&self) -> bool {
        self.token.is_none()
    }
}

impl From<LockRecord> for LockToken {
    fn from(record: LockRecord) -> Self {
        Self {
            resource: record.resource_name,
            token: Some(record.token),
        }
    }
}

/// A message borrowed from the work queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub body: String,
    /// Handle used to acknowledge (delete) this delivery
    pub receipt_token: String,
    pub receive_count: u32,
}

impl WorkItem {
    /// Deserialize the body as JSON
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// One page of results from a paginated backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T, C> {
    pub records: Vec<T>,
    /// Cursor for the following page, if the backend returned one
    pub cursor: Option<C>,
    pub has_more: bool,
}

impl<T, C> Page<T, C> {
    /// The final page of a scan
    pub fn last(records: Vec<T>) -> Self {
        Self {
            records,
            cursor: None,
            has_more: false,
        }
    }

    pub fn more(records: Vec<T>, cursor: C) -> Self {
        Self {
            records,
            cursor: Some(cursor),
            has_more: true,
        }
    }
}

/// Object listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_record_staleness() {
        let now = Utc::now();
        let mut record = LockRecord::new("ftp-host-a");
        record.created_at = now - chrono::Duration::minutes(6);

        assert!(record.is_stale(now, Duration::from_secs(300)));
        assert!(!record.is_stale(now, Duration::from_secs(600)));
    }

    #[test]
    fn test_future_record_is_fresh() {
        let now = Utc::now();
        let mut record = LockRecord::new("ftp-host-a");
        record.created_at = now + chrono::Duration::seconds(30);

        assert_eq!(record.age(now), Duration::ZERO);
        assert!(!record.is_stale(now, Duration::from_secs(300)));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = LockRecord::new("r");
        let b = LockRecord::new("r");
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_json_body() {
        #[derive(Deserialize)]
        struct Request {
            resource: String,
        }

        let item = WorkItem {
            id: "1".into(),
            body: r#"{"resource":"ftp-host-a"}"#.into(),
            receipt_token: "r1".into(),
            receive_count: 1,
        };
        let request: Request = item.json_body().unwrap();
        assert_eq!(request.resource, "ftp-host-a");

        let bad = WorkItem {
            body: "not json".into(),
            ..item
        };
        assert!(bad.json_body::<Request>().is_err());
    }
}
