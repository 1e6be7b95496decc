//! S3-backed lock store and listing fetchers

use async_trait::async_trait;
use aws_sdk_s3::{error::DisplayErrorContext, primitives::ByteStream, Client};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::{LockStore, PageFetcher};
use crate::error::{CoordinatorError, Result};
use crate::paged::PagedResultQueue;
use crate::types::{LockRecord, ObjectSummary, Page};

/// Maximum keys S3 returns per listing page
const LIST_PAGE_SIZE: i32 = 1000;

/// One page of `ListObjectsV2` under a prefix
#[derive(Clone)]
pub struct S3ListingFetcher {
    client: Client,
    bucket: String,
    prefix: String,
    page_size: i32,
}

impl S3ListingFetcher {
    pub fn new(
        client: Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        page_size: i32,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
            page_size,
        }
    }
}

#[async_trait]
impl PageFetcher for S3ListingFetcher {
    type Item = ObjectSummary;
    type Cursor = String;

    #[instrument(skip(self), fields(bucket = %self.bucket, prefix = %self.prefix))]
    async fn fetch_page(&self, cursor: Option<&String>) -> Result<Page<ObjectSummary, String>> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .max_keys(self.page_size);

        if let Some(token) = cursor {
            request = request.continuation_token(token);
        }

        let response = request.send().await.map_err(|e| {
            CoordinatorError::Storage(format!(
                "failed to list s3://{}/{}: {}",
                self.bucket,
                self.prefix,
                DisplayErrorContext(&e)
            ))
        })?;

        let records = response
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectSummary {
                    key: object.key()?.to_string(),
                    size: object.size().unwrap_or(0),
                    last_modified: object.last_modified().and_then(to_chrono),
                })
            })
            .collect();

        Ok(Page {
            records,
            cursor: response.next_continuation_token().map(str::to_string),
            has_more: response.is_truncated().unwrap_or(false),
        })
    }
}

/// One page of the "directories" directly below a prefix
///
/// Items are the path segment names, without the parent prefix or the
/// trailing delimiter.
#[derive(Clone)]
pub struct S3PrefixFetcher {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3PrefixFetcher {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl PageFetcher for S3PrefixFetcher {
    type Item = String;
    type Cursor = String;

    async fn fetch_page(&self, cursor: Option<&String>) -> Result<Page<String, String>> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .delimiter("/")
            .max_keys(LIST_PAGE_SIZE);

        if let Some(token) = cursor {
            request = request.continuation_token(token);
        }

        let response = request.send().await.map_err(|e| {
            CoordinatorError::Storage(format!(
                "failed to list prefixes of s3://{}/{}: {}",
                self.bucket,
                self.prefix,
                DisplayErrorContext(&e)
            ))
        })?;

        let records = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix())
            .filter_map(|p| p.strip_prefix(self.prefix.as_str()))
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();

        Ok(Page {
            records,
            cursor: response.next_continuation_token().map(str::to_string),
            has_more: response.is_truncated().unwrap_or(false),
        })
    }
}

/// Lock records stored as empty objects at `{prefix}/{resource}/{token}`
///
/// Only key existence and the object's last-modified time matter; the
/// store's clock stamps `created_at`.
#[derive(Clone)]
pub struct S3LockStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3LockStore {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn resource_prefix(&self, resource: &str) -> String {
        format!("{}/{}/", self.prefix, resource)
    }

    pub fn build_key(&self, resource: &str, token: &str) -> String {
        format!("{}/{}/{}", self.prefix, resource, token)
    }
}

#[async_trait]
impl LockStore for S3LockStore {
    #[instrument(skip(self))]
    async fn list(&self, resource: &str) -> Result<Vec<LockRecord>> {
        let prefix = self.resource_prefix(resource);
        let fetcher =
            S3ListingFetcher::new(self.client.clone(), &self.bucket, &prefix, LIST_PAGE_SIZE);
        let mut listing = PagedResultQueue::new(fetcher);
        let mut records = Vec::new();

        while let Some(object) = listing.shift().await? {
            let Some(token) = object.key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if token.is_empty() || token.contains('/') {
                warn!(key = %object.key, "Ignoring unexpected key under lock prefix");
                continue;
            }

            records.push(LockRecord {
                resource_name: resource.to_string(),
                token: token.to_string(),
                // A missing timestamp is treated as fresh so it still counts
                created_at: object.last_modified.unwrap_or_else(Utc::now),
            });
        }

        debug!(resource = %resource, records = records.len(), "Listed lock records");
        Ok(records)
    }

    #[instrument(skip(self, record), fields(resource = %record.resource_name, token = %record.token))]
    async fn put(&self, record: &LockRecord) -> Result<()> {
        let key = self.build_key(&record.resource_name, &record.token);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| {
                CoordinatorError::Storage(format!(
                    "failed to write s3://{}/{}: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, resource: &str, token: &str) -> Result<()> {
        let key = self.build_key(resource, token);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                CoordinatorError::Storage(format!(
                    "failed to delete s3://{}/{}: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn resources(&self) -> Result<Vec<String>> {
        let fetcher = S3PrefixFetcher::new(
            self.client.clone(),
            &self.bucket,
            format!("{}/", self.prefix),
        );
        let mut listing = PagedResultQueue::new(fetcher);
        let mut names = Vec::new();

        while let Some(name) = listing.shift().await? {
            names.push(name);
        }

        Ok(names)
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> S3LockStore {
        let client = Client::from_conf(
            aws_sdk_s3::Config::builder()
                .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                .build(),
        );
        S3LockStore::new(client, "dip-internal", "lock/")
    }

    #[test]
    fn test_build_key() {
        let store = store();
        assert_eq!(store.build_key("ftp-host-a", "abc"), "lock/ftp-host-a/abc");
        assert_eq!(store.resource_prefix("ftp-host-a"), "lock/ftp-host-a/");
    }

    #[test]
    fn test_to_chrono() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        let converted = to_chrono(&dt).map(|d| d.timestamp());
        assert_eq!(converted, Some(1_700_000_000));
    }
}
