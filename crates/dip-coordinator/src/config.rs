//! Configuration management
//!
//! All settings come from environment variables (a `.env` file is honored),
//! falling back to the `DEFAULT_*` constants below.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::sqs::MAX_VISIBILITY_TIMEOUT_SECS;
use crate::consumer::ConsumerOptions;
use crate::error::{CoordinatorError, Result};
use crate::semaphore::SemaphoreConfig;

// ============================================================================
// Defaults
// ============================================================================

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default bucket holding lock records.
pub const DEFAULT_BUCKET: &str = "dip-internal";

/// Default key prefix for lock records.
pub const DEFAULT_LOCK_PREFIX: &str = "lock";

/// Lock records older than this no longer count against a limit (5 minutes).
pub const DEFAULT_LOCK_STALE_AFTER_SECS: u64 = 300;

/// Delay between admission attempts while a resource is saturated.
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 5_000;

/// Admission attempts before giving up (15 minutes at the default delay).
pub const DEFAULT_LOCK_MAX_ATTEMPTS: u32 = 180;

/// Default number of messages a consumer invocation may process.
pub const DEFAULT_MESSAGE_LIMIT: usize = 1;

/// Default wall-clock budget of a consumer invocation.
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 90;

/// Default SQS long-poll wait (0 = short poll).
pub const DEFAULT_QUEUE_WAIT_TIME_SECS: i32 = 0;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub semaphore: SemaphoreConfig,
    pub consumer: ConsumerOptions,
}

/// Object store settings (lock records and listings)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Custom endpoint, e.g. a local MinIO
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub lock_prefix: String,
    /// Static credentials; when absent the default AWS provider chain is used
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

/// Work queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub url: Option<String>,
    /// Custom SQS endpoint, e.g. ElasticMQ; independent of `S3_ENDPOINT`
    pub endpoint: Option<String>,
    pub wait_time_secs: i32,
}

impl CoordinatorConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            storage: StorageConfig::from_env(),
            queue: QueueConfig {
                url: std::env::var("QUEUE_URL").ok(),
                endpoint: std::env::var("SQS_ENDPOINT").ok(),
                wait_time_secs: env_or("QUEUE_WAIT_TIME_SECS", DEFAULT_QUEUE_WAIT_TIME_SECS),
            },
            semaphore: SemaphoreConfig {
                stale_after: Duration::from_secs(env_or(
                    "LOCK_STALE_AFTER_SECS",
                    DEFAULT_LOCK_STALE_AFTER_SECS,
                )),
                retry_delay: Duration::from_millis(env_or(
                    "LOCK_RETRY_DELAY_MS",
                    DEFAULT_LOCK_RETRY_DELAY_MS,
                )),
                max_attempts: env_or("LOCK_MAX_ATTEMPTS", DEFAULT_LOCK_MAX_ATTEMPTS),
            },
            consumer: ConsumerOptions {
                message_limit: env_or("CONSUMER_MESSAGE_LIMIT", DEFAULT_MESSAGE_LIMIT),
                time_limit: Duration::from_secs(env_or(
                    "CONSUMER_TIME_LIMIT_SECS",
                    DEFAULT_TIME_LIMIT_SECS,
                )),
                visibility_timeout: std::env::var("CONSUMER_VISIBILITY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .map(Duration::from_secs),
                delete_on_success: env_or("CONSUMER_DELETE_ON_SUCCESS", true),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.bucket.is_empty() {
            return Err(CoordinatorError::Config("S3_BUCKET cannot be empty".into()));
        }

        if self.storage.access_key.is_some() != self.storage.secret_key.is_some() {
            return Err(CoordinatorError::Config(
                "S3_ACCESS_KEY and S3_SECRET_KEY must be set together".into(),
            ));
        }

        if self.semaphore.max_attempts == 0 {
            return Err(CoordinatorError::Config(
                "LOCK_MAX_ATTEMPTS must be greater than 0".into(),
            ));
        }

        if self.semaphore.stale_after.is_zero() {
            return Err(CoordinatorError::Config(
                "LOCK_STALE_AFTER_SECS must be greater than 0".into(),
            ));
        }

        if !(0..=20).contains(&self.queue.wait_time_secs) {
            return Err(CoordinatorError::Config(format!(
                "QUEUE_WAIT_TIME_SECS must be between 0 and 20 (got {})",
                self.queue.wait_time_secs
            )));
        }

        if let Some(timeout) = self.consumer.visibility_timeout {
            if timeout.as_secs() > MAX_VISIBILITY_TIMEOUT_SECS {
                return Err(CoordinatorError::Config(format!(
                    "CONSUMER_VISIBILITY_TIMEOUT_SECS must be at most {} (got {})",
                    MAX_VISIBILITY_TIMEOUT_SECS,
                    timeout.as_secs()
                )));
            }
        }

        if self.consumer.message_limit == 0 {
            tracing::warn!("CONSUMER_MESSAGE_LIMIT is 0 - consumers will not fetch anything");
        }

        Ok(())
    }

    /// SQS client sharing the storage credentials and region, with the
    /// queue's own endpoint override
    pub async fn sqs_client(&self) -> aws_sdk_sqs::Client {
        let sdk = self.storage.sdk_config().await;
        let mut builder = aws_sdk_sqs::config::Builder::from(&sdk);

        if let Some(endpoint) = &self.queue.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        aws_sdk_sqs::Client::from_conf(builder.build())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            queue: QueueConfig {
                url: None,
                endpoint: None,
                wait_time_secs: DEFAULT_QUEUE_WAIT_TIME_SECS,
            },
            semaphore: SemaphoreConfig::default(),
            consumer: ConsumerOptions::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_REGION.to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            region: std::env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string()),
            bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string()),
            lock_prefix: std::env::var("LOCK_PREFIX")
                .unwrap_or_else(|_| DEFAULT_LOCK_PREFIX.to_string()),
            access_key: std::env::var("S3_ACCESS_KEY").ok(),
            secret_key: std::env::var("S3_SECRET_KEY").ok(),
            path_style: env_or("S3_PATH_STYLE", false),
        }
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
            ..Self::default()
        }
    }

    /// Shared SDK configuration for the S3 and SQS clients
    pub async fn sdk_config(&self) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&self.access_key, &self.secret_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "dip-coordinator",
            ));
        }

        loader.load().await
    }

    pub async fn s3_client(&self) -> aws_sdk_s3::Client {
        let sdk = self.sdk_config().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk).force_path_style(self.path_style);

        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        aws_sdk_s3::Client::from_conf(builder.build())
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
