//! DIP Coordinator - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dip_common::logging::{init_logging, LogConfig, LogLevel};
use dip_coordinator::{
    backend::{S3ListingFetcher, S3LockStore, SqsWorkQueue},
    BoundedConsumer, ConnectionSemaphore, CoordinatorConfig, LockSweeper, PagedResultQueue,
    WorkItem,
};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "dip-coordinator", version, about = "Coordination jobs for ingest workers")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain the work queue, forwarding each item under its resource's connection limit
    Drain {
        #[arg(long, env = "QUEUE_URL")]
        queue_url: Option<String>,

        /// Endpoint that receives each item body as a JSON POST
        #[arg(long, env = "FORWARD_URL")]
        forward_url: String,

        /// Overrides CONSUMER_MESSAGE_LIMIT
        #[arg(long)]
        message_limit: Option<usize>,

        /// Overrides CONSUMER_TIME_LIMIT_SECS
        #[arg(long)]
        time_limit_secs: Option<u64>,
    },

    /// Delete lock records older than the staleness threshold
    SweepLocks {
        /// Only sweep this resource
        #[arg(long)]
        resource: Option<String>,
    },

    /// List every object under a prefix, one page at a time
    Scan {
        #[arg(long)]
        prefix: String,

        /// Bucket to scan (defaults to S3_BUCKET)
        #[arg(long)]
        bucket: Option<String>,

        #[arg(long, default_value_t = 1000)]
        page_size: i32,
    },

    /// Show how many holders a resource currently has
    Status {
        #[arg(long)]
        resource: String,
    },
}

/// Queue item body understood by `drain`
#[derive(Debug, Deserialize)]
struct DrainRequest {
    resource: String,
    connection_limit: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        })
        .log_file_prefix("dip-coordinator")
        .filter_directives("aws_config=warn,aws_smithy_runtime=warn,hyper=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = CoordinatorConfig::load().context("Failed to load configuration")?;
    debug!(
        bucket = %config.storage.bucket,
        lock_prefix = %config.storage.lock_prefix,
        endpoint = ?config.storage.endpoint,
        "Configuration loaded"
    );

    if let Err(e) = execute_command(cli.command, config).await {
        error!(error = %format!("{e:#}"), "Command failed");
        return Err(e);
    }

    Ok(())
}

async fn execute_command(command: Commands, mut config: CoordinatorConfig) -> Result<()> {
    match command {
        Commands::Drain {
            queue_url,
            forward_url,
            message_limit,
            time_limit_secs,
        } => {
            if let Some(limit) = message_limit {
                config.consumer.message_limit = limit;
            }
            if let Some(secs) = time_limit_secs {
                config.consumer.time_limit = Duration::from_secs(secs);
            }
            let queue_url = queue_url
                .or_else(|| config.queue.url.clone())
                .context("QUEUE_URL or --queue-url is required for drain")?;

            drain(&config, queue_url, forward_url).await
        },
        Commands::SweepLocks { resource } => {
            let store = lock_store(&config).await;
            let sweeper = LockSweeper::new(Arc::new(store), config.semaphore.stale_after);
            let report = sweeper.sweep(resource.as_deref()).await?;

            info!(
                scanned = report.scanned,
                deleted = report.deleted,
                failed = report.failed,
                "Sweep finished"
            );
            if report.failed > 0 {
                anyhow::bail!("{} stale locks could not be deleted", report.failed);
            }
            Ok(())
        },
        Commands::Scan {
            prefix,
            bucket,
            page_size,
        } => {
            let client = config.storage.s3_client().await;
            let bucket = bucket.unwrap_or_else(|| config.storage.bucket.clone());
            let fetcher = S3ListingFetcher::new(client, &bucket, &prefix, page_size);
            let mut listing = PagedResultQueue::new(fetcher);

            let mut objects = 0usize;
            let mut bytes = 0i64;
            while let Some(object) = listing.shift().await? {
                objects += 1;
                bytes += object.size;
                info!(key = %object.key, size = object.size, "Object");
            }

            info!(
                bucket = %bucket,
                prefix = %prefix,
                objects,
                bytes,
                pages = listing.pages_fetched(),
                "Scan complete"
            );
            Ok(())
        },
        Commands::Status { resource } => {
            let store = lock_store(&config).await;
            let semaphore = ConnectionSemaphore::new(Arc::new(store), config.semaphore.clone());
            let active = semaphore.active_count(&resource).await?;

            info!(resource = %resource, active, "Active connection slots");
            Ok(())
        },
    }
}

async fn lock_store(config: &CoordinatorConfig) -> S3LockStore {
    S3LockStore::new(
        config.storage.s3_client().await,
        &config.storage.bucket,
        &config.storage.lock_prefix,
    )
}

async fn drain(config: &CoordinatorConfig, queue_url: String, forward_url: String) -> Result<()> {
    let semaphore = ConnectionSemaphore::new(
        Arc::new(lock_store(config).await),
        config.semaphore.clone(),
    );
    let queue = SqsWorkQueue::new(config.sqs_client().await, queue_url)
        .with_wait_time(config.queue.wait_time_secs);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    info!(
        queue = %queue.queue_url(),
        forward_url = %forward_url,
        message_limit = config.consumer.message_limit,
        time_limit_secs = config.consumer.time_limit.as_secs(),
        "Draining work queue"
    );
    let consumer = BoundedConsumer::new(Arc::new(queue), config.consumer.clone());

    let processed = consumer
        .consume(|item: WorkItem| {
            let semaphore = semaphore.clone();
            let http = http.clone();
            let forward_url = forward_url.clone();

            async move {
                let request: DrainRequest = item
                    .json_body()
                    .with_context(|| format!("Malformed body in item {}", item.id))?;

                semaphore
                    .with_permit(
                        &request.resource,
                        request.connection_limit,
                        forward(&http, &forward_url, &item),
                    )
                    .await??;
                Ok(())
            }
        })
        .await?;

    info!(processed, "Drain complete");
    Ok(())
}

async fn forward(http: &reqwest::Client, url: &str, item: &WorkItem) -> Result<()> {
    let body: serde_json::Value = item.json_body()?;

    http.post(url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to forward item {}", item.id))?
        .error_for_status()
        .with_context(|| format!("Forward endpoint rejected item {}", item.id))?;

    debug!(item_id = %item.id, "Forwarded item");
    Ok(())
}
