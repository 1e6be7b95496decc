//! SQS-backed work queue

use async_trait::async_trait;
use aws_sdk_sqs::{error::DisplayErrorContext, types::MessageSystemAttributeName, Client};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::WorkQueue;
use crate::error::{CoordinatorError, Result};
use crate::types::WorkItem;

/// Longest visibility timeout SQS accepts (12 hours)
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

#[derive(Clone)]
pub struct SqsWorkQueue {
    client: Client,
    queue_url: String,
    wait_time_secs: i32,
}

impl SqsWorkQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            wait_time_secs: 0,
        }
    }

    /// Long-poll each receive for up to `secs` seconds (0-20)
    pub fn with_wait_time(mut self, secs: i32) -> Self {
        self.wait_time_secs = secs;
        self
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

/// Visibility timeout in whole seconds, clamped to what SQS accepts
fn visibility_secs(timeout: Duration) -> i32 {
    timeout.as_secs().min(MAX_VISIBILITY_TIMEOUT_SECS) as i32
}

#[async_trait]
impl WorkQueue for SqsWorkQueue {
    #[instrument(skip(self), fields(queue = %self.queue_url))]
    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<WorkItem>> {
        let mut request = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max as i32)
            .wait_time_seconds(self.wait_time_secs)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount);

        if let Some(timeout) = visibility_timeout {
            request = request.visibility_timeout(visibility_secs(timeout));
        }

        let response = request.send().await.map_err(|e| {
            CoordinatorError::Queue(format!(
                "failed to receive from {}: {}",
                self.queue_url,
                DisplayErrorContext(&e)
            ))
        })?;

        let items: Vec<WorkItem> = response
            .messages()
            .iter()
            .filter_map(|message| {
                let Some(receipt) = message.receipt_handle() else {
                    warn!(message_id = ?message.message_id(), "Message without receipt handle");
                    return None;
                };

                let receive_count = message
                    .attributes()
                    .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(1);

                Some(WorkItem {
                    id: message.message_id().unwrap_or_default().to_string(),
                    body: message.body().unwrap_or_default().to_string(),
                    receipt_token: receipt.to_string(),
                    receive_count,
                })
            })
            .collect();

        debug!(requested = max, received = items.len(), "Received messages");
        Ok(items)
    }

    #[instrument(skip(self, receipt_token), fields(queue = %self.queue_url))]
    async fn delete(&self, receipt_token: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_token)
            .send()
            .await
            .map_err(|e| {
                CoordinatorError::Queue(format!(
                    "failed to delete message from {}: {}",
                    self.queue_url,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> SqsWorkQueue {
        let client = Client::from_conf(
            aws_sdk_sqs::Config::builder()
                .behavior_version(aws_sdk_sqs::config::BehaviorVersion::latest())
                .build(),
        );
        SqsWorkQueue::new(
            client,
            "https://sqs.us-east-1.amazonaws.com/123456789012/dip-transfers",
        )
    }

    #[test]
    fn test_queue_url() {
        let queue = queue().with_wait_time(20);
        assert_eq!(
            queue.queue_url(),
            "https://sqs.us-east-1.amazonaws.com/123456789012/dip-transfers"
        );
        assert_eq!(queue.wait_time_secs, 20);
    }

    #[test]
    fn test_visibility_timeout_is_clamped() {
        assert_eq!(visibility_secs(Duration::from_secs(600)), 600);
        assert_eq!(visibility_secs(Duration::from_secs(43_200)), 43_200);
        assert_eq!(visibility_secs(Duration::from_secs(u64::MAX)), 43_200);
    }
}
