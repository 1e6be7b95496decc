//! Coordinator error types

use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Errors surfaced by the semaphore, consumer and paged queue
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// No slot became free on `resource` within the retry budget
    #[error("Resources locked: no slot on '{resource}' after {attempts} attempts")]
    ResourcesLocked { resource: String, attempts: u32 },

    /// A single queue fetch asked for more items than the backend allows
    #[error("Cannot receive more than {max} messages per fetch (requested {requested})")]
    BatchTooLarge { requested: usize, max: usize },

    /// Resource names become key segments, so they must be non-empty and slash-free
    #[error("Invalid resource name: '{0}'")]
    InvalidResource(String),

    /// A backend claimed more pages but returned no cursor to reach them
    #[error("Pagination error: {0}")]
    Pagination(String),

    #[error("Lock store error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoordinatorError {
    /// Whether the caller lost the race for a scarce resource
    pub fn is_resources_locked(&self) -> bool {
        matches!(self, CoordinatorError::ResourcesLocked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resources_locked_message() {
        let err = CoordinatorError::ResourcesLocked {
            resource: "ftp-host-a".to_string(),
            attempts: 180,
        };
        assert!(err.is_resources_locked());
        assert_eq!(
            err.to_string(),
            "Resources locked: no slot on 'ftp-host-a' after 180 attempts"
        );
    }

    #[test]
    fn test_batch_too_large_is_not_locked() {
        let err = CoordinatorError::BatchTooLarge {
            requested: 11,
            max: 10,
        };
        assert!(!err.is_resources_locked());
    }
}
