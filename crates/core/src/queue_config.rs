//! Per-subscription queue options.

use serde::{Deserialize, Serialize};

/// Delivery mode of a subscriber queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Concurrent delivery, no cross-event ordering.
    #[default]
    Standard,
    /// Strict per-group ordering; concurrency is pinned to 1.
    Fifo,
}

/// Options a subscriber passes when it subscribes.
///
/// Every field is optional; unset fields fall back to the adapter-wide
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default, rename = "type")]
    pub queue_type: QueueType,
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Retries after the first attempt (total attempts = retries + 1).
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Processing window before an unacknowledged job becomes redeliverable.
    #[serde(default, rename = "visibilityTimeout")]
    pub visibility_timeout_seconds: Option<u64>,
    /// Initial delay applied to every job enqueued for this subscriber.
    #[serde(default)]
    pub delay_seconds: Option<u64>,
}

impl QueueConfig {
    pub fn fifo() -> Self {
        Self {
            queue_type: QueueType::Fifo,
            ..Default::default()
        }
    }

    pub fn standard() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_visibility_timeout_seconds(mut self, seconds: u64) -> Self {
        self.visibility_timeout_seconds = Some(seconds);
        self
    }

    pub fn with_delay_seconds(mut self, seconds: u64) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn is_fifo(&self) -> bool {
        self.queue_type == QueueType::Fifo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_subscriber_facing_names() {
        let config: QueueConfig = serde_json::from_value(json!({
            "type": "fifo",
            "maxRetries": 2,
            "visibilityTimeout": 31,
            "delaySeconds": 5
        }))
        .unwrap();

        assert!(config.is_fifo());
        assert_eq!(config.max_retries, Some(2));
        assert_eq!(config.visibility_timeout_seconds, Some(31));
        assert_eq!(config.delay_seconds, Some(5));
        assert_eq!(config.concurrency, None);
    }

    #[test]
    fn empty_object_is_standard_with_no_overrides() {
        let config: QueueConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config, QueueConfig::standard());
    }
}
