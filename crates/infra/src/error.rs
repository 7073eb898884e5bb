use std::fmt;

use eventq_broker::BrokerError;
use eventq_core::{CoreError, SubscriptionId};
use thiserror::Error;

/// One subscriber queue that rejected an enqueue during fan-out.
///
/// `error` keeps its kind: a queue that could not be opened is a
/// [`AdapterError::QueueCreation`], a rejected submission an [`AdapterError::Broker`].
#[derive(Debug)]
pub struct DeliveryFailure {
    pub queue: String,
    pub subscriber: String,
    pub error: AdapterError,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.queue, self.subscriber, self.error)
    }
}

fn join_failures(failures: &[DeliveryFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to create queue {queue}: {reason}")]
    QueueCreation { queue: String, reason: String },

    /// The subscription stays registered without a consumer.
    #[error("failed to create worker for subscription {subscription_id} on {queue}: {reason}")]
    WorkerCreation {
        subscription_id: SubscriptionId,
        queue: String,
        reason: String,
    },

    #[error("delivery failed for {} subscriber(s): {}", .0.len(), join_failures(.0))]
    Delivery(Vec<DeliveryFailure>),

    #[error("dead-letter operation on {queue} failed: {reason}")]
    DeadLetter { queue: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl AdapterError {
    pub fn dead_letter(queue: impl Into<String>, reason: impl ToString) -> Self {
        AdapterError::DeadLetter {
            queue: queue.into(),
            reason: reason.to_string(),
        }
    }

    /// Subscribers whose enqueue failed, for a `Delivery` error.
    pub fn failed_subscribers(&self) -> Vec<&str> {
        match self {
            AdapterError::Delivery(failures) => failures.iter().map(|f| f.subscriber.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

impl From<CoreError> for AdapterError {
    fn from(err: CoreError) -> Self {
        AdapterError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Serialization(err.to_string())
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;
