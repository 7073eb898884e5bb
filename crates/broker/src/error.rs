use thiserror::Error;

/// Failure reported by a broker implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker connection is closed")]
    Closed,

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("queue {0} has active jobs")]
    QueueBusy(String),

    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl BrokerError {
    /// Transport-level failures (as opposed to a rejected command).
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Closed)
    }
}
