//! `eventq-broker`: persistent job-queue broker contract.
//!
//! Mechanics only (queues, workers, retries, retention). Topic semantics live in
//! `eventq-infra`.

pub mod backoff;
pub mod broker;
pub mod error;
pub mod in_memory;
pub mod job;

pub use backoff::{Backoff, BackoffKind};
pub use broker::{
    Broker, BrokerQueue, BrokerWorker, Connect, ConnectionEvent, ConnectionListener, ConnectionStatus,
    ConsumerOptions, DEFAULT_LOCK_DURATION, ErrorListener, JobFailure, JobFuture, JobProcessor, QueueOptions,
    WorkerListeners,
};
pub use error::BrokerError;
pub use in_memory::{InMemoryBroker, InMemoryParams};
pub use job::{DefaultJobOptions, Job, JobCounts, JobOptions, JobState, Retention};
