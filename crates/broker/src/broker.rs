//! Persistent queue broker contract (mechanics only).
//!
//! The delivery layer in `eventq-infra` is written against these traits and never
//! against a concrete broker. A broker provides:
//!
//! - **Queues**: named, durable job lists addressed by `prefix` + queue name
//! - **Workers**: consumers pulling from one queue with bounded concurrency
//! - **Retries**: failed jobs are re-scheduled with backoff until their attempts run out
//! - **Retention**: finished jobs are trimmed by count or by age
//! - **Ordering keys**: jobs sharing a key run one at a time, in submission order
//!
//! ## Delivery Guarantees
//!
//! At-least-once. A job whose handler does not finish inside the lock duration is
//! considered abandoned and becomes eligible for redelivery, so handlers must
//! tolerate duplicates.
//!
//! ## Callbacks
//!
//! Connection, queue and worker errors are reported through plain `Fn` listeners
//! injected at construction. Listeners are expected to log and return; a broker
//! must never let a listener failure escape into its own processing loops.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::BrokerError;
use crate::job::{DefaultJobOptions, Job, JobCounts, JobOptions, JobState, Retention};

/// Lock duration used when a consumer does not ask for one.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Ready,
    Reconnecting,
    Closing,
    Closed,
}

impl ConnectionStatus {
    /// No further commands will succeed on this connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Closing | ConnectionStatus::Closed)
    }
}

/// Connection-level notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error(BrokerError),
    Closed,
}

pub type ConnectionListener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&BrokerError) + Send + Sync>;
pub type CompletedListener = Arc<dyn Fn(&Job) + Send + Sync>;
pub type FailedListener = Arc<dyn Fn(JobFailure) + Send + Sync>;

/// Future returned by a job processor.
pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Function invoked by a worker for every delivered job.
///
/// `Ok` acknowledges the job; `Err` counts as a failed attempt.
pub type JobProcessor = Arc<dyn Fn(Job) -> JobFuture + Send + Sync>;

/// One failed attempt, as reported to `on_failed`.
#[derive(Debug, Clone)]
pub struct JobFailure {
    /// Snapshot after the failure was recorded (`attempts_made` already incremented).
    pub job: Job,
    pub error: String,
    /// `false` when this was the last attempt and the job is now `Failed`.
    pub will_retry: bool,
}

/// Options applied when a queue handle is opened.
#[derive(Clone, Default)]
pub struct QueueOptions {
    pub prefix: String,
    pub defaults: DefaultJobOptions,
    pub on_error: Option<ErrorListener>,
}

impl QueueOptions {
    pub fn new(prefix: impl Into<String>, defaults: DefaultJobOptions) -> Self {
        Self {
            prefix: prefix.into(),
            defaults,
            on_error: None,
        }
    }

    pub fn with_error_listener(mut self, listener: ErrorListener) -> Self {
        self.on_error = Some(listener);
        self
    }
}

impl core::fmt::Debug for QueueOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueOptions")
            .field("prefix", &self.prefix)
            .field("defaults", &self.defaults)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Lifecycle hooks of a worker.
#[derive(Clone, Default)]
pub struct WorkerListeners {
    pub on_completed: Option<CompletedListener>,
    /// Fired after every failed attempt, not only the last one.
    pub on_failed: Option<FailedListener>,
    /// Worker-level (transport) errors; the worker keeps running.
    pub on_error: Option<ErrorListener>,
}

/// Options applied when a worker starts consuming a queue.
#[derive(Clone)]
pub struct ConsumerOptions {
    pub prefix: String,
    pub concurrency: usize,
    pub lock_duration: Option<Duration>,
    pub remove_on_complete: Option<Retention>,
    pub remove_on_fail: Option<Retention>,
    pub listeners: WorkerListeners,
}

impl ConsumerOptions {
    pub fn new(prefix: impl Into<String>, concurrency: usize) -> Self {
        Self {
            prefix: prefix.into(),
            concurrency,
            lock_duration: None,
            remove_on_complete: None,
            remove_on_fail: None,
            listeners: WorkerListeners::default(),
        }
    }

    pub fn effective_lock_duration(&self) -> Duration {
        self.lock_duration.unwrap_or(DEFAULT_LOCK_DURATION)
    }
}

impl core::fmt::Debug for ConsumerOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsumerOptions")
            .field("prefix", &self.prefix)
            .field("concurrency", &self.concurrency)
            .field("lock_duration", &self.lock_duration)
            .field("remove_on_complete", &self.remove_on_complete)
            .field("remove_on_fail", &self.remove_on_fail)
            .finish_non_exhaustive()
    }
}

/// Handle to one named queue.
///
/// Closing a handle releases it; the queue contents stay in the broker.
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Add a job; returns its id. Re-adding an id that is still stored is a no-op.
    async fn add(&self, name: &str, data: JsonValue, options: JobOptions) -> Result<String, BrokerError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, BrokerError>;

    /// Jobs in any of `states`, oldest first. `limit: None` returns all.
    async fn get_jobs(
        &self,
        states: &[JobState],
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, BrokerError>;

    async fn remove_job(&self, id: &str) -> Result<bool, BrokerError>;

    async fn job_counts(&self) -> Result<JobCounts, BrokerError>;

    /// Remove up to `limit` jobs (0 = no limit) in `state` older than `grace`.
    async fn clean(&self, grace: Duration, limit: usize, state: JobState) -> Result<Vec<String>, BrokerError>;

    /// Remove every job that has not started yet.
    async fn drain(&self) -> Result<(), BrokerError>;

    /// Remove the queue and all of its jobs. Without `force`, fails while jobs are active.
    async fn obliterate(&self, force: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A running consumer.
#[async_trait]
pub trait BrokerWorker: Send + Sync {
    fn queue_name(&self) -> &str;

    fn is_running(&self) -> bool;

    /// Stop pulling new jobs and wait for in-flight ones. Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A broker connection shared by every queue and worker created from it.
///
/// Implementations must accept concurrent command submission from many tasks.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    fn status(&self) -> ConnectionStatus;

    fn on_connection_event(&self, listener: ConnectionListener);

    async fn ping(&self) -> Result<(), BrokerError>;

    /// Flush and disconnect.
    async fn quit(&self) -> Result<(), BrokerError>;

    fn queue(&self, name: &str, options: QueueOptions) -> Result<Arc<dyn BrokerQueue>, BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        processor: JobProcessor,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn BrokerWorker>, BrokerError>;
}

/// Brokers that can open their own connection from parameters.
#[async_trait]
pub trait Connect: Broker + Sized {
    type Params: Send + Sync + 'static;

    async fn connect(params: Self::Params) -> Result<Self, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_closing_states_are_terminal() {
        assert!(ConnectionStatus::Closed.is_terminal());
        assert!(ConnectionStatus::Closing.is_terminal());
        assert!(!ConnectionStatus::Ready.is_terminal());
        assert!(!ConnectionStatus::Reconnecting.is_terminal());
    }

    #[test]
    fn consumer_falls_back_to_default_lock() {
        let options = ConsumerOptions::new("p", 1);
        assert_eq!(options.effective_lock_duration(), DEFAULT_LOCK_DURATION);
    }
}
