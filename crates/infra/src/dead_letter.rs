//! Dead-Letter Manager.
//!
//! Each subscriber queue `topic.subscriber` gets a lazily created DLQ named
//! `topic.subscriber{suffix}`. DLQ queues use **age-based** retention (entries
//! survive for the configured ttl regardless of throughput), unlike subscriber
//! queues which keep a fixed count.
//!
//! ## Job ids
//!
//! - A dead-lettered job whose original id is known is stored as `dlq:{id}`, so
//!   handling the same failure twice never creates a second entry.
//! - A job retried out of the DLQ is re-submitted as `retry:{id}`.
//! - Without an original id the broker assigns one.
//!
//! ## Attempts on retry
//!
//! A retried job gets the attempt count of the subscription it failed on. The
//! count is recorded in the DLQ payload at move time, taken from the
//! subscription registered for that queue (see
//! [`DeadLetterManager::register_attempts`]), else the configured default.
//!
//! ## Failure policy
//!
//! [`DeadLetterManager::move_to_dlq`] never returns an error: a failing move is
//! logged and dropped so that it cannot stall the worker reporting the failure.
//! Admin operations (list/retry/clear) return errors to their caller and log them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use eventq_broker::{Broker, BrokerQueue, JobOptions, JobState};
use eventq_core::Event;

use crate::config::MergedConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::lock;
use crate::queue_registry::{QueueRegistry, open_queue, ordering_key_for, queue_name_for};

pub const DLQ_JOB_PREFIX: &str = "dlq:";
pub const RETRY_JOB_PREFIX: &str = "retry:";

/// Payload stored in a DLQ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterJob {
    pub original_event: Event,
    pub failure_reason: String,
    /// Epoch milliseconds.
    pub failure_timestamp: i64,
    pub attempts_made: u32,
    /// Attempts the job was allowed on its subscriber queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_job_id: Option<String>,
}

/// A DLQ job as returned by [`DeadLetterManager::list_dlq`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub state: JobState,
    pub job: DeadLetterJob,
}

/// Copy of `event` with a guaranteed trace id and no empty optional keys.
pub fn sanitize_event(event: &Event) -> Event {
    let mut event = event.clone().with_default_trace_id();
    if event.message_group_id.as_deref().is_some_and(str::is_empty) {
        event.message_group_id = None;
    }
    event
}

pub struct DeadLetterManager<B> {
    broker: Arc<B>,
    config: Arc<MergedConfig>,
    queues: Arc<QueueRegistry<B>>,
    dlq_queues: Mutex<HashMap<String, Arc<dyn BrokerQueue>>>,
    /// Subscriber queue name → effective attempts of its subscription.
    queue_attempts: Mutex<HashMap<String, u32>>,
}

impl<B: Broker> DeadLetterManager<B> {
    pub fn new(broker: Arc<B>, config: Arc<MergedConfig>, queues: Arc<QueueRegistry<B>>) -> Self {
        Self {
            broker,
            config,
            queues,
            dlq_queues: Mutex::new(HashMap::new()),
            queue_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record the effective attempts of the subscription consuming `queue_name`.
    pub fn register_attempts(&self, queue_name: &str, attempts: u32) {
        lock(&self.queue_attempts).insert(queue_name.to_string(), attempts);
    }

    /// Attempts for a job re-submitted to `queue_name`.
    pub fn attempts_for_queue(&self, queue_name: &str) -> u32 {
        lock(&self.queue_attempts)
            .get(queue_name)
            .copied()
            .unwrap_or(self.config.default_retry.attempts)
    }

    pub fn suffix(&self) -> &str {
        &self.config.dlq.suffix
    }

    pub fn is_enabled(&self) -> bool {
        self.config.dlq.enabled
    }

    pub fn dlq_name_for(&self, topic: &str, subscriber_name: &str) -> String {
        format!("{}{}", queue_name_for(topic, subscriber_name), self.suffix())
    }

    pub fn is_dlq(&self, queue_name: &str) -> bool {
        self.original_queue_name(queue_name).is_some()
    }

    /// Subscriber queue a DLQ belongs to (`None` if `dlq_name` is not a DLQ name).
    pub fn original_queue_name(&self, dlq_name: &str) -> Option<String> {
        dlq_name
            .strip_suffix(self.suffix())
            .filter(|base| !base.is_empty())
            .map(str::to_string)
    }

    /// Cached DLQ handle, created with age-based retention on first use.
    pub fn get_dlq_queue(&self, name: &str) -> AdapterResult<Arc<dyn BrokerQueue>> {
        let mut queues = lock(&self.dlq_queues);
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }

        let queue = open_queue(
            self.broker.as_ref(),
            name,
            &self.config.queue_name_prefix,
            self.config.dlq_job_defaults(),
        )
        .map_err(|e| AdapterError::QueueCreation {
            queue: name.to_string(),
            reason: e.to_string(),
        })?;

        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Dead-letter a job whose attempts are exhausted. Errors are logged, never returned.
    pub async fn move_to_dlq(
        &self,
        topic: &str,
        subscriber_name: &str,
        event: &Event,
        failure_reason: &str,
        attempts_made: u32,
        original_job_id: Option<&str>,
    ) {
        if !self.is_enabled() {
            warn!(
                topic = %topic,
                subscriber = %subscriber_name,
                "DLQ disabled, dropping exhausted job"
            );
            return;
        }

        let dlq_name = self.dlq_name_for(topic, subscriber_name);
        match self
            .try_move(&dlq_name, topic, subscriber_name, event, failure_reason, attempts_made, original_job_id)
            .await
        {
            Ok(job_id) => warn!(
                queue = %dlq_name,
                topic = %topic,
                subscriber = %subscriber_name,
                job_id = %job_id,
                attempts_made,
                error = %failure_reason,
                "moved failed job to DLQ"
            ),
            Err(err) => error!(
                queue = %dlq_name,
                topic = %topic,
                subscriber = %subscriber_name,
                error = %err,
                "failed to move job to DLQ"
            ),
        }
    }

    async fn try_move(
        &self,
        dlq_name: &str,
        topic: &str,
        subscriber_name: &str,
        event: &Event,
        failure_reason: &str,
        attempts_made: u32,
        original_job_id: Option<&str>,
    ) -> AdapterResult<String> {
        let queue = self.get_dlq_queue(dlq_name)?;
        let payload = DeadLetterJob {
            original_event: sanitize_event(event),
            failure_reason: failure_reason.to_string(),
            failure_timestamp: Utc::now().timestamp_millis(),
            attempts_made,
            max_attempts: Some(self.attempts_for_queue(&queue_name_for(topic, subscriber_name))),
            original_job_id: original_job_id.map(str::to_string),
        };

        let options = JobOptions {
            job_id: original_job_id.map(|id| format!("{DLQ_JOB_PREFIX}{id}")),
            attempts: Some(1),
            ..JobOptions::default()
        };
        let id = queue
            .add(&format!("{topic}.dlq"), serde_json::to_value(&payload)?, options)
            .await?;
        Ok(id)
    }

    /// Waiting and failed DLQ jobs, oldest first.
    pub async fn list_dlq(
        &self,
        dlq_name: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> AdapterResult<Vec<DeadLetterEntry>> {
        let result = self.try_list(dlq_name, offset, limit).await;
        if let Err(err) = &result {
            error!(queue = %dlq_name, error = %err, "failed to list DLQ");
        }
        result
    }

    async fn try_list(&self, dlq_name: &str, offset: usize, limit: Option<usize>) -> AdapterResult<Vec<DeadLetterEntry>> {
        let queue = self.get_dlq_queue(dlq_name)?;
        let jobs = queue
            .get_jobs(&[JobState::Waiting, JobState::Failed], offset, limit)
            .await?;

        let mut entries = Vec::with_capacity(jobs.len());
        for job in jobs {
            match serde_json::from_value::<DeadLetterJob>(job.data) {
                Ok(payload) => entries.push(DeadLetterEntry {
                    job_id: job.id,
                    state: job.state,
                    job: payload,
                }),
                Err(err) => warn!(queue = %dlq_name, job_id = %job.id, error = %err, "skipping malformed DLQ job"),
            }
        }
        Ok(entries)
    }

    /// Re-submit one DLQ job to its original queue and remove it from the DLQ.
    ///
    /// Returns `false` if the job is no longer in the DLQ.
    pub async fn retry_from_dlq(&self, dlq_name: &str, job_id: &str) -> AdapterResult<bool> {
        let result = self.try_retry(dlq_name, job_id).await;
        match &result {
            Ok(true) => info!(queue = %dlq_name, job_id = %job_id, "retried job from DLQ"),
            Ok(false) => {}
            Err(err) => error!(queue = %dlq_name, job_id = %job_id, error = %err, "failed to retry job from DLQ"),
        }
        result
    }

    async fn try_retry(&self, dlq_name: &str, job_id: &str) -> AdapterResult<bool> {
        let original_queue_name = self
            .original_queue_name(dlq_name)
            .ok_or_else(|| AdapterError::dead_letter(dlq_name, "not a DLQ queue name"))?;

        let dlq = self.get_dlq_queue(dlq_name)?;
        let Some(job) = dlq.get_job(job_id).await? else {
            return Ok(false);
        };

        let payload: DeadLetterJob =
            serde_json::from_value(job.data).map_err(|e| AdapterError::dead_letter(dlq_name, e))?;
        let attempts = payload
            .max_attempts
            .unwrap_or_else(|| self.attempts_for_queue(&original_queue_name));
        let event = payload.original_event;

        let options = JobOptions {
            job_id: payload
                .original_job_id
                .as_deref()
                .map(|id| format!("{RETRY_JOB_PREFIX}{id}")),
            ordering_key: event
                .message_group_id
                .as_deref()
                .map(|group| ordering_key_for(&original_queue_name, group)),
            attempts: Some(attempts),
            backoff: Some(self.config.default_retry.backoff),
            delay: None,
        };

        let queue = self.queues.get_queue(&original_queue_name)?;
        queue.add(&event.topic, serde_json::to_value(&event)?, options).await?;
        dlq.remove_job(job_id).await?;
        Ok(true)
    }

    /// Retry every listed DLQ job in order; returns how many were retried.
    pub async fn retry_all_from_dlq(&self, dlq_name: &str) -> AdapterResult<usize> {
        let entries = self.list_dlq(dlq_name, 0, None).await?;
        let mut retried = 0;
        for entry in entries {
            if self.retry_from_dlq(dlq_name, &entry.job_id).await? {
                retried += 1;
            }
        }
        Ok(retried)
    }

    /// Remove every job from the DLQ, whatever its state.
    pub async fn clear_dlq(&self, dlq_name: &str) -> AdapterResult<()> {
        let result = match self.get_dlq_queue(dlq_name) {
            Ok(queue) => queue.obliterate(true).await.map_err(AdapterError::from),
            Err(err) => Err(err),
        };
        match &result {
            Ok(()) => info!(queue = %dlq_name, "DLQ cleared"),
            Err(err) => error!(queue = %dlq_name, error = %err, "failed to clear DLQ"),
        }
        result
    }

    pub async fn close_dlq_queue(&self, name: &str) -> AdapterResult<()> {
        let queue = lock(&self.dlq_queues).remove(name);
        if let Some(queue) = queue {
            queue.close().await?;
        }
        Ok(())
    }

    /// Release every cached DLQ handle, logging individual failures.
    pub async fn close_all(&self) {
        let queues: Vec<(String, Arc<dyn BrokerQueue>)> = lock(&self.dlq_queues).drain().collect();
        for (name, queue) in queues {
            if let Err(err) = queue.close().await {
                warn!(queue = %name, error = %err, "error closing DLQ queue");
            }
        }
    }

    pub fn dlq_queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.dlq_queues).keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdapterConfig, DEFAULT_ATTEMPTS};
    use eventq_broker::InMemoryBroker;

    fn manager(config: AdapterConfig) -> (Arc<InMemoryBroker>, DeadLetterManager<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        let config = Arc::new(config.merge());
        let queues = Arc::new(QueueRegistry::new(broker.clone(), config.clone()));
        (broker.clone(), DeadLetterManager::new(broker, config, queues))
    }

    #[test]
    fn dlq_names_round_trip_through_suffix() {
        let (_, dlq) = manager(AdapterConfig::default());
        let name = dlq.dlq_name_for("orders.created", "invoice");
        assert_eq!(name, "orders.created.invoice.dlq");
        assert_eq!(dlq.original_queue_name(&name).as_deref(), Some("orders.created.invoice"));
        assert!(!dlq.is_dlq("orders.created.invoice"));
        assert!(!dlq.is_dlq(".dlq"));
    }

    #[test]
    fn sanitized_event_fills_trace_and_drops_empty_group() {
        let mut event = Event::new("t", serde_json::json!(1), "");
        event.message_group_id = Some(String::new());

        let clean = sanitize_event(&event);
        assert_eq!(clean.trace_id, "unknown");
        let json = serde_json::to_value(&clean).unwrap();
        assert!(json.get("messageGroupId").is_none());
        assert!(json.get("flows").is_none());
    }

    #[tokio::test]
    async fn disabled_dlq_creates_nothing() {
        let (broker, dlq) = manager(AdapterConfig::default().with_dlq_enabled(false));
        let event = Event::new("t", serde_json::json!({}), "tr");
        dlq.move_to_dlq("t", "s", &event, "boom", 3, Some("7")).await;

        assert!(dlq.dlq_queue_names().is_empty());
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn failed_move_is_swallowed() {
        let (broker, dlq) = manager(AdapterConfig::default());
        broker.set_queue_fault("t.s.dlq", Some("down".to_string()));

        let event = Event::new("t", serde_json::json!({}), "tr");
        dlq.move_to_dlq("t", "s", &event, "boom", 3, Some("7")).await;

        broker.set_queue_fault("t.s.dlq", None);
        assert!(dlq.list_dlq("t.s.dlq", 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_without_original_id_lets_broker_assign() {
        let (_, dlq) = manager(AdapterConfig::default());
        let event = Event::new("t", serde_json::json!({"k": "v"}), "tr").with_message_group_id("g");
        dlq.move_to_dlq("t", "s", &event, "boom", 3, None).await;

        let entries = dlq.list_dlq("t.s.dlq", 0, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].job_id.starts_with(DLQ_JOB_PREFIX));
        assert_eq!(entries[0].job.original_job_id, None);

        assert!(dlq.retry_from_dlq("t.s.dlq", &entries[0].job_id).await.unwrap());
        let original = dlq.queues.get_queue("t.s").unwrap();
        let jobs = original.get_jobs(&[JobState::Waiting], 0, None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].ordering_key.as_deref(), Some("t.s.g"));
        assert_eq!(jobs[0].data["data"]["k"], "v");
    }

    #[tokio::test]
    async fn retry_keeps_subscription_attempts() {
        let (_, dlq) = manager(AdapterConfig::default());
        dlq.register_attempts("t.once", 1);
        dlq.register_attempts("t.many", 6);
        let event = Event::new("t", serde_json::json!({}), "tr");

        for subscriber in ["once", "many", "unknown"] {
            dlq.move_to_dlq("t", subscriber, &event, "boom", 1, Some("9")).await;
            let dlq_name = dlq.dlq_name_for("t", subscriber);
            assert!(dlq.retry_from_dlq(&dlq_name, "dlq:9").await.unwrap());
        }

        let attempts = |queue: &str| {
            let queue = dlq.queues.get_queue(queue).unwrap();
            async move { queue.get_job("retry:9").await.unwrap().unwrap().attempts }
        };
        assert_eq!(attempts("t.once").await, 1);
        assert_eq!(attempts("t.many").await, 6);
        assert_eq!(attempts("t.unknown").await, DEFAULT_ATTEMPTS);
    }

    #[tokio::test]
    async fn recorded_attempts_outlive_registration() {
        let (_, dlq) = manager(AdapterConfig::default());
        dlq.register_attempts("t.s", 2);
        let event = Event::new("t", serde_json::json!({}), "tr");
        dlq.move_to_dlq("t", "s", &event, "boom", 2, Some("4")).await;

        let entries = dlq.list_dlq("t.s.dlq", 0, None).await.unwrap();
        assert_eq!(entries[0].job.max_attempts, Some(2));

        dlq.register_attempts("t.s", 8);
        assert!(dlq.retry_from_dlq("t.s.dlq", "dlq:4").await.unwrap());
        let queue = dlq.queues.get_queue("t.s").unwrap();
        assert_eq!(queue.get_job("retry:4").await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn retry_rejects_non_dlq_names() {
        let (_, dlq) = manager(AdapterConfig::default());
        let err = dlq.retry_from_dlq("t.s", "1").await.unwrap_err();
        assert!(matches!(err, AdapterError::DeadLetter { .. }));
    }

    #[tokio::test]
    async fn clear_removes_all_entries() {
        let (_, dlq) = manager(AdapterConfig::default());
        let event = Event::new("t", serde_json::json!({}), "tr");
        for id in ["1", "2", "3"] {
            dlq.move_to_dlq("t", "s", &event, "boom", 3, Some(id)).await;
        }
        assert_eq!(dlq.list_dlq("t.s.dlq", 0, None).await.unwrap().len(), 3);
        assert_eq!(dlq.list_dlq("t.s.dlq", 1, Some(1)).await.unwrap()[0].job_id, "dlq:2");

        dlq.clear_dlq("t.s.dlq").await.unwrap();
        assert!(dlq.list_dlq("t.s.dlq", 0, None).await.unwrap().is_empty());
    }
}
