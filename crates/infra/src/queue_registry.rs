//! Queue Registry: one cached broker queue per `(topic, subscriber)` pair.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use eventq_broker::{Broker, BrokerError, BrokerQueue, DefaultJobOptions, JobOptions, QueueOptions};
use eventq_core::{Event, QueueConfig};

use crate::config::MergedConfig;
use crate::error::{AdapterError, AdapterResult, DeliveryFailure};
use crate::lock;

/// Queue name of a subscriber: `topic.subscriber`.
pub fn queue_name_for(topic: &str, subscriber_name: &str) -> String {
    format!("{topic}.{subscriber_name}")
}

/// Ordering key for a message group on one subscriber queue.
pub fn ordering_key_for(queue_name: &str, message_group_id: &str) -> String {
    format!("{queue_name}.{message_group_id}")
}

/// A live subscriber of a topic, as seen by fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub topic: String,
    pub subscriber_name: String,
    pub queue_config: QueueConfig,
}

impl SubscriberInfo {
    pub fn queue_name(&self) -> String {
        queue_name_for(&self.topic, &self.subscriber_name)
    }
}

pub(crate) fn open_queue<B: Broker>(
    broker: &B,
    name: &str,
    prefix: &str,
    defaults: DefaultJobOptions,
) -> Result<Arc<dyn BrokerQueue>, BrokerError> {
    let queue_name = name.to_string();
    let options = QueueOptions::new(prefix, defaults).with_error_listener(Arc::new(move |err: &BrokerError| {
        error!(queue = %queue_name, error = %err, "queue error");
    }));
    broker.queue(name, options)
}

pub struct QueueRegistry<B> {
    broker: Arc<B>,
    config: Arc<MergedConfig>,
    queues: Mutex<HashMap<String, Arc<dyn BrokerQueue>>>,
}

impl<B: Broker> QueueRegistry<B> {
    pub fn new(broker: Arc<B>, config: Arc<MergedConfig>) -> Self {
        Self {
            broker,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue_name_for(&self, topic: &str, subscriber_name: &str) -> String {
        queue_name_for(topic, subscriber_name)
    }

    pub fn prefix(&self) -> &str {
        &self.config.queue_name_prefix
    }

    /// Cached handle for `name`, created with the subscriber-queue defaults on first use.
    pub fn get_queue(&self, name: &str) -> AdapterResult<Arc<dyn BrokerQueue>> {
        let mut queues = lock(&self.queues);
        if let Some(queue) = queues.get(name) {
            return Ok(queue.clone());
        }

        let queue = open_queue(
            self.broker.as_ref(),
            name,
            &self.config.queue_name_prefix,
            self.config.queue_job_defaults(),
        )
        .map_err(|e| AdapterError::QueueCreation {
            queue: name.to_string(),
            reason: e.to_string(),
        })?;

        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Job options for one event on one subscriber queue.
    pub fn job_options_for(&self, queue_name: &str, event: &Event, queue_config: &QueueConfig) -> JobOptions {
        JobOptions {
            job_id: None,
            ordering_key: event
                .message_group_id
                .as_deref()
                .map(|group| ordering_key_for(queue_name, group)),
            attempts: Some(self.config.attempts_for(queue_config)),
            backoff: Some(self.config.default_retry.backoff),
            delay: self.config.delay_for(queue_config),
        }
    }

    /// Submit `event` to every subscriber's queue concurrently.
    ///
    /// Waits for every submission. Failed subscribers are reported together in
    /// [`AdapterError::Delivery`]; the others are delivered regardless.
    pub async fn enqueue_to_all(&self, event: &Event, subscribers: &[SubscriberInfo]) -> AdapterResult<()> {
        let payload: JsonValue = serde_json::to_value(event)?;
        let mut failures = Vec::new();
        let mut submissions = JoinSet::new();
        // (queue, subscriber) of every submission that has not reported back.
        let mut pending: Vec<(String, String)> = Vec::new();

        for subscriber in subscribers {
            let queue_name = subscriber.queue_name();
            let subscriber_name = subscriber.subscriber_name.clone();
            let queue = match self.get_queue(&queue_name) {
                Ok(queue) => queue,
                Err(err) => {
                    error!(queue = %queue_name, subscriber = %subscriber_name, error = %err, "enqueue failed");
                    failures.push(DeliveryFailure {
                        queue: queue_name,
                        subscriber: subscriber_name,
                        error: err,
                    });
                    continue;
                }
            };

            let options = self.job_options_for(&queue_name, event, &subscriber.queue_config);
            let job_name = event.topic.clone();
            let data = payload.clone();
            pending.push((queue_name.clone(), subscriber_name.clone()));

            submissions.spawn(async move {
                let result = queue.add(&job_name, data, options).await;
                (queue_name, subscriber_name, result)
            });
        }

        let mut aborted = Vec::new();
        while let Some(joined) = submissions.join_next().await {
            let (queue, subscriber, result) = match joined {
                Ok(reported) => reported,
                Err(join_err) => {
                    aborted.push(join_err.to_string());
                    continue;
                }
            };
            if let Some(pos) = pending.iter().position(|(q, s)| *q == queue && *s == subscriber) {
                pending.swap_remove(pos);
            }
            match result {
                Ok(job_id) => {
                    debug!(queue = %queue, job_id = %job_id, topic = %event.topic, "event enqueued");
                }
                Err(err) => {
                    error!(queue = %queue, subscriber = %subscriber, error = %err, "enqueue failed");
                    failures.push(DeliveryFailure {
                        queue,
                        subscriber,
                        error: err.into(),
                    });
                }
            }
        }

        // Whatever never reported back belongs to an aborted task.
        if !aborted.is_empty() {
            let reason = aborted.join("; ");
            for (queue, subscriber) in pending {
                error!(queue = %queue, subscriber = %subscriber, error = %reason, "enqueue task aborted");
                failures.push(DeliveryFailure {
                    queue,
                    subscriber,
                    error: BrokerError::Command(format!("enqueue task aborted: {reason}")).into(),
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort_by(|a, b| a.queue.cmp(&b.queue));
            Err(AdapterError::Delivery(failures))
        }
    }

    /// Release the cached handle for `name`, if any.
    pub async fn close_queue(&self, name: &str) -> AdapterResult<()> {
        let queue = lock(&self.queues).remove(name);
        if let Some(queue) = queue {
            queue.close().await?;
        }
        Ok(())
    }

    /// Release every cached handle. Individual failures are logged and skipped.
    pub async fn close_all(&self) {
        let queues: Vec<(String, Arc<dyn BrokerQueue>)> = lock(&self.queues).drain().collect();
        for (name, queue) in queues {
            if let Err(err) = queue.close().await {
                warn!(queue = %name, error = %err, "error closing queue");
            }
        }
    }

    /// Names of the cached queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.queues).keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eventq_broker::{
        BrokerWorker, ConnectionListener, ConnectionStatus, ConsumerOptions, InMemoryBroker, Job, JobCounts,
        JobProcessor, JobState,
    };
    use proptest::prelude::*;
    use std::time::Duration;

    fn registry() -> (Arc<InMemoryBroker>, QueueRegistry<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        let registry = QueueRegistry::new(broker.clone(), Arc::new(MergedConfig::default()));
        (broker, registry)
    }

    fn subscriber(topic: &str, name: &str) -> SubscriberInfo {
        SubscriberInfo {
            topic: topic.to_string(),
            subscriber_name: name.to_string(),
            queue_config: QueueConfig::default(),
        }
    }

    #[test]
    fn get_queue_returns_cached_handle() {
        let (_, registry) = registry();
        let first = registry.get_queue("t.a").unwrap();
        let second = registry.get_queue("t.a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.queue_names(), vec!["t.a".to_string()]);
    }

    #[tokio::test]
    async fn grouped_event_gets_ordering_key_and_attempts() {
        let (_, registry) = registry();
        let event = Event::new("t", serde_json::json!({}), "tr").with_message_group_id("g1");
        let config = QueueConfig::fifo().with_max_retries(4).with_delay_seconds(2);

        let options = registry.job_options_for("t.a", &event, &config);
        assert_eq!(options.ordering_key.as_deref(), Some("t.a.g1"));
        assert_eq!(options.job_id, None);
        assert_eq!(options.attempts, Some(5));
        assert_eq!(options.delay, Some(std::time::Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn one_broken_subscriber_does_not_block_others() {
        let (broker, registry) = registry();
        broker.set_queue_fault("t.bad", Some("link down".to_string()));

        let event = Event::new("t", serde_json::json!({"n": 1}), "tr");
        let err = registry
            .enqueue_to_all(&event, &[subscriber("t", "good"), subscriber("t", "bad")])
            .await
            .unwrap_err();

        assert_eq!(err.failed_subscribers(), vec!["bad"]);
        let good = registry.get_queue("t.good").unwrap();
        let jobs = good.get_jobs(&[JobState::Waiting], 0, None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].data["traceId"], "tr");
    }

    #[tokio::test]
    async fn unopenable_queue_is_reported_as_queue_creation() {
        let (broker, registry) = registry();
        broker.quit().await.unwrap();

        let event = Event::new("t", serde_json::json!({}), "tr");
        let err = registry.enqueue_to_all(&event, &[subscriber("t", "a")]).await.unwrap_err();

        let AdapterError::Delivery(failures) = &err else {
            panic!("expected delivery error, got {err:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].queue, "t.a");
        assert_eq!(failures[0].subscriber, "a");
        assert!(matches!(&failures[0].error, AdapterError::QueueCreation { queue, .. } if queue == "t.a"));
    }

    /// Queue whose `add` panics, standing in for a submission task that dies.
    struct PanickingQueue(Arc<dyn BrokerQueue>);

    #[async_trait]
    impl BrokerQueue for PanickingQueue {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn add(&self, _name: &str, _data: JsonValue, _options: JobOptions) -> Result<String, BrokerError> {
            panic!("submission task died");
        }

        async fn get_job(&self, id: &str) -> Result<Option<Job>, BrokerError> {
            self.0.get_job(id).await
        }

        async fn get_jobs(
            &self,
            states: &[JobState],
            offset: usize,
            limit: Option<usize>,
        ) -> Result<Vec<Job>, BrokerError> {
            self.0.get_jobs(states, offset, limit).await
        }

        async fn remove_job(&self, id: &str) -> Result<bool, BrokerError> {
            self.0.remove_job(id).await
        }

        async fn job_counts(&self) -> Result<JobCounts, BrokerError> {
            self.0.job_counts().await
        }

        async fn clean(&self, grace: Duration, limit: usize, state: JobState) -> Result<Vec<String>, BrokerError> {
            self.0.clean(grace, limit, state).await
        }

        async fn drain(&self) -> Result<(), BrokerError> {
            self.0.drain().await
        }

        async fn obliterate(&self, force: bool) -> Result<(), BrokerError> {
            self.0.obliterate(force).await
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.0.close().await
        }
    }

    /// In-memory broker whose queue `doomed` panics on submission.
    struct DoomedQueueBroker {
        inner: InMemoryBroker,
        doomed: String,
    }

    #[async_trait]
    impl Broker for DoomedQueueBroker {
        fn status(&self) -> ConnectionStatus {
            self.inner.status()
        }

        fn on_connection_event(&self, listener: ConnectionListener) {
            self.inner.on_connection_event(listener);
        }

        async fn ping(&self) -> Result<(), BrokerError> {
            self.inner.ping().await
        }

        async fn quit(&self) -> Result<(), BrokerError> {
            self.inner.quit().await
        }

        fn queue(&self, name: &str, options: QueueOptions) -> Result<Arc<dyn BrokerQueue>, BrokerError> {
            let queue = self.inner.queue(name, options)?;
            if name == self.doomed {
                return Ok(Arc::new(PanickingQueue(queue)));
            }
            Ok(queue)
        }

        async fn consume(
            &self,
            queue: &str,
            processor: JobProcessor,
            options: ConsumerOptions,
        ) -> Result<Arc<dyn BrokerWorker>, BrokerError> {
            self.inner.consume(queue, processor, options).await
        }
    }

    #[tokio::test]
    async fn aborted_submission_names_its_subscriber() {
        let broker = Arc::new(DoomedQueueBroker {
            inner: InMemoryBroker::new(),
            doomed: "t.crashy".to_string(),
        });
        let registry = QueueRegistry::new(broker, Arc::new(MergedConfig::default()));

        let event = Event::new("t", serde_json::json!({}), "tr");
        let err = registry
            .enqueue_to_all(&event, &[subscriber("t", "steady"), subscriber("t", "crashy")])
            .await
            .unwrap_err();

        let AdapterError::Delivery(failures) = &err else {
            panic!("expected delivery error, got {err:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].queue, "t.crashy");
        assert_eq!(failures[0].subscriber, "crashy");
        assert!(failures[0].error.to_string().contains("enqueue task aborted"));

        let steady = registry.get_queue("t.steady").unwrap();
        assert_eq!(steady.get_jobs(&[JobState::Waiting], 0, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_all_empties_cache() {
        let (_, registry) = registry();
        registry.get_queue("t.a").unwrap();
        registry.get_queue("t.b").unwrap();
        registry.close_all().await;
        assert!(registry.queue_names().is_empty());
        registry.close_queue("t.missing").await.unwrap();
    }

    proptest! {
        #[test]
        fn queue_name_joins_with_dot(topic in "[a-z.]{1,16}", name in "[a-z-]{1,16}") {
            let queue = queue_name_for(&topic, &name);
            prop_assert!(queue.starts_with(&topic));
            prop_assert!(queue.ends_with(&name));
            prop_assert_eq!(queue.len(), topic.len() + name.len() + 1);
        }
    }
}
