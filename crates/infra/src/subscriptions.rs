//! Subscription/Worker Registry.
//!
//! One worker per `(topic, subscriber)` subscription, consuming that
//! subscriber's dedicated queue.
//!
//! ## Lifecycle
//!
//! `created → active → closed`. There is no paused state.
//!
//! ## Failures
//!
//! - **Job failures** (the handler returned `Err`, panicked or overran its lock)
//!   are retried by the broker with backoff. Once a job's attempts are exhausted
//!   it is handed to the [`DeadLetterManager`] from a task spawned for that one
//!   failure, so a slow or failing DLQ move never holds up the worker.
//! - **Worker failures** (transport errors) are logged; the subscription stays
//!   registered and the broker client reconnects on its own.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use eventq_broker::{
    Broker, BrokerError, BrokerWorker, ConsumerOptions, Job, JobFailure, JobProcessor, Retention, WorkerListeners,
};
use eventq_core::{Event, QueueConfig, SubscriptionId, UNKNOWN_TRACE_ID};

use crate::config::MergedConfig;
use crate::dead_letter::DeadLetterManager;
use crate::error::{AdapterError, AdapterResult};
use crate::lock;
use crate::queue_registry::{SubscriberInfo, queue_name_for};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Handler invoked once per delivered event. `Err` fails the delivery attempt.
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Wrap a typed handler; the payload is decoded from JSON before each call.
///
/// A payload that does not decode into `T` fails the attempt like any other error.
pub fn event_handler<T, F, Fut>(handler: F) -> EventHandler
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event: Event| -> HandlerFuture {
        match event.decode::<T>() {
            Ok(typed) => Box::pin(handler(typed)),
            Err(err) => Box::pin(async move { Err(anyhow::Error::new(err)) }),
        }
    })
}

/// Rebuild the event stored in a job payload.
///
/// Missing fields fall back to `topic` and [`UNKNOWN_TRACE_ID`]; absent
/// `flows` / `messageGroupId` stay absent.
pub fn event_from_job_data(data: &JsonValue, topic: &str) -> Event {
    fn text<'a>(data: &'a JsonValue, key: &str) -> Option<&'a str> {
        data.get(key).and_then(JsonValue::as_str).filter(|s| !s.is_empty())
    }

    let flows = data.get("flows").and_then(JsonValue::as_array).map(|items| {
        items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::to_string)
            .collect::<Vec<_>>()
    });

    Event {
        topic: text(data, "topic").unwrap_or(topic).to_string(),
        data: data.get("data").cloned().unwrap_or(JsonValue::Null),
        trace_id: text(data, "traceId").unwrap_or(UNKNOWN_TRACE_ID).to_string(),
        flows,
        message_group_id: text(data, "messageGroupId").map(str::to_string),
    }
}

/// Bookkeeping for one subscription.
#[derive(Clone)]
pub struct WorkerInfo {
    pub id: SubscriptionId,
    pub topic: String,
    pub subscriber_name: String,
    pub queue_name: String,
    pub queue_config: QueueConfig,
    pub max_attempts: u32,
    /// `None` while starting, or when the worker could not be created.
    pub worker: Option<Arc<dyn BrokerWorker>>,
}

impl WorkerInfo {
    pub fn subscriber_info(&self) -> SubscriberInfo {
        SubscriberInfo {
            topic: self.topic.clone(),
            subscriber_name: self.subscriber_name.clone(),
            queue_config: self.queue_config.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| worker.is_running())
    }
}

impl core::fmt::Debug for WorkerInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerInfo")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("subscriber_name", &self.subscriber_name)
            .field("queue_name", &self.queue_name)
            .field("queue_config", &self.queue_config)
            .field("max_attempts", &self.max_attempts)
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
pub trait RemoveSubscription: Send + Sync {
    /// Returns `false` if the subscription was already gone.
    async fn remove(&self, id: SubscriptionId) -> bool;
}

/// Returned by `subscribe`; unsubscribing through it is idempotent.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub topic: String,
    pub id: SubscriptionId,
    registry: Weak<dyn RemoveSubscription>,
}

impl SubscriptionHandle {
    /// Stop the worker and drop the subscription's bookkeeping.
    pub async fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.id).await,
            None => false,
        }
    }
}

impl core::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    /// Topic → subscription ids in subscribe order.
    topic_subscriptions: HashMap<String, Vec<SubscriptionId>>,
    workers: HashMap<SubscriptionId, WorkerInfo>,
}

impl RegistryState {
    fn take(&mut self, id: SubscriptionId) -> Option<WorkerInfo> {
        let info = self.workers.remove(&id)?;
        if let Some(ids) = self.topic_subscriptions.get_mut(&info.topic) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.topic_subscriptions.remove(&info.topic);
            }
        }
        Some(info)
    }
}

pub struct SubscriptionRegistry<B> {
    broker: Arc<B>,
    config: Arc<MergedConfig>,
    dead_letters: Arc<DeadLetterManager<B>>,
    state: Mutex<RegistryState>,
}

impl<B: Broker> SubscriptionRegistry<B> {
    pub fn new(broker: Arc<B>, config: Arc<MergedConfig>, dead_letters: Arc<DeadLetterManager<B>>) -> Self {
        Self {
            broker,
            config,
            dead_letters,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Register a subscription and start its worker.
    ///
    /// If the worker cannot be started the subscription stays registered (without
    /// a worker) and [`AdapterError::WorkerCreation`] carries its id.
    pub async fn create_subscription(
        self: &Arc<Self>,
        topic: &str,
        subscriber_name: &str,
        handler: EventHandler,
        options: QueueConfig,
    ) -> AdapterResult<SubscriptionHandle> {
        let id = SubscriptionId::new();
        let queue_name = queue_name_for(topic, subscriber_name);
        let concurrency = self.config.concurrency_for(&options);
        let max_attempts = self.config.attempts_for(&options);
        let lock_duration = self.config.lock_duration_for(&options);

        {
            let mut state = lock(&self.state);
            state.topic_subscriptions.entry(topic.to_string()).or_default().push(id);
            state.workers.insert(
                id,
                WorkerInfo {
                    id,
                    topic: topic.to_string(),
                    subscriber_name: subscriber_name.to_string(),
                    queue_name: queue_name.clone(),
                    queue_config: options,
                    max_attempts,
                    worker: None,
                },
            );
        }
        self.dead_letters.register_attempts(&queue_name, max_attempts);

        let consumer = ConsumerOptions {
            prefix: self.config.queue_name_prefix.clone(),
            concurrency,
            lock_duration,
            remove_on_complete: Some(Retention::Count(self.config.retention.completed_count)),
            remove_on_fail: Some(Retention::Count(self.config.retention.failed_count)),
            listeners: self.listeners(topic, subscriber_name),
        };

        let worker = match self
            .broker
            .consume(&queue_name, processor(topic, handler), consumer)
            .await
        {
            Ok(worker) => worker,
            Err(err) => {
                error!(
                    topic = %topic,
                    subscriber = %subscriber_name,
                    subscription_id = %id,
                    error = %err,
                    "failed to create worker"
                );
                return Err(AdapterError::WorkerCreation {
                    subscription_id: id,
                    queue: queue_name,
                    reason: err.to_string(),
                });
            }
        };

        let attached = {
            let mut state = lock(&self.state);
            match state.workers.get_mut(&id) {
                Some(info) => {
                    info.worker = Some(worker.clone());
                    true
                }
                None => false,
            }
        };
        if !attached {
            // Unsubscribed while the worker was starting.
            if let Err(err) = worker.close().await {
                warn!(queue = %queue_name, error = %err, "error closing orphaned worker");
            }
        }

        info!(
            topic = %topic,
            subscriber = %subscriber_name,
            subscription_id = %id,
            concurrency,
            max_attempts,
            "subscription created"
        );

        let registry: Arc<dyn RemoveSubscription> = self.clone();
        Ok(SubscriptionHandle {
            topic: topic.to_string(),
            id,
            registry: Arc::downgrade(&registry),
        })
    }

    /// A failure is final when the broker will not retry the job. The job's own
    /// attempt count decides that, so a job re-submitted from the DLQ is judged
    /// by the attempts it was given.
    fn listeners(&self, topic: &str, subscriber_name: &str) -> WorkerListeners {
        let on_failed = {
            let dead_letters = self.dead_letters.clone();
            let topic = topic.to_string();
            let subscriber = subscriber_name.to_string();
            Arc::new(move |failure: JobFailure| {
                let JobFailure { job, error, will_retry } = failure;
                if will_retry {
                    debug!(
                        topic = %topic,
                        subscriber = %subscriber,
                        job_id = %job.id,
                        attempts_made = job.attempts_made,
                        error = %error,
                        "job failed, will retry"
                    );
                    return;
                }

                let dead_letters = dead_letters.clone();
                let topic = topic.clone();
                let subscriber = subscriber.clone();
                tokio::spawn(async move {
                    let event = event_from_job_data(&job.data, &topic);
                    dead_letters
                        .move_to_dlq(
                            &topic,
                            &subscriber,
                            &event,
                            &error,
                            job.attempts_made,
                            Some(job.id.as_str()),
                        )
                        .await;
                });
            })
        };

        let on_error = {
            let topic = topic.to_string();
            let subscriber = subscriber_name.to_string();
            Arc::new(move |err: &BrokerError| {
                error!(topic = %topic, subscriber = %subscriber, error = %err, "worker error");
            })
        };

        let on_completed = {
            let topic = topic.to_string();
            Arc::new(move |job: &Job| {
                debug!(topic = %topic, job_id = %job.id, "job completed");
            })
        };

        WorkerListeners {
            on_completed: Some(on_completed),
            on_failed: Some(on_failed),
            on_error: Some(on_error),
        }
    }

    /// Live subscribers of `topic`, in subscribe order.
    pub fn get_subscribers(&self, topic: &str) -> Vec<SubscriberInfo> {
        let state = lock(&self.state);
        let Some(ids) = state.topic_subscriptions.get(topic) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| state.workers.get(id))
            .map(WorkerInfo::subscriber_info)
            .collect()
    }

    pub fn get_worker_info(&self, id: SubscriptionId) -> Option<WorkerInfo> {
        lock(&self.state).workers.get(&id).cloned()
    }

    /// Remove a subscription and gracefully stop its worker. Idempotent.
    pub async fn remove_subscription(&self, id: SubscriptionId) -> bool {
        let Some(info) = lock(&self.state).take(id) else {
            return false;
        };

        if let Some(worker) = &info.worker {
            if let Err(err) = worker.close().await {
                warn!(queue = %info.queue_name, error = %err, "error closing worker");
            }
        }
        info!(
            topic = %info.topic,
            subscriber = %info.subscriber_name,
            subscription_id = %id,
            "subscription removed"
        );
        true
    }

    /// Stop every worker (best effort) and clear all bookkeeping.
    pub async fn close_all(&self) {
        let workers: Vec<WorkerInfo> = {
            let mut state = lock(&self.state);
            state.topic_subscriptions.clear();
            state.workers.drain().map(|(_, info)| info).collect()
        };

        for info in workers {
            if let Some(worker) = &info.worker {
                if let Err(err) = worker.close().await {
                    warn!(
                        topic = %info.topic,
                        subscriber = %info.subscriber_name,
                        error = %err,
                        "error closing worker"
                    );
                }
            }
        }
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        lock(&self.state)
            .workers
            .values()
            .filter(|info| info.topic == topic)
            .count()
    }

    /// Topics with at least one subscription, sorted.
    pub fn list_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.state).topic_subscriptions.keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl<B: Broker> RemoveSubscription for SubscriptionRegistry<B> {
    async fn remove(&self, id: SubscriptionId) -> bool {
        self.remove_subscription(id).await
    }
}

fn processor(topic: &str, handler: EventHandler) -> JobProcessor {
    let topic = topic.to_string();
    Arc::new(move |job: Job| {
        let event = event_from_job_data(&job.data, &topic);
        handler(event)
    })
}
