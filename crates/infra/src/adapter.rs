//! Event Adapter facade: topic pub/sub over a persistent queue broker.
//!
//! Composes the [`ConnectionHandle`], [`QueueRegistry`], [`DeadLetterManager`]
//! and [`SubscriptionRegistry`] behind `emit` / `subscribe` / `unsubscribe` /
//! `shutdown`.
//!
//! ## Delivery
//!
//! - **At-least-once**: handlers may see the same event more than once
//! - **Fan-out**: every subscription of a topic gets its own copy on its own queue
//! - **Ordering**: only within one `(subscriber queue, messageGroupId)` pair
//! - **Dead letters**: exhausted jobs land in `topic.subscriber{suffix}`

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use eventq_broker::{Broker, Connect};
use eventq_core::{Event, QueueConfig};

use crate::config::{AdapterConfig, MergedConfig};
use crate::connection::{ConnectionHandle, ConnectionSource};
use crate::dead_letter::DeadLetterManager;
use crate::error::AdapterResult;
use crate::queue_registry::QueueRegistry;
use crate::subscriptions::{EventHandler, SubscriptionHandle, SubscriptionRegistry, event_handler};

pub struct EventAdapter<B: Broker> {
    connection: ConnectionHandle<B>,
    config: Arc<MergedConfig>,
    queues: Arc<QueueRegistry<B>>,
    dead_letters: Arc<DeadLetterManager<B>>,
    subscriptions: Arc<SubscriptionRegistry<B>>,
}

impl<B: Broker> EventAdapter<B> {
    /// Build an adapter from an existing connection or from connection parameters.
    pub async fn connect(source: ConnectionSource<B>, config: &AdapterConfig) -> AdapterResult<Self>
    where
        B: Connect,
    {
        let connection = ConnectionHandle::from_source(source).await?;
        Ok(Self::with_connection(connection, config))
    }

    /// Build an adapter on a caller-owned connection; `shutdown` leaves it open.
    pub fn from_existing(broker: Arc<B>, config: &AdapterConfig) -> Self {
        Self::with_connection(ConnectionHandle::from_existing(broker), config)
    }

    pub fn with_connection(connection: ConnectionHandle<B>, config: &AdapterConfig) -> Self {
        let config = Arc::new(config.merge());
        let broker = connection.broker().clone();

        let queues = Arc::new(QueueRegistry::new(broker.clone(), config.clone()));
        let dead_letters = Arc::new(DeadLetterManager::new(broker.clone(), config.clone(), queues.clone()));
        let subscriptions = Arc::new(SubscriptionRegistry::new(broker, config.clone(), dead_letters.clone()));

        Self {
            connection,
            config,
            queues,
            dead_letters,
            subscriptions,
        }
    }

    /// Deliver `event` to every current subscriber of its topic.
    ///
    /// A topic without subscribers is a no-op. If some subscriber queues reject
    /// the event, the others still receive it and the error lists the failures.
    pub async fn emit<T: Serialize>(&self, event: Event<T>) -> AdapterResult<()> {
        let subscribers = self.subscriptions.get_subscribers(&event.topic);
        if subscribers.is_empty() {
            debug!(topic = %event.topic, "no subscribers, event dropped");
            return Ok(());
        }

        let event = event.into_json()?.with_default_trace_id();
        self.queues.enqueue_to_all(&event, &subscribers).await
    }

    /// Subscribe a typed handler to `topic` under `subscriber_name`.
    pub async fn subscribe<T, F, Fut>(
        &self,
        topic: &str,
        subscriber_name: &str,
        handler: F,
        options: QueueConfig,
    ) -> AdapterResult<SubscriptionHandle>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_with(topic, subscriber_name, event_handler(handler), options)
            .await
    }

    /// Subscribe a handler that receives the raw JSON event.
    pub async fn subscribe_with(
        &self,
        topic: &str,
        subscriber_name: &str,
        handler: EventHandler,
        options: QueueConfig,
    ) -> AdapterResult<SubscriptionHandle> {
        // The queue exists before the worker does, so an early emit is not lost.
        let queue_name = self.queues.queue_name_for(topic, subscriber_name);
        self.queues.get_queue(&queue_name)?;

        self.subscriptions
            .create_subscription(topic, subscriber_name, handler, options)
            .await
    }

    /// Stop the subscription's worker and release its queue handle. Idempotent.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> AdapterResult<()> {
        let Some(info) = self.subscriptions.get_worker_info(handle.id) else {
            return Ok(());
        };

        self.subscriptions.remove_subscription(handle.id).await;
        self.queues.close_queue(&info.queue_name).await
    }

    /// Close workers, then queues, then the connection if this adapter owns it.
    pub async fn shutdown(&self) -> AdapterResult<()> {
        self.subscriptions.close_all().await;
        self.queues.close_all().await;
        self.dead_letters.close_all().await;

        if let Err(err) = self.connection.close().await {
            error!(error = %err, "error closing broker connection");
            return Err(err);
        }
        info!(owned_connection = self.connection.owns_connection(), "event adapter shut down");
        Ok(())
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        self.subscriptions.subscription_count(topic)
    }

    pub fn list_topics(&self) -> Vec<String> {
        self.subscriptions.list_topics()
    }

    pub fn prefix(&self) -> &str {
        &self.config.queue_name_prefix
    }

    pub fn dlq_suffix(&self) -> &str {
        &self.config.dlq.suffix
    }

    pub fn config(&self) -> &MergedConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionHandle<B> {
        &self.connection
    }

    pub fn queue_registry(&self) -> &Arc<QueueRegistry<B>> {
        &self.queues
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterManager<B>> {
        &self.dead_letters
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry<B>> {
        &self.subscriptions
    }
}
