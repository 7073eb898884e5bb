//! `eventq-infra`: topic pub/sub with reliable delivery over a persistent queue broker.
//!
//! Configuration, connection handling, queue and subscription registries, the
//! dead-letter manager and the [`EventAdapter`] facade. Enable the `redis`
//! feature for the Redis-backed broker.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod adapter;
pub mod config;
pub mod connection;
pub mod dead_letter;
pub mod error;
pub mod queue_registry;
pub mod subscriptions;

#[cfg(feature = "redis")]
pub mod broker;


pub use adapter::EventAdapter;
pub use config::{AdapterConfig, MergedConfig, build_config};
pub use connection::{ConnectionHandle, ConnectionSource};
pub use dead_letter::{DeadLetterEntry, DeadLetterJob, DeadLetterManager};
pub use error::{AdapterError, AdapterResult, DeliveryFailure};
pub use queue_registry::{QueueRegistry, SubscriberInfo, queue_name_for};
pub use subscriptions::{EventHandler, SubscriptionHandle, SubscriptionRegistry, WorkerInfo, event_handler};

/// Registries stay usable after a panicking holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
