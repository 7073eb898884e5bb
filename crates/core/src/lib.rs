//! `eventq-core`: event and subscription primitives.
//!
//! Pure data types shared by the broker contract and the delivery layer (no IO).

pub mod error;
pub mod event;
pub mod id;
pub mod queue_config;

pub use error::{CoreError, CoreResult};
pub use event::{Event, UNKNOWN_TRACE_ID};
pub use id::SubscriptionId;
pub use queue_config::{QueueConfig, QueueType};
