//! Infrastructure-backed broker implementations.
//!
//! The broker contract lives in `eventq-broker` as pure mechanics; this module
//! provides the Redis implementation.

pub mod redis_jobs;

pub use redis_jobs::{RedisBroker, RedisParams};
