//! Job model shared by every broker implementation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::backoff::Backoff;

/// Where a job currently sits in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be picked up.
    Waiting,
    /// Held back until its ordering key is released.
    Grouped,
    /// Scheduled for later (initial delay or retry backoff).
    Delayed,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts.
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn all() -> [JobState; 6] {
        [
            JobState::Waiting,
            JobState::Grouped,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ]
    }
}

/// How many finished jobs a queue keeps around.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Never remove finished jobs.
    #[default]
    KeepAll,
    /// Keep the most recent `n` finished jobs.
    Count(usize),
    /// Remove finished jobs older than the given age.
    Age(Duration),
}

/// Job defaults applied by a queue to every job added through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultJobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
}

impl Default for DefaultJobOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::default(),
            remove_on_complete: Retention::KeepAll,
            remove_on_fail: Retention::KeepAll,
        }
    }
}

/// Per-job overrides supplied at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Explicit id; adding a job whose id is already stored is a no-op.
    pub job_id: Option<String>,
    /// Jobs sharing a key are dispatched one at a time, in submission order.
    pub ordering_key: Option<String>,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Snapshot of a job as stored by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: JsonValue,
    pub state: JobState,
    /// Failed attempts so far.
    pub attempts_made: u32,
    /// Total attempts allowed (first try included).
    pub attempts: u32,
    pub backoff: Backoff,
    pub ordering_key: Option<String>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether another failure would still be retried.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.attempts
    }
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub grouped: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.grouped + self.delayed + self.active + self.completed + self.failed
    }

    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Grouped => self.grouped,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn increment(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Grouped => self.grouped += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }
}
