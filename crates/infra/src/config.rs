//! Adapter configuration: partial user overrides merged over fixed defaults.
//!
//! [`AdapterConfig`] is the override surface (every field optional, camelCase on
//! the wire). [`AdapterConfig::merge`] enumerates every field explicitly and
//! produces the immutable [`MergedConfig`] the rest of the adapter reads.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use eventq_broker::{Backoff, BackoffKind, DefaultJobOptions, Retention};
use eventq_core::QueueConfig;

/// FIFO subscriptions run one job at a time.
pub const FIFO_CONCURRENCY: usize = 1;

pub const DEFAULT_CONCURRENCY: usize = 5;
/// The one place the default attempt count is defined.
pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 2000;
pub const DEFAULT_COMPLETED_RETENTION: usize = 1000;
pub const DEFAULT_FAILED_RETENTION: usize = 5000;
pub const DEFAULT_PREFIX: &str = "motia";
pub const DEFAULT_DLQ_SUFFIX: &str = ".dlq";
/// Seven days.
pub const DEFAULT_DLQ_TTL_SECONDS: u64 = 604_800;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffOverride {
    #[serde(rename = "type")]
    pub kind: Option<BackoffKind>,
    /// Milliseconds.
    pub delay: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionOverride {
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptionsOverride {
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffOverride>,
    pub remove_on_complete: Option<RetentionOverride>,
    pub remove_on_fail: Option<RetentionOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqOverride {
    pub enabled: Option<bool>,
    /// Seconds.
    pub ttl: Option<u64>,
    pub suffix: Option<String>,
}

/// User-supplied configuration. Anything left `None` takes the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterConfig {
    pub concurrency: Option<usize>,
    pub default_job_options: Option<JobOptionsOverride>,
    pub prefix: Option<String>,
    pub dlq: Option<DlqOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub attempts: u32,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub suffix: String,
}

/// Effective configuration, computed once per adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedConfig {
    pub concurrency: usize,
    pub default_retry: RetryPolicy,
    pub retention: RetentionPolicy,
    pub queue_name_prefix: String,
    pub dlq: DlqConfig,
}

impl Default for MergedConfig {
    fn default() -> Self {
        AdapterConfig::default().merge()
    }
}

impl MergedConfig {
    /// Job defaults for subscriber queues (count-based retention).
    pub fn queue_job_defaults(&self) -> DefaultJobOptions {
        DefaultJobOptions {
            attempts: self.default_retry.attempts,
            backoff: self.default_retry.backoff,
            remove_on_complete: Retention::Count(self.retention.completed_count),
            remove_on_fail: Retention::Count(self.retention.failed_count),
        }
    }

    /// Worker concurrency for a subscription. FIFO forces [`FIFO_CONCURRENCY`].
    pub fn concurrency_for(&self, options: &QueueConfig) -> usize {
        if options.is_fifo() {
            return FIFO_CONCURRENCY;
        }
        match options.concurrency {
            Some(n) if n > 0 => n,
            _ => self.concurrency,
        }
    }

    /// Total attempts for a subscription: `max_retries + 1`, else the default.
    pub fn attempts_for(&self, options: &QueueConfig) -> u32 {
        options
            .max_retries
            .map(|retries| retries.saturating_add(1))
            .unwrap_or(self.default_retry.attempts)
    }

    /// Lock duration for a subscription; `None` leaves the broker default.
    pub fn lock_duration_for(&self, options: &QueueConfig) -> Option<Duration> {
        options
            .visibility_timeout_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Initial enqueue delay for a subscription.
    pub fn delay_for(&self, options: &QueueConfig) -> Option<Duration> {
        options.delay_seconds.filter(|secs| *secs > 0).map(Duration::from_secs)
    }

    /// Job defaults for DLQ queues: time-based retention, no retries.
    pub fn dlq_job_defaults(&self) -> DefaultJobOptions {
        let ttl = Retention::Age(Duration::from_secs(self.dlq.ttl_seconds));
        DefaultJobOptions {
            attempts: 1,
            backoff: self.default_retry.backoff,
            remove_on_complete: ttl,
            remove_on_fail: ttl,
        }
    }
}

impl AdapterConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.default_job_options.get_or_insert_with(Default::default).attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, kind: BackoffKind, delay_ms: u64) -> Self {
        self.default_job_options.get_or_insert_with(Default::default).backoff = Some(BackoffOverride {
            kind: Some(kind),
            delay: Some(delay_ms),
        });
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_dlq_enabled(mut self, enabled: bool) -> Self {
        self.dlq.get_or_insert_with(Default::default).enabled = Some(enabled);
        self
    }

    pub fn with_dlq_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.dlq.get_or_insert_with(Default::default).suffix = Some(suffix.into());
        self
    }

    pub fn with_dlq_ttl_seconds(mut self, ttl: u64) -> Self {
        self.dlq.get_or_insert_with(Default::default).ttl = Some(ttl);
        self
    }

    /// Overrides from `EVENTQ_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AdapterConfig::from_env`], reading through `lookup`.
    ///
    /// Unparseable values are ignored (with a warning) and fall back to the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let backoff_kind = lookup("EVENTQ_BACKOFF").and_then(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(BackoffKind::Fixed),
            "exponential" => Some(BackoffKind::Exponential),
            other => {
                warn!(key = "EVENTQ_BACKOFF", value = %other, "ignoring unknown backoff type");
                None
            }
        });
        let backoff_delay = parse_var::<u64, _>(&lookup, "EVENTQ_BACKOFF_DELAY_MS");
        let backoff = (backoff_kind.is_some() || backoff_delay.is_some()).then_some(BackoffOverride {
            kind: backoff_kind,
            delay: backoff_delay,
        });

        let attempts = parse_var::<u32, _>(&lookup, "EVENTQ_ATTEMPTS");
        let default_job_options = (attempts.is_some() || backoff.is_some()).then_some(JobOptionsOverride {
            attempts,
            backoff,
            ..Default::default()
        });

        let dlq = DlqOverride {
            enabled: parse_var::<bool, _>(&lookup, "EVENTQ_DLQ_ENABLED"),
            ttl: parse_var::<u64, _>(&lookup, "EVENTQ_DLQ_TTL_SECONDS"),
            suffix: lookup("EVENTQ_DLQ_SUFFIX").filter(|s| !s.is_empty()),
        };
        let dlq = (dlq != DlqOverride::default()).then_some(dlq);

        Self {
            concurrency: parse_var::<usize, _>(&lookup, "EVENTQ_CONCURRENCY"),
            default_job_options,
            prefix: lookup("EVENTQ_PREFIX").filter(|s| !s.is_empty()),
            dlq,
        }
    }

    /// Merge these overrides onto the defaults.
    pub fn merge(&self) -> MergedConfig {
        let job = self.default_job_options.clone().unwrap_or_default();
        let backoff = job.backoff.unwrap_or_default();
        let dlq = self.dlq.clone().unwrap_or_default();

        let concurrency = match self.concurrency {
            Some(0) => {
                warn!(default = DEFAULT_CONCURRENCY, "concurrency override of 0 ignored");
                DEFAULT_CONCURRENCY
            }
            Some(n) => n,
            None => DEFAULT_CONCURRENCY,
        };

        let attempts = match job.attempts {
            Some(0) => {
                warn!(default = DEFAULT_ATTEMPTS, "attempts override of 0 ignored");
                DEFAULT_ATTEMPTS
            }
            Some(n) => n,
            None => DEFAULT_ATTEMPTS,
        };

        let dlq_suffix = match dlq.suffix {
            Some(suffix) if suffix.is_empty() => {
                warn!(default = DEFAULT_DLQ_SUFFIX, "empty DLQ suffix ignored");
                DEFAULT_DLQ_SUFFIX.to_string()
            }
            Some(suffix) => suffix,
            None => DEFAULT_DLQ_SUFFIX.to_string(),
        };

        let backoff = Backoff {
            kind: backoff.kind.unwrap_or(BackoffKind::Exponential),
            delay: Duration::from_millis(backoff.delay.unwrap_or(DEFAULT_BACKOFF_DELAY_MS)),
        };

        MergedConfig {
            concurrency,
            default_retry: RetryPolicy { attempts, backoff },
            retention: RetentionPolicy {
                completed_count: job
                    .remove_on_complete
                    .and_then(|r| r.count)
                    .unwrap_or(DEFAULT_COMPLETED_RETENTION),
                failed_count: job
                    .remove_on_fail
                    .and_then(|r| r.count)
                    .unwrap_or(DEFAULT_FAILED_RETENTION),
            },
            queue_name_prefix: self.prefix.clone().unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            dlq: DlqConfig {
                enabled: dlq.enabled.unwrap_or(true),
                ttl_seconds: dlq.ttl.unwrap_or(DEFAULT_DLQ_TTL_SECONDS),
                suffix: dlq_suffix,
            },
        }
    }
}

/// Merge user overrides (if any) onto the defaults.
pub fn build_config(config: Option<&AdapterConfig>) -> MergedConfig {
    config.map(AdapterConfig::merge).unwrap_or_default()
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}
