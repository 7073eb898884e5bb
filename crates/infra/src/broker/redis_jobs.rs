//! Redis-backed job queue broker (durable, at-least-once delivery).
//!
//! Every state transition runs as a Lua script, so a job is never in two
//! states at once even with many workers on one queue.
//!
//! ## Key layout
//!
//! For queue `q` under prefix `p`, every key starts with `p:q`:
//!
//! - **`p:q:job:{id}`**: hash with the job fields
//! - **`p:q:jobs`**: sorted set of every stored id, scored by submission sequence
//! - **`p:q:wait`**: list of ids ready to run
//! - **`p:q:delayed`**: sorted set scored by due time (ms)
//! - **`p:q:active`**: sorted set scored by lock expiry (ms)
//! - **`p:q:completed`** / **`p:q:failed`**: sorted sets scored by finish time (ms)
//! - **`p:q:groups`**: hash of ordering key → id currently holding it
//! - **`p:q:grouped:{key}`**: list of ids waiting for that ordering key
//!
//! ## Stalled jobs
//!
//! A job whose lock expired (its worker died) is pushed back to `wait` by the
//! next claim on that queue, without counting an attempt. Completions and
//! failures carry the lock token they were claimed with and are ignored once
//! the token no longer matches.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use serde_json::Value as JsonValue;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use eventq_broker::{
    Backoff, BackoffKind, Broker, BrokerError, BrokerQueue, BrokerWorker, Connect, ConnectionEvent,
    ConnectionListener, ConnectionStatus, ConsumerOptions, DefaultJobOptions, ErrorListener, Job, JobCounts,
    JobFailure, JobOptions, JobProcessor, JobState, QueueOptions, Retention, WorkerListeners,
};

/// Default Redis URL when `REDIS_URL` is not set.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// How long an idle worker waits before polling its queue again.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extra time past lock expiry before a job counts as stalled.
const DEFAULT_STALLED_GRACE: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a listener; a panicking listener is logged and swallowed.
fn guarded(what: &str, listener: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(listener)).is_err() {
        warn!(listener = what, "listener panicked");
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Connection parameters for [`RedisBroker`].
#[derive(Debug, Clone)]
pub struct RedisParams {
    pub url: String,
    pub poll_interval: Duration,
    pub stalled_grace: Duration,
}

impl RedisParams {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stalled_grace: DEFAULT_STALLED_GRACE,
        }
    }

    /// `REDIS_URL`, or [`DEFAULT_REDIS_URL`].
    pub fn from_env() -> Self {
        Self::new(std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()))
    }
}

impl Default for RedisParams {
    fn default() -> Self {
        Self::new(DEFAULT_REDIS_URL)
    }
}

// Shared by every script that can finish or remove a job.
const LUA_HELPERS: &str = r#"
local function release_group(base, id)
  local okey = redis.call('HGET', base .. ':job:' .. id, 'ordering_key')
  if not okey or okey == '' then return end
  if redis.call('HGET', base .. ':groups', okey) ~= id then return end
  local nxt = redis.call('LPOP', base .. ':grouped:' .. okey)
  if nxt then
    redis.call('HSET', base .. ':groups', okey, nxt)
    redis.call('HSET', base .. ':job:' .. nxt, 'state', 'waiting')
    redis.call('RPUSH', base .. ':wait', nxt)
  else
    redis.call('HDEL', base .. ':groups', okey)
  end
end

local function forget(base, id)
  local key = base .. ':job:' .. id
  local okey = redis.call('HGET', key, 'ordering_key')
  if okey and okey ~= '' then
    redis.call('LREM', base .. ':grouped:' .. okey, 0, id)
  end
  release_group(base, id)
  redis.call('LREM', base .. ':wait', 0, id)
  redis.call('ZREM', base .. ':delayed', id)
  redis.call('ZREM', base .. ':active', id)
  redis.call('ZREM', base .. ':completed', id)
  redis.call('ZREM', base .. ':failed', id)
  redis.call('ZREM', base .. ':jobs', id)
  redis.call('DEL', key)
end

local function trim(base, set, mode, value, now)
  local expired = {}
  if mode == 'count' then
    local excess = redis.call('ZCARD', set) - tonumber(value)
    if excess > 0 then expired = redis.call('ZRANGE', set, 0, excess - 1) end
  elseif mode == 'age' then
    expired = redis.call('ZRANGEBYSCORE', set, '-inf', now - tonumber(value))
  end
  for _, id in ipairs(expired) do
    forget(base, id)
  end
end
"#;

const LUA_ADD: &str = r#"
local base = KEYS[1]
local id = ARGV[1]
local now = tonumber(ARGV[9])
if id == '' then
  id = tostring(redis.call('INCR', base .. ':id'))
elseif redis.call('EXISTS', base .. ':job:' .. id) == 1 then
  return id
end

local okey = ARGV[7]
local state = 'waiting'
if okey ~= '' then
  if redis.call('HGET', base .. ':groups', okey) then
    state = 'grouped'
    redis.call('RPUSH', base .. ':grouped:' .. okey, id)
  else
    redis.call('HSET', base .. ':groups', okey, id)
  end
end

local delay = tonumber(ARGV[8])
if state == 'waiting' and delay > 0 then
  state = 'delayed'
  redis.call('ZADD', base .. ':delayed', now + delay, id)
elseif state == 'waiting' then
  redis.call('RPUSH', base .. ':wait', id)
end

local seq = redis.call('INCR', base .. ':seq')
redis.call('HSET', base .. ':job:' .. id,
  'name', ARGV[2], 'data', ARGV[3], 'state', state, 'attempts_made', 0,
  'attempts', ARGV[4], 'backoff_kind', ARGV[5], 'backoff_ms', ARGV[6],
  'ordering_key', okey, 'created_at', now)
redis.call('ZADD', base .. ':jobs', seq, id)
return id
"#;

const LUA_CLAIM: &str = r#"
local base = KEYS[1]
local now = tonumber(ARGV[1])
local lock_ms = tonumber(ARGV[2])
local token = ARGV[3]
local grace = tonumber(ARGV[4])

local due = redis.call('ZRANGEBYSCORE', base .. ':delayed', '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', base .. ':delayed', id)
  redis.call('HSET', base .. ':job:' .. id, 'state', 'waiting')
  redis.call('RPUSH', base .. ':wait', id)
end

local stalled = redis.call('ZRANGEBYSCORE', base .. ':active', '-inf', now - grace)
for _, id in ipairs(stalled) do
  redis.call('ZREM', base .. ':active', id)
  redis.call('HDEL', base .. ':job:' .. id, 'lock_token')
  redis.call('HSET', base .. ':job:' .. id, 'state', 'waiting')
  redis.call('LPUSH', base .. ':wait', id)
end

while true do
  local id = redis.call('LPOP', base .. ':wait')
  if not id then return false end
  local key = base .. ':job:' .. id
  if redis.call('EXISTS', key) == 1 then
    redis.call('HSET', key, 'state', 'active', 'processed_at', now, 'lock_token', token)
    redis.call('ZADD', base .. ':active', now + lock_ms, id)
    return id
  end
end
"#;

const LUA_COMPLETE: &str = r#"
local base = KEYS[1]
local id = ARGV[1]
local now = tonumber(ARGV[3])
local key = base .. ':job:' .. id
if redis.call('HGET', key, 'lock_token') ~= ARGV[2] then return 0 end

redis.call('ZREM', base .. ':active', id)
redis.call('HDEL', key, 'lock_token')
redis.call('HSET', key, 'state', 'completed', 'finished_at', now)
redis.call('ZADD', base .. ':completed', now, id)
release_group(base, id)
trim(base, base .. ':completed', ARGV[4], ARGV[5], now)
return 1
"#;

const LUA_FAIL: &str = r#"
local base = KEYS[1]
local id = ARGV[1]
local now = tonumber(ARGV[3])
local key = base .. ':job:' .. id
if redis.call('HGET', key, 'lock_token') ~= ARGV[2] then return {0, 0} end

redis.call('ZREM', base .. ':active', id)
redis.call('HDEL', key, 'lock_token')
redis.call('HSET', key, 'failed_reason', ARGV[4])
local made = redis.call('HINCRBY', key, 'attempts_made', 1)
local attempts = tonumber(redis.call('HGET', key, 'attempts'))

if made < attempts then
  local delay = tonumber(redis.call('HGET', key, 'backoff_ms'))
  if redis.call('HGET', key, 'backoff_kind') == 'exponential' then
    delay = delay * math.pow(2, math.min(made - 1, 30))
  end
  redis.call('HSET', key, 'state', 'delayed')
  redis.call('ZADD', base .. ':delayed', now + math.floor(delay), id)
  return {made, 1}
end

redis.call('HSET', key, 'state', 'failed', 'finished_at', now)
redis.call('ZADD', base .. ':failed', now, id)
release_group(base, id)
trim(base, base .. ':failed', ARGV[5], ARGV[6], now)
return {made, 0}
"#;

const LUA_REMOVE: &str = r#"
local base = KEYS[1]
local removed = 0
for i = 1, #ARGV do
  if redis.call('EXISTS', base .. ':job:' .. ARGV[i]) == 1 then
    forget(base, ARGV[i])
    removed = removed + 1
  end
end
return removed
"#;

const LUA_IDS_IN: &str = r#"
local base = KEYS[1]
local wanted = {}
for i = 1, #ARGV do wanted[ARGV[i]] = true end
local ids = redis.call('ZRANGE', base .. ':jobs', 0, -1)
local out = {}
for _, id in ipairs(ids) do
  local state = redis.call('HGET', base .. ':job:' .. id, 'state')
  if state and wanted[state] then table.insert(out, id) end
end
return out
"#;

const LUA_COUNTS: &str = r#"
local base = KEYS[1]
local ids = redis.call('ZRANGE', base .. ':jobs', 0, -1)
local out = {}
for _, id in ipairs(ids) do
  local state = redis.call('HGET', base .. ':job:' .. id, 'state')
  if state then table.insert(out, state) end
end
return out
"#;

const LUA_OBLITERATE: &str = r#"
local base = KEYS[1]
if ARGV[1] ~= '1' and redis.call('ZCARD', base .. ':active') > 0 then return 0 end
local ids = redis.call('ZRANGE', base .. ':jobs', 0, -1)
for _, id in ipairs(ids) do
  redis.call('DEL', base .. ':job:' .. id)
end
for _, okey in ipairs(redis.call('HKEYS', base .. ':groups')) do
  redis.call('DEL', base .. ':grouped:' .. okey)
end
redis.call('DEL', base .. ':jobs', base .. ':wait', base .. ':delayed', base .. ':active',
  base .. ':completed', base .. ':failed', base .. ':groups', base .. ':id', base .. ':seq')
return 1
"#;

struct Scripts {
    add: Script,
    claim: Script,
    complete: Script,
    fail: Script,
    remove: Script,
    ids_in: Script,
    counts: Script,
    obliterate: Script,
}

impl Scripts {
    fn load() -> Self {
        let with_helpers = |body: &str| Script::new(&format!("{LUA_HELPERS}\n{body}"));
        Self {
            add: Script::new(LUA_ADD),
            claim: Script::new(LUA_CLAIM),
            complete: with_helpers(LUA_COMPLETE),
            fail: with_helpers(LUA_FAIL),
            remove: with_helpers(LUA_REMOVE),
            ids_in: Script::new(LUA_IDS_IN),
            counts: Script::new(LUA_COUNTS),
            obliterate: Script::new(LUA_OBLITERATE),
        }
    }
}

fn state_name(state: JobState) -> &'static str {
    match state {
        JobState::Waiting => "waiting",
        JobState::Grouped => "grouped",
        JobState::Delayed => "delayed",
        JobState::Active => "active",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
    }
}

fn parse_state(raw: &str) -> Option<JobState> {
    JobState::all().into_iter().find(|state| state_name(*state) == raw)
}

fn backoff_kind_name(kind: BackoffKind) -> &'static str {
    match kind {
        BackoffKind::Fixed => "fixed",
        BackoffKind::Exponential => "exponential",
    }
}

/// `(mode, value)` script arguments for a retention policy.
fn retention_args(retention: Retention) -> (&'static str, i64) {
    match retention {
        Retention::KeepAll => ("all", 0),
        Retention::Count(n) => ("count", i64::try_from(n).unwrap_or(i64::MAX)),
        Retention::Age(age) => ("age", duration_ms(age)),
    }
}

fn millis_to_datetime(raw: Option<&String>) -> Option<DateTime<Utc>> {
    raw.and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

/// Build a [`Job`] from its stored hash. `None` if the hash is empty.
fn job_from_hash(id: &str, fields: &HashMap<String, String>) -> Result<Option<Job>, BrokerError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let text = |key: &str| fields.get(key).cloned().unwrap_or_default();
    let number = |key: &str| fields.get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);

    let data: JsonValue = serde_json::from_str(&text("data"))
        .map_err(|e| BrokerError::Serialization(format!("job {id}: {e}")))?;
    let state = parse_state(&text("state"))
        .ok_or_else(|| BrokerError::Serialization(format!("job {id}: unknown state {:?}", text("state"))))?;
    let kind = if text("backoff_kind") == "fixed" {
        BackoffKind::Fixed
    } else {
        BackoffKind::Exponential
    };
    let ordering_key = text("ordering_key");
    let failed_reason = text("failed_reason");

    Ok(Some(Job {
        id: id.to_string(),
        name: text("name"),
        data,
        state,
        attempts_made: u32::try_from(number("attempts_made")).unwrap_or(u32::MAX),
        attempts: u32::try_from(number("attempts")).unwrap_or(u32::MAX),
        backoff: Backoff {
            kind,
            delay: Duration::from_millis(number("backoff_ms")),
        },
        ordering_key: (!ordering_key.is_empty()).then_some(ordering_key),
        failed_reason: (!failed_reason.is_empty()).then_some(failed_reason),
        created_at: millis_to_datetime(fields.get("created_at")).unwrap_or_else(Utc::now),
        processed_at: millis_to_datetime(fields.get("processed_at")),
        finished_at: millis_to_datetime(fields.get("finished_at")),
    }))
}

/// Redis job-queue broker over one multiplexed, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisBroker {
    shared: Arc<Shared>,
}

struct Shared {
    conn: ConnectionManager,
    scripts: Scripts,
    status: Mutex<ConnectionStatus>,
    listeners: Mutex<Vec<ConnectionListener>>,
    poll_interval: Duration,
    stalled_grace: Duration,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if lock(&self.status).is_terminal() {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn notify(&self, event: &ConnectionEvent) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            guarded("connection", || listener(event));
        }
    }

    /// Map a Redis error, reporting transport failures to connection listeners.
    fn map_err(&self, err: RedisError) -> BrokerError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            let mapped = BrokerError::Connection(err.to_string());
            self.notify(&ConnectionEvent::Error(mapped.clone()));
            mapped
        } else {
            BrokerError::Command(err.to_string())
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

impl core::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connect for RedisBroker {
    type Params = RedisParams;

    async fn connect(params: RedisParams) -> Result<Self, BrokerError> {
        let client = redis::Client::open(params.url.as_str()).map_err(|e| BrokerError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(Shared {
                conn,
                scripts: Scripts::load(),
                status: Mutex::new(ConnectionStatus::Ready),
                listeners: Mutex::new(Vec::new()),
                poll_interval: params.poll_interval,
                stalled_grace: params.stalled_grace,
            }),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn status(&self) -> ConnectionStatus {
        *lock(&self.shared.status)
    }

    fn on_connection_event(&self, listener: ConnectionListener) {
        lock(&self.shared.listeners).push(listener);
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        let mut conn = self.shared.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.shared.map_err(e))?;
        Ok(())
    }

    async fn quit(&self) -> Result<(), BrokerError> {
        {
            let mut status = lock(&self.shared.status);
            if status.is_terminal() {
                return Ok(());
            }
            *status = ConnectionStatus::Closing;
        }

        // QUIT is best effort; the manager drops the socket when the last clone goes.
        let mut conn = self.shared.conn();
        let quit: Result<String, RedisError> = redis::cmd("QUIT").query_async(&mut conn).await;
        if let Err(err) = quit {
            debug!(error = %err, "QUIT failed");
        }

        *lock(&self.shared.status) = ConnectionStatus::Closed;
        self.shared.notify(&ConnectionEvent::Closed);
        Ok(())
    }

    fn queue(&self, name: &str, options: QueueOptions) -> Result<Arc<dyn BrokerQueue>, BrokerError> {
        self.shared.ensure_open()?;
        Ok(Arc::new(RedisQueue {
            name: name.to_string(),
            base: format!("{}:{}", options.prefix, name),
            defaults: options.defaults,
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
            on_error: options.on_error,
        }))
    }

    async fn consume(
        &self,
        queue: &str,
        processor: JobProcessor,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn BrokerWorker>, BrokerError> {
        self.shared.ensure_open()?;
        let concurrency = options.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            base: format!("{}:{}", options.prefix, queue),
            processor,
            semaphore: semaphore.clone(),
            lock_duration: options.effective_lock_duration(),
            remove_on_complete: options.remove_on_complete.unwrap_or_default(),
            remove_on_fail: options.remove_on_fail.unwrap_or_default(),
            listeners: options.listeners,
        };
        let join = tokio::spawn(dispatcher.run(shutdown_rx));

        Ok(Arc::new(RedisWorker {
            queue_name: queue.to_string(),
            concurrency,
            semaphore,
            running: AtomicBool::new(true),
            shutdown: shutdown_tx,
            join: Mutex::new(Some(join)),
        }))
    }
}

/// Queue handle returned by [`RedisBroker::queue`].
pub struct RedisQueue {
    name: String,
    base: String,
    defaults: DefaultJobOptions,
    shared: Arc<Shared>,
    closed: AtomicBool,
    on_error: Option<ErrorListener>,
}

impl RedisQueue {
    fn ensure_usable(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.shared.ensure_open()
    }

    fn map_err(&self, err: RedisError) -> BrokerError {
        let mapped = self.shared.map_err(err);
        if let Some(listener) = &self.on_error {
            guarded("queue error", || listener(&mapped));
        }
        mapped
    }

    async fn ids_in(&self, states: &[JobState]) -> Result<Vec<String>, BrokerError> {
        let mut invocation = self.shared.scripts.ids_in.key(&self.base);
        for state in states {
            invocation.arg(state_name(*state));
        }
        let mut conn = self.shared.conn();
        invocation.invoke_async(&mut conn).await.map_err(|e| self.map_err(e))
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, BrokerError> {
        let mut conn = self.shared.conn();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(format!("{}:job:{id}", self.base))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.map_err(e))?;
        job_from_hash(id, &fields)
    }

    async fn remove_ids(&self, ids: &[String]) -> Result<usize, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut invocation = self.shared.scripts.remove.key(&self.base);
        for id in ids {
            invocation.arg(id);
        }
        let mut conn = self.shared.conn();
        let removed: usize = invocation.invoke_async(&mut conn).await.map_err(|e| self.map_err(e))?;
        Ok(removed)
    }
}

#[async_trait]
impl BrokerQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, data, options), fields(queue = %self.name), err)]
    async fn add(&self, name: &str, data: JsonValue, options: JobOptions) -> Result<String, BrokerError> {
        self.ensure_usable()?;
        let payload = serde_json::to_string(&data).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let attempts = options.attempts.unwrap_or(self.defaults.attempts).max(1);
        let backoff = options.backoff.unwrap_or(self.defaults.backoff);
        let delay = options.delay.map(duration_ms).unwrap_or(0);

        let mut conn = self.shared.conn();
        let id: String = self
            .shared
            .scripts
            .add
            .key(&self.base)
            .arg(options.job_id.as_deref().unwrap_or(""))
            .arg(name)
            .arg(payload)
            .arg(attempts)
            .arg(backoff_kind_name(backoff.kind))
            .arg(duration_ms(backoff.delay))
            .arg(options.ordering_key.as_deref().unwrap_or(""))
            .arg(delay)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(id)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, BrokerError> {
        self.ensure_usable()?;
        self.load(id).await
    }

    async fn get_jobs(
        &self,
        states: &[JobState],
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, BrokerError> {
        self.ensure_usable()?;
        let ids = self.ids_in(states).await?;

        let mut jobs = Vec::new();
        for id in ids.iter().skip(offset).take(limit.unwrap_or(usize::MAX)) {
            if let Some(job) = self.load(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn remove_job(&self, id: &str) -> Result<bool, BrokerError> {
        self.ensure_usable()?;
        Ok(self.remove_ids(&[id.to_string()]).await? > 0)
    }

    async fn job_counts(&self) -> Result<JobCounts, BrokerError> {
        self.ensure_usable()?;
        let mut conn = self.shared.conn();
        let states: Vec<String> = self
            .shared
            .scripts
            .counts
            .key(&self.base)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.map_err(e))?;

        let mut counts = JobCounts::default();
        for state in states.iter().filter_map(|raw| parse_state(raw)) {
            counts.increment(state);
        }
        Ok(counts)
    }

    async fn clean(&self, grace: Duration, limit: usize, state: JobState) -> Result<Vec<String>, BrokerError> {
        self.ensure_usable()?;
        let cutoff = now_ms().saturating_sub(duration_ms(grace));
        let jobs = self.get_jobs(&[state], 0, None).await?;

        let ids: Vec<String> = jobs
            .into_iter()
            .filter(|job| job.finished_at.unwrap_or(job.created_at).timestamp_millis() <= cutoff)
            .map(|job| job.id)
            .take(if limit == 0 { usize::MAX } else { limit })
            .collect();
        self.remove_ids(&ids).await?;
        Ok(ids)
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.ensure_usable()?;
        let ids = self
            .ids_in(&[JobState::Waiting, JobState::Grouped, JobState::Delayed])
            .await?;
        self.remove_ids(&ids).await?;
        Ok(())
    }

    async fn obliterate(&self, force: bool) -> Result<(), BrokerError> {
        self.ensure_usable()?;
        let mut conn = self.shared.conn();
        let done: i64 = self
            .shared
            .scripts
            .obliterate
            .key(&self.base)
            .arg(if force { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.map_err(e))?;

        if done == 0 {
            return Err(BrokerError::QueueBusy(self.name.clone()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
    queue: String,
    base: String,
    processor: JobProcessor,
    semaphore: Arc<Semaphore>,
    lock_duration: Duration,
    remove_on_complete: Retention,
    remove_on_fail: Retention,
    listeners: WorkerListeners,
}

impl Dispatcher {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let this = Arc::new(self);
        debug!(queue = %this.queue, "redis worker started");

        'dispatch: loop {
            if *shutdown.borrow() || this.shared.ensure_open().is_err() {
                break;
            }

            let permit = tokio::select! {
                permit = this.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let claimed = loop {
                if *shutdown.borrow() || this.shared.ensure_open().is_err() {
                    break 'dispatch;
                }

                let token = Uuid::now_v7().to_string();
                match this.claim(&token).await {
                    Ok(Some(job)) => break (job, token),
                    Ok(None) => {}
                    Err(err) => {
                        this.report(&err);
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(this.shared.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break 'dispatch;
                        }
                    }
                }
            };

            let worker = this.clone();
            tokio::spawn(async move {
                let (job, token) = claimed;
                worker.process(job, token).await;
                drop(permit);
            });
        }

        debug!(queue = %this.queue, "redis worker stopped");
    }

    async fn claim(&self, token: &str) -> Result<Option<Job>, BrokerError> {
        let mut conn = self.shared.conn();
        let id: Option<String> = self
            .shared
            .scripts
            .claim
            .key(&self.base)
            .arg(now_ms())
            .arg(duration_ms(self.lock_duration))
            .arg(token)
            .arg(duration_ms(self.shared.stalled_grace))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.shared.map_err(e))?;

        let Some(id) = id else {
            return Ok(None);
        };
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(format!("{}:job:{id}", self.base))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.shared.map_err(e))?;
        job_from_hash(&id, &fields)
    }

    async fn process(&self, job: Job, token: String) {
        let mut handle = tokio::spawn((self.processor)(job.clone()));

        let outcome = match tokio::time::timeout(self.lock_duration, &mut handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(err.to_string()),
            Ok(Err(join_err)) if join_err.is_panic() => Err("job handler panicked".to_string()),
            Ok(Err(_)) => Err("job handler was cancelled".to_string()),
            Err(_) => {
                handle.abort();
                Err(format!("job lock expired after {} ms", self.lock_duration.as_millis()))
            }
        };

        let result = match outcome {
            Ok(()) => self.complete(job, &token).await,
            Err(reason) => self.fail(job, &token, reason).await,
        };
        if let Err(err) = result {
            error!(queue = %self.queue, error = %err, "failed to record job outcome");
            self.report(&err);
        }
    }

    async fn complete(&self, mut job: Job, token: &str) -> Result<(), BrokerError> {
        let now = now_ms();
        let (mode, value) = retention_args(self.remove_on_complete);
        let mut conn = self.shared.conn();
        let recorded: i64 = self
            .shared
            .scripts
            .complete
            .key(&self.base)
            .arg(&job.id)
            .arg(token)
            .arg(now)
            .arg(mode)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.shared.map_err(e))?;

        if recorded == 0 {
            warn!(queue = %self.queue, job_id = %job.id, "job lock lost before completion");
            return Ok(());
        }

        job.state = JobState::Completed;
        job.finished_at = DateTime::from_timestamp_millis(now);
        if let Some(listener) = &self.listeners.on_completed {
            guarded("completed", || listener(&job));
        }
        Ok(())
    }

    async fn fail(&self, mut job: Job, token: &str, reason: String) -> Result<(), BrokerError> {
        let now = now_ms();
        let (mode, value) = retention_args(self.remove_on_fail);
        let mut conn = self.shared.conn();
        let (made, retry): (u32, i64) = self
            .shared
            .scripts
            .fail
            .key(&self.base)
            .arg(&job.id)
            .arg(token)
            .arg(now)
            .arg(&reason)
            .arg(mode)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.shared.map_err(e))?;

        if made == 0 {
            warn!(queue = %self.queue, job_id = %job.id, "job lock lost before failure was recorded");
            return Ok(());
        }

        let will_retry = retry == 1;
        job.attempts_made = made;
        job.failed_reason = Some(reason.clone());
        if will_retry {
            job.state = JobState::Delayed;
        } else {
            job.state = JobState::Failed;
            job.finished_at = DateTime::from_timestamp_millis(now);
        }

        if let Some(listener) = &self.listeners.on_failed {
            let failure = JobFailure {
                job,
                error: reason,
                will_retry,
            };
            guarded("failed", || listener(failure));
        }
        Ok(())
    }

    fn report(&self, err: &BrokerError) {
        if let Some(listener) = &self.listeners.on_error {
            guarded("worker error", || listener(err));
        }
    }
}

/// Worker handle returned by [`RedisBroker::consume`].
pub struct RedisWorker {
    queue_name: String,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerWorker for RedisWorker {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);

        let join = lock(&self.join).take();
        if let Some(join) = join {
            let _ = join.await;
        }

        let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            all.forget();
        }
        self.semaphore.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn job_hash_round_trips_into_job() {
        let fields = hash(&[
            ("name", "orders.created"),
            ("data", r#"{"topic":"orders.created","data":{"id":1},"traceId":"t1"}"#),
            ("state", "delayed"),
            ("attempts_made", "2"),
            ("attempts", "3"),
            ("backoff_kind", "fixed"),
            ("backoff_ms", "500"),
            ("ordering_key", "orders.created.invoice.g1"),
            ("failed_reason", "boom"),
            ("created_at", "1700000000000"),
        ]);

        let job = job_from_hash("42", &fields).unwrap().unwrap();
        assert_eq!(job.id, "42");
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempts_made, 2);
        assert!(job.has_attempts_left());
        assert_eq!(job.backoff, Backoff::fixed(Duration::from_millis(500)));
        assert_eq!(job.ordering_key.as_deref(), Some("orders.created.invoice.g1"));
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));
        assert_eq!(job.created_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(job.data["traceId"], "t1");
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn empty_hash_means_missing_job() {
        assert_eq!(job_from_hash("1", &HashMap::new()).unwrap(), None);
    }

    #[test]
    fn corrupt_payload_is_a_serialization_error() {
        let fields = hash(&[("data", "{not json"), ("state", "waiting")]);
        assert!(matches!(
            job_from_hash("1", &fields),
            Err(BrokerError::Serialization(_))
        ));
    }

    #[test]
    fn state_names_parse_back() {
        for state in JobState::all() {
            assert_eq!(parse_state(state_name(state)), Some(state));
        }
        assert_eq!(parse_state("paused"), None);
    }

    #[test]
    fn retention_maps_to_script_args() {
        assert_eq!(retention_args(Retention::KeepAll), ("all", 0));
        assert_eq!(retention_args(Retention::Count(10)), ("count", 10));
        assert_eq!(retention_args(Retention::Age(Duration::from_secs(2))), ("age", 2000));
    }

    // Needs a live server: `REDIS_URL=redis://localhost:6379 cargo test -p eventq-infra --features redis -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn add_claim_complete_against_live_redis() {
        let broker = RedisBroker::connect(RedisParams::from_env()).await.unwrap();
        broker.ping().await.unwrap();

        let prefix = format!("eventq-test-{}", Uuid::now_v7());
        let queue = broker
            .queue("t.s", QueueOptions::new(prefix.clone(), DefaultJobOptions::default()))
            .unwrap();
        let id = queue
            .add("t", serde_json::json!({"n": 1}), JobOptions::default().with_job_id("a"))
            .await
            .unwrap();
        assert_eq!(id, "a");
        let again = queue
            .add("t", serde_json::json!({"n": 2}), JobOptions::default().with_job_id("a"))
            .await
            .unwrap();
        assert_eq!(again, "a");
        assert_eq!(queue.job_counts().await.unwrap().waiting, 1);

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let processor: JobProcessor = Arc::new(move |_job| {
            let flag = flag.clone();
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
        });
        let worker = broker
            .consume("t.s", processor, ConsumerOptions::new(prefix, 1))
            .await
            .unwrap();

        for _ in 0..100 {
            if queue.job_counts().await.unwrap().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        worker.close().await.unwrap();
        assert!(done.load(Ordering::SeqCst));

        queue.obliterate(true).await.unwrap();
        broker.quit().await.unwrap();
    }
}
