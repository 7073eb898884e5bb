//! In-memory broker for tests/dev.
//!
//! - Durable for the lifetime of the broker value (queues survive handle close)
//! - Retry with backoff, count/age retention, ordering keys, lock timeouts
//! - One dispatcher task per worker plus one task per in-flight job

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{
    Broker, BrokerQueue, BrokerWorker, Connect, ConnectionEvent, ConnectionListener, ConnectionStatus,
    ConsumerOptions, ErrorListener, JobFailure, JobProcessor, QueueOptions, WorkerListeners,
};
use crate::error::BrokerError;
use crate::job::{DefaultJobOptions, Job, JobCounts, JobOptions, JobState, Retention};

/// Upper bound on how long an idle dispatcher sleeps before re-checking its queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking listener must not take the whole broker down with it.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connection parameters for [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryParams {
    pub poll_interval: Duration,
}

impl Default for InMemoryParams {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// In-process broker.
///
/// Cloning yields another handle to the same connection and storage.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    status: Mutex<ConnectionStatus>,
    listeners: Mutex<Vec<ConnectionListener>>,
    stores: Mutex<HashMap<String, Arc<QueueStore>>>,
    faults: Mutex<HashMap<String, String>>,
    poll_interval: Duration,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if lock(&self.status).is_terminal() {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn fault_for(&self, queue: &str) -> Option<String> {
        lock(&self.faults).get(queue).cloned()
    }

    fn notify(&self, event: &ConnectionEvent) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("connection listener panicked");
            }
        }
    }
}

impl core::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("status", &self.status())
            .field("queues", &self.queue_names())
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_params(InMemoryParams::default())
    }

    pub fn with_params(params: InMemoryParams) -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(ConnectionStatus::Ready),
                listeners: Mutex::new(Vec::new()),
                stores: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                poll_interval: params.poll_interval,
            }),
        }
    }

    /// Names of every queue that has storage, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.shared.stores)
            .values()
            .map(|store| store.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Make every `add` on `queue` fail with a connection error (`None` clears it).
    pub fn set_queue_fault(&self, queue: &str, message: Option<String>) {
        let mut faults = lock(&self.shared.faults);
        match message {
            Some(message) => {
                faults.insert(queue.to_string(), message);
            }
            None => {
                faults.remove(queue);
            }
        }
    }

    /// Report a transport error to connection listeners without changing status.
    pub fn emit_connection_error(&self, message: impl Into<String>) {
        self.shared
            .notify(&ConnectionEvent::Error(BrokerError::Connection(message.into())));
    }

    fn store(&self, prefix: &str, name: &str) -> Arc<QueueStore> {
        let key = format!("{prefix}:{name}");
        lock(&self.shared.stores)
            .entry(key)
            .or_insert_with(|| Arc::new(QueueStore::new(name)))
            .clone()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn status(&self) -> ConnectionStatus {
        *lock(&self.shared.status)
    }

    fn on_connection_event(&self, listener: ConnectionListener) {
        lock(&self.shared.listeners).push(listener);
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.shared.ensure_open()
    }

    async fn quit(&self) -> Result<(), BrokerError> {
        {
            let mut status = lock(&self.shared.status);
            if *status == ConnectionStatus::Closed {
                return Ok(());
            }
            *status = ConnectionStatus::Closed;
        }
        self.shared.notify(&ConnectionEvent::Closed);
        Ok(())
    }

    fn queue(&self, name: &str, options: QueueOptions) -> Result<Arc<dyn BrokerQueue>, BrokerError> {
        self.shared.ensure_open()?;
        let store = self.store(&options.prefix, name);
        lock(&store.data).defaults = options.defaults;

        Ok(Arc::new(InMemoryQueue {
            name: name.to_string(),
            store,
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
        let store = self.store(&options.prefix, queue);
        let concurrency = options.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher {
            shared: self.shared.clone(),
            store,
            processor,
            semaphore: semaphore.clone(),
            lock_duration: options.effective_lock_duration(),
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
            listeners: options.listeners,
        };
        let join = tokio::spawn(dispatcher.run(shutdown_rx));

        Ok(Arc::new(InMemoryWorker {
            queue_name: queue.to_string(),
            concurrency,
            semaphore,
            running: AtomicBool::new(true),
            shutdown: shutdown_tx,
            join: Mutex::new(Some(join)),
        }))
    }
}

#[async_trait]
impl Connect for InMemoryBroker {
    type Params = InMemoryParams;

    async fn connect(params: Self::Params) -> Result<Self, BrokerError> {
        Ok(Self::with_params(params))
    }
}

struct StoredJob {
    job: Job,
    seq: u64,
    due: Option<Instant>,
}

#[derive(Default)]
struct QueueData {
    defaults: DefaultJobOptions,
    jobs: HashMap<String, StoredJob>,
    waiting: VecDeque<String>,
    grouped: HashMap<String, VecDeque<String>>,
    group_holders: HashMap<String, String>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    next_id: u64,
    seq: u64,
}

struct QueueStore {
    name: String,
    data: Mutex<QueueData>,
    notify: Notify,
}

impl QueueStore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: Mutex::new(QueueData::default()),
            notify: Notify::new(),
        }
    }

    /// Promote due delayed jobs, then claim the oldest waiting job.
    fn claim(&self, now: Instant) -> Option<Job> {
        let mut data = lock(&self.data);

        let mut due: Vec<(Instant, u64, String)> = data
            .jobs
            .iter()
            .filter(|(_, stored)| stored.job.state == JobState::Delayed)
            .filter_map(|(id, stored)| match stored.due {
                Some(at) if at <= now => Some((at, stored.seq, id.clone())),
                _ => None,
            })
            .collect();
        due.sort();
        for (_, _, id) in due {
            if let Some(stored) = data.jobs.get_mut(&id) {
                stored.job.state = JobState::Waiting;
                stored.due = None;
            }
            data.waiting.push_back(id);
        }

        while let Some(id) = data.waiting.pop_front() {
            if let Some(stored) = data.jobs.get_mut(&id) {
                stored.job.state = JobState::Active;
                stored.job.processed_at = Some(Utc::now());
                return Some(stored.job.clone());
            }
        }
        None
    }

    fn next_due(&self) -> Option<Instant> {
        lock(&self.data)
            .jobs
            .values()
            .filter(|stored| stored.job.state == JobState::Delayed)
            .filter_map(|stored| stored.due)
            .min()
    }

    fn complete(&self, id: &str, retention: Retention) -> Option<Job> {
        let job = {
            let mut data = lock(&self.data);
            let stored = data.jobs.get_mut(id)?;
            if stored.job.state != JobState::Active {
                return None;
            }
            stored.job.state = JobState::Completed;
            stored.job.finished_at = Some(Utc::now());
            let job = stored.job.clone();

            data.completed.push_back(id.to_string());
            data.release_group(&job);
            data.apply_retention(JobState::Completed, retention);
            job
        };
        self.notify.notify_one();
        Some(job)
    }

    fn fail(&self, id: &str, error: &str, retention: Retention) -> Option<JobFailure> {
        let failure = {
            let mut data = lock(&self.data);
            let stored = data.jobs.get_mut(id)?;
            if stored.job.state != JobState::Active {
                return None;
            }
            stored.job.attempts_made += 1;
            stored.job.failed_reason = Some(error.to_string());

            let will_retry = stored.job.has_attempts_left();
            if will_retry {
                let delay = stored.job.backoff.delay_for_attempt(stored.job.attempts_made);
                stored.job.state = JobState::Delayed;
                stored.due = Some(Instant::now() + delay);
            } else {
                stored.job.state = JobState::Failed;
                stored.job.finished_at = Some(Utc::now());
            }
            let job = stored.job.clone();

            if !will_retry {
                data.failed.push_back(id.to_string());
                data.release_group(&job);
                data.apply_retention(JobState::Failed, retention);
            }

            JobFailure {
                job,
                error: error.to_string(),
                will_retry,
            }
        };
        self.notify.notify_one();
        Some(failure)
    }
}

impl QueueData {
    fn insert(&mut self, name: &str, data: JsonValue, options: JobOptions) -> String {
        let id = match options.job_id {
            Some(id) => id,
            None => {
                self.next_id += 1;
                self.next_id.to_string()
            }
        };

        let delay = options.delay.unwrap_or(Duration::ZERO);
        let mut job = Job {
            id: id.clone(),
            name: name.to_string(),
            data,
            state: JobState::Waiting,
            attempts_made: 0,
            attempts: options.attempts.unwrap_or(self.defaults.attempts).max(1),
            backoff: options.backoff.unwrap_or(self.defaults.backoff),
            ordering_key: options.ordering_key.clone(),
            failed_reason: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
        };
        let mut due = None;

        let held = match &options.ordering_key {
            Some(key) if self.group_holders.contains_key(key) => {
                self.grouped.entry(key.clone()).or_default().push_back(id.clone());
                true
            }
            Some(key) => {
                self.group_holders.insert(key.clone(), id.clone());
                false
            }
            None => false,
        };

        if held {
            job.state = JobState::Grouped;
        } else if delay > Duration::ZERO {
            job.state = JobState::Delayed;
            due = Some(Instant::now() + delay);
        } else {
            self.waiting.push_back(id.clone());
        }

        self.seq += 1;
        self.jobs.insert(
            id.clone(),
            StoredJob {
                job,
                seq: self.seq,
                due,
            },
        );
        id
    }

    /// Hand the ordering key of a finished job to the next job in its group.
    fn release_group(&mut self, job: &Job) {
        let Some(key) = &job.ordering_key else {
            return;
        };
        if self.group_holders.get(key) != Some(&job.id) {
            return;
        }

        let next = self.grouped.get_mut(key).and_then(|queue| queue.pop_front());
        if self.grouped.get(key).is_some_and(|queue| queue.is_empty()) {
            self.grouped.remove(key);
        }

        match next {
            Some(next_id) => {
                if let Some(stored) = self.jobs.get_mut(&next_id) {
                    stored.job.state = JobState::Waiting;
                }
                self.group_holders.insert(key.clone(), next_id.clone());
                self.waiting.push_back(next_id);
            }
            None => {
                self.group_holders.remove(key);
            }
        }
    }

    fn apply_retention(&mut self, state: JobState, retention: Retention) {
        let list = match state {
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            _ => return,
        };

        let mut expired = Vec::new();
        match retention {
            Retention::KeepAll => {}
            Retention::Count(keep) => {
                while list.len() > keep {
                    if let Some(id) = list.pop_front() {
                        expired.push(id);
                    }
                }
            }
            Retention::Age(max_age) => {
                let cutoff = chrono::Duration::from_std(max_age)
                    .ok()
                    .and_then(|age| Utc::now().checked_sub_signed(age));
                let Some(cutoff) = cutoff else {
                    return;
                };
                let jobs = &self.jobs;
                list.retain(|id| {
                    let keep = jobs
                        .get(id)
                        .and_then(|stored| stored.job.finished_at)
                        .is_some_and(|at| at > cutoff);
                    if !keep {
                        expired.push(id.clone());
                    }
                    keep
                });
            }
        }

        for id in expired {
            self.jobs.remove(&id);
        }
    }

    fn remove(&mut self, id: &str) -> Option<Job> {
        let stored = self.jobs.remove(id)?;
        self.waiting.retain(|other| other != id);
        self.completed.retain(|other| other != id);
        self.failed.retain(|other| other != id);
        if let Some(key) = &stored.job.ordering_key {
            if let Some(queue) = self.grouped.get_mut(key) {
                queue.retain(|other| other != id);
            }
        }
        self.release_group(&stored.job);
        Some(stored.job)
    }

    fn ids_in(&self, states: &[JobState]) -> Vec<String> {
        let mut matching: Vec<(u64, &String)> = self
            .jobs
            .iter()
            .filter(|(_, stored)| states.contains(&stored.job.state))
            .map(|(id, stored)| (stored.seq, id))
            .collect();
        matching.sort();
        matching.into_iter().map(|(_, id)| id.clone()).collect()
    }
}

/// Queue handle returned by [`InMemoryBroker::queue`].
pub struct InMemoryQueue {
    name: String,
    store: Arc<QueueStore>,
    shared: Arc<Shared>,
    closed: AtomicBool,
    on_error: Option<ErrorListener>,
}

impl InMemoryQueue {
    fn ensure_usable(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.shared.ensure_open()
    }

    fn report(&self, error: &BrokerError) {
        if let Some(listener) = &self.on_error {
            if catch_unwind(AssertUnwindSafe(|| listener(error))).is_err() {
                warn!(queue = %self.name, "queue error listener panicked");
            }
        }
    }
}

#[async_trait]
impl BrokerQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, name: &str, data: JsonValue, options: JobOptions) -> Result<String, BrokerError> {
        self.ensure_usable()?;
        if let Some(message) = self.shared.fault_for(&self.name) {
            let error = BrokerError::Connection(message);
            self.report(&error);
            return Err(error);
        }

        let id = {
            let mut data_guard = lock(&self.store.data);
            match options.job_id.as_deref() {
                Some(existing) if data_guard.jobs.contains_key(existing) => {
                    debug!(queue = %self.name, job_id = %existing, "duplicate job id, add skipped");
                    return Ok(existing.to_string());
                }
                _ => data_guard.insert(name, data, options),
            }
        };
        self.store.notify.notify_one();
        Ok(id)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, BrokerError> {
        self.ensure_usable()?;
        Ok(lock(&self.store.data).jobs.get(id).map(|stored| stored.job.clone()))
    }

    async fn get_jobs(
        &self,
        states: &[JobState],
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, BrokerError> {
        self.ensure_usable()?;
        let data = lock(&self.store.data);
        let ids = data.ids_in(states);
        Ok(ids
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .filter_map(|id| data.jobs.get(id).map(|stored| stored.job.clone()))
            .collect())
    }

    async fn remove_job(&self, id: &str) -> Result<bool, BrokerError> {
        self.ensure_usable()?;
        let removed = lock(&self.store.data).remove(id).is_some();
        if removed {
            self.store.notify.notify_one();
        }
        Ok(removed)
    }

    async fn job_counts(&self) -> Result<JobCounts, BrokerError> {
        self.ensure_usable()?;
        let data = lock(&self.store.data);
        let mut counts = JobCounts::default();
        for stored in data.jobs.values() {
            counts.increment(stored.job.state);
        }
        Ok(counts)
    }

    async fn clean(&self, grace: Duration, limit: usize, state: JobState) -> Result<Vec<String>, BrokerError> {
        self.ensure_usable()?;
        let cutoff = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace));
        let Some(cutoff) = cutoff else {
            return Ok(Vec::new());
        };

        let mut data = lock(&self.store.data);
        let candidates: Vec<String> = data
            .ids_in(&[state])
            .into_iter()
            .filter(|id| {
                data.jobs.get(id).is_some_and(|stored| {
                    let at = stored.job.finished_at.unwrap_or(stored.job.created_at);
                    at <= cutoff
                })
            })
            .take(if limit == 0 { usize::MAX } else { limit })
            .collect();

        for id in &candidates {
            data.remove(id);
        }
        Ok(candidates)
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.ensure_usable()?;
        let mut data = lock(&self.store.data);
        let pending = data.ids_in(&[JobState::Waiting, JobState::Grouped, JobState::Delayed]);
        for id in pending {
            data.remove(&id);
        }
        Ok(())
    }

    async fn obliterate(&self, force: bool) -> Result<(), BrokerError> {
        self.ensure_usable()?;
        let mut data = lock(&self.store.data);
        let active = data.jobs.values().any(|stored| stored.job.state == JobState::Active);
        if active && !force {
            return Err(BrokerError::QueueBusy(self.name.clone()));
        }

        let defaults = data.defaults;
        *data = QueueData {
            defaults,
            ..QueueData::default()
        };
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
    store: Arc<QueueStore>,
    processor: JobProcessor,
    semaphore: Arc<Semaphore>,
    lock_duration: Duration,
    remove_on_complete: Option<Retention>,
    remove_on_fail: Option<Retention>,
    listeners: WorkerListeners,
}

impl Dispatcher {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let this = Arc::new(self);
        debug!(queue = %this.store.name, "in-memory worker started");

        'dispatch: loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(error) = this.shared.ensure_open() {
                this.report(&error);
                break;
            }

            let permit = tokio::select! {
                permit = this.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let job = loop {
                if *shutdown.borrow() || this.shared.ensure_open().is_err() {
                    break 'dispatch;
                }

                let now = Instant::now();
                if let Some(job) = this.store.claim(now) {
                    break job;
                }

                let poll = this.shared.poll_interval;
                let wait = this
                    .store
                    .next_due()
                    .map(|due| due.saturating_duration_since(now).min(poll))
                    .unwrap_or(poll);

                tokio::select! {
                    _ = this.store.notify.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break 'dispatch;
                        }
                    }
                }
            };

            let worker = this.clone();
            tokio::spawn(async move {
                worker.process(job).await;
                drop(permit);
            });
        }

        debug!(queue = %this.store.name, "in-memory worker stopped");
    }

    async fn process(&self, job: Job) {
        let id = job.id.clone();
        let mut handle = tokio::spawn((self.processor)(job));

        let outcome = match tokio::time::timeout(self.lock_duration, &mut handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(error))) => Err(error.to_string()),
            Ok(Err(join_error)) if join_error.is_panic() => Err("job handler panicked".to_string()),
            Ok(Err(_)) => Err("job handler was cancelled".to_string()),
            Err(_) => {
                handle.abort();
                Err(format!("job lock expired after {} ms", self.lock_duration.as_millis()))
            }
        };

        let defaults = lock(&self.store.data).defaults;
        match outcome {
            Ok(()) => {
                let retention = self.remove_on_complete.unwrap_or(defaults.remove_on_complete);
                if let Some(job) = self.store.complete(&id, retention) {
                    if let Some(listener) = &self.listeners.on_completed {
                        if catch_unwind(AssertUnwindSafe(|| listener(&job))).is_err() {
                            warn!(queue = %self.store.name, job_id = %id, "completed listener panicked");
                        }
                    }
                }
            }
            Err(error) => {
                let retention = self.remove_on_fail.unwrap_or(defaults.remove_on_fail);
                if let Some(failure) = self.store.fail(&id, &error, retention) {
                    if let Some(listener) = &self.listeners.on_failed {
                        if catch_unwind(AssertUnwindSafe(|| listener(failure))).is_err() {
                            warn!(queue = %self.store.name, job_id = %id, "failed listener panicked");
                        }
                    }
                }
            }
        }
    }

    fn report(&self, error: &BrokerError) {
        if let Some(listener) = &self.listeners.on_error {
            if catch_unwind(AssertUnwindSafe(|| listener(error))).is_err() {
                warn!(queue = %self.store.name, "worker error listener panicked");
            }
        }
    }
}

/// Worker handle returned by [`InMemoryBroker::consume`].
pub struct InMemoryWorker {
    queue_name: String,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerWorker for InMemoryWorker {
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

        // Every permit back means every in-flight job has finished.
        let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            all.forget();
        }
        self.semaphore.close();
        Ok(())
    }
}
