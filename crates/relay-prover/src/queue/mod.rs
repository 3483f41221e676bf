use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use storage::jobs::{JobState, JobStore, JobStoreError, StoredJob};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};

pub mod events;

pub use events::{spawn_event_logger, EventMonitor, JobOutcome, QueueEvent};

/// Name of the queue holding newly observed updates.
pub const UPDATE_QUEUE: &str = "updates";
/// Name of the queue holding proof generation jobs.
pub const PROOF_QUEUE: &str = "proofs";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(u64),
    #[error("job {0} is currently leased by a worker")]
    JobActive(u64),
    #[error("lease on job {0} expired or was taken over by another consumer")]
    LeaseLost(u64),
    #[error("queue {0} is closed")]
    Closed(String),
    #[error("Storage error: {0}")]
    Store(#[from] JobStoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Seconds a dequeued job stays invisible to other consumers.
    pub visibility_timeout_secs: u64,

    /// Number of failed attempts after which a job becomes terminally failed.
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff in milliseconds.
    pub backoff_base_ms: u64,

    /// Upper bound for the retry backoff in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 600,
            max_attempts: 10,
            backoff_base_ms: 15_000,
            backoff_max_ms: 600_000,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Returns the delay before retrying a job that has failed `attempts` times.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued,
    AlreadyPresent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempt: u32, delay: Duration },
    Failed { attempts: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
}

/// Identifies one lease of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub key: u64,
    pub id: u64,
}

/// A leased job handed to a consumer.
///
/// Settling calls take the job's [`Lease`]. Once the visibility timeout elapses the lease is lost, even
/// if nobody else has picked the job up yet.
#[derive(Clone, Debug)]
pub struct Job<T> {
    pub key: u64,
    pub lease_id: u64,
    /// Failed attempts so far, not counting the current one.
    pub attempts: u32,
    /// Times the job was deferred without consuming an attempt.
    pub deferrals: u32,
    pub payload: T,
}

impl<T> Job<T> {
    pub fn lease(&self) -> Lease {
        Lease {
            key: self.key,
            id: self.lease_id,
        }
    }
}

struct QueueState {
    jobs: BTreeMap<u64, StoredJob>,
    next_seq: u64,
    closed: bool,
}

/// WorkQueue is a durable job queue keyed by slot.
///
/// Enqueue is idempotent per key, both for live jobs and for jobs that already completed. Dequeued
/// jobs are leased for the visibility timeout and return to pending if not acked or failed in time.
/// Visible jobs are handed out in enqueue order.
pub struct WorkQueue<T> {
    name: String,
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    events: EventMonitor,
    state: Mutex<QueueState>,
    notify: Notify,
    _payload: PhantomData<fn() -> T>,
}

impl<T> WorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    /// Opens the queue and restores its jobs from the store.
    ///
    /// Jobs that were leased when the previous process stopped are made visible again.
    pub fn open(
        name: &str,
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        events: EventMonitor,
    ) -> Result<Self, QueueError> {
        let mut jobs = BTreeMap::new();
        let mut next_seq = 0;
        for mut job in store.load_jobs(name)? {
            if job.state == JobState::Active {
                debug!(queue = name, key = job.key, "releasing lease held by previous process");
                job.state = JobState::Pending;
                job.lease_expires_ms = None;
                store.put_job(name, &job)?;
            }
            next_seq = next_seq.max(job.seq + 1);
            jobs.insert(job.key, job);
        }

        Ok(Self {
            name: name.to_string(),
            config,
            store,
            events,
            state: Mutex::new(QueueState {
                jobs,
                next_seq,
                closed: false,
            }),
            notify: Notify::new(),
            _payload: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Adds a job unless one with the same key is live or already completed.
    ///
    /// A key whose previous job failed terminally is accepted again.
    pub async fn enqueue(&self, key: u64, payload: &T) -> Result<EnqueueOutcome, QueueError> {
        let payload = bincode::serialize(payload)?;

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed(self.name.clone()));
        }
        if state.jobs.contains_key(&key) {
            return Ok(EnqueueOutcome::AlreadyPresent);
        }
        match self.store.get_history(&self.name, key)? {
            Some(job) if job.state == JobState::Completed => return Ok(EnqueueOutcome::AlreadyPresent),
            Some(_) => self.store.delete_history(&self.name, key)?,
            None => {}
        }

        let job = StoredJob::new(key, state.next_seq, payload, now_ms());
        self.store.put_job(&self.name, &job)?;
        state.next_seq += 1;
        state.jobs.insert(key, job);
        drop(state);

        debug!(queue = %self.name, key, "job enqueued");
        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Waits for the next visible job and leases it.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Result<Option<Job<T>>, QueueError> {
        loop {
            let notified = self.notify.notified();
            let wait = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Ok(None);
                }

                let now = now_ms();
                self.reap_expired(&mut state, now)?;

                let next = state
                    .jobs
                    .values()
                    .filter(|job| job.state == JobState::Pending && job.available_at_ms <= now)
                    .min_by_key(|job| job.seq)
                    .map(|job| job.key);

                if let Some(key) = next {
                    match self.lease(&mut state, key, now)? {
                        Some(job) => return Ok(Some(job)),
                        None => continue,
                    }
                }

                next_wakeup(&state, now)
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Marks an active job as completed.
    pub async fn ack(&self, lease: Lease) -> Result<(), QueueError> {
        let key = lease.key;
        let mut state = self.state.lock().await;
        let mut job = Self::leased(&state, lease)?.clone();
        job.state = JobState::Completed;
        job.lease_expires_ms = None;
        self.store.archive_job(&self.name, &job)?;
        state.jobs.remove(&key);
        drop(state);

        self.events
            .publish(QueueEvent::new(&self.name, key, JobOutcome::Completed, None));
        self.notify.notify_waiters();
        Ok(())
    }

    /// Records a failed attempt, scheduling a retry with backoff until the attempt budget is spent.
    pub async fn fail(&self, lease: Lease, reason: &str) -> Result<FailOutcome, QueueError> {
        let key = lease.key;
        let mut state = self.state.lock().await;
        let attempts = Self::leased(&state, lease)?.attempts + 1;

        let outcome = if attempts >= self.config.max_attempts {
            self.finish_failed(&mut state, key, attempts, reason)?;
            FailOutcome::Failed { attempts }
        } else {
            let delay = self.config.backoff(attempts);
            self.reschedule(&mut state, key, delay, |job| {
                job.attempts = attempts;
                job.last_error = Some(reason.to_string());
            })?;
            self.events.publish(QueueEvent::new(
                &self.name,
                key,
                JobOutcome::Retrying {
                    attempt: attempts,
                    delay_ms: delay.as_millis() as u64,
                },
                Some(reason.to_string()),
            ));
            FailOutcome::Retrying {
                attempt: attempts,
                delay,
            }
        };
        drop(state);

        self.notify.notify_waiters();
        Ok(outcome)
    }

    /// Fails an active job without retrying it.
    pub async fn fail_permanently(&self, lease: Lease, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let attempts = Self::leased(&state, lease)?.attempts + 1;
        self.finish_failed(&mut state, lease.key, attempts, reason)?;
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    /// Returns an active job to pending after `delay` without consuming an attempt.
    pub async fn defer(&self, lease: Lease, delay: Duration) -> Result<(), QueueError> {
        let key = lease.key;
        let mut state = self.state.lock().await;
        Self::leased(&state, lease)?;
        self.reschedule(&mut state, key, delay, |job| job.deferrals = job.deferrals.saturating_add(1))?;
        drop(state);

        debug!(queue = %self.name, key, delay_ms = delay.as_millis() as u64, "job deferred");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Removes a pending job.
    pub async fn cancel(&self, key: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        match state.jobs.get(&key) {
            None => return Err(QueueError::NotFound(key)),
            Some(job) if job.state == JobState::Active => return Err(QueueError::JobActive(key)),
            Some(_) => {}
        }
        self.store.delete_job(&self.name, key)?;
        state.jobs.remove(&key);
        drop(state);

        debug!(queue = %self.name, key, "job cancelled");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Returns the state of a job, including terminal jobs kept in history.
    pub async fn job_state(&self, key: u64) -> Result<Option<JobState>, QueueError> {
        let state = self.state.lock().await;
        if let Some(job) = state.jobs.get(&key) {
            return Ok(Some(job.state));
        }
        Ok(self.store.get_history(&self.name, key)?.map(|job| job.state))
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        state.jobs.values().fold(QueueStats::default(), |mut stats, job| {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Active => stats.active += 1,
                _ => {}
            }
            stats
        })
    }

    /// Highest key among live jobs.
    pub async fn max_key(&self) -> Option<u64> {
        self.state.lock().await.jobs.keys().next_back().copied()
    }

    /// Closes the queue, releasing every consumer blocked in [`WorkQueue::dequeue`].
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    fn lease(&self, state: &mut QueueState, key: u64, now: u64) -> Result<Option<Job<T>>, QueueError> {
        let lease_expires = now + self.config.visibility_timeout().as_millis() as u64;
        let Some(job) = state.jobs.get_mut(&key) else {
            return Ok(None);
        };

        let payload = match bincode::deserialize::<T>(&job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                let attempts = job.attempts + 1;
                error!(queue = %self.name, key, "dropping job with undecodable payload: {e}");
                self.finish_failed(state, key, attempts, &format!("undecodable payload: {e}"))?;
                return Ok(None);
            }
        };

        let mut leased = job.clone();
        leased.state = JobState::Active;
        leased.lease_expires_ms = Some(lease_expires);
        leased.lease_id = leased.lease_id.wrapping_add(1);
        self.store.put_job(&self.name, &leased)?;
        *job = leased;

        Ok(Some(Job {
            key,
            lease_id: job.lease_id,
            attempts: job.attempts,
            deferrals: job.deferrals,
            payload,
        }))
    }

    fn reap_expired(&self, state: &mut QueueState, now: u64) -> Result<(), QueueError> {
        let expired: Vec<(u64, u32)> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Active && job.lease_expires_ms.is_some_and(|t| t <= now))
            .map(|job| (job.key, job.attempts + 1))
            .collect();

        for (key, attempts) in expired {
            warn!(queue = %self.name, key, attempts, "visibility timeout elapsed, releasing job");
            self.events.publish(QueueEvent::new(
                &self.name,
                key,
                JobOutcome::Expired { attempt: attempts },
                None,
            ));
            if attempts >= self.config.max_attempts {
                self.finish_failed(state, key, attempts, "visibility timeout elapsed")?;
            } else {
                self.reschedule(state, key, Duration::ZERO, |job| {
                    job.attempts = attempts;
                    job.last_error = Some("visibility timeout elapsed".into());
                })?;
            }
        }
        Ok(())
    }

    fn reschedule(
        &self,
        state: &mut QueueState,
        key: u64,
        delay: Duration,
        update: impl FnOnce(&mut StoredJob),
    ) -> Result<(), QueueError> {
        let job = state.jobs.get_mut(&key).ok_or(QueueError::NotFound(key))?;
        let mut updated = job.clone();
        updated.state = JobState::Pending;
        updated.available_at_ms = now_ms() + delay.as_millis() as u64;
        updated.lease_expires_ms = None;
        update(&mut updated);
        self.store.put_job(&self.name, &updated)?;
        *job = updated;
        Ok(())
    }

    fn finish_failed(&self, state: &mut QueueState, key: u64, attempts: u32, reason: &str) -> Result<(), QueueError> {
        let mut job = state.jobs.get(&key).cloned().ok_or(QueueError::NotFound(key))?;
        job.state = JobState::Failed;
        job.attempts = attempts;
        job.lease_expires_ms = None;
        job.last_error = Some(reason.to_string());
        self.store.archive_job(&self.name, &job)?;
        state.jobs.remove(&key);

        self.events.publish(QueueEvent::new(
            &self.name,
            key,
            JobOutcome::Failed { attempts },
            Some(reason.to_string()),
        ));
        Ok(())
    }

    /// Returns the job held under `lease`, rejecting leases that expired or were superseded.
    fn leased(state: &QueueState, lease: Lease) -> Result<&StoredJob, QueueError> {
        let job = state.jobs.get(&lease.key).ok_or(QueueError::NotFound(lease.key))?;
        let expired = job.lease_expires_ms.is_some_and(|t| t <= now_ms());
        if job.state != JobState::Active || job.lease_id != lease.id || expired {
            return Err(QueueError::LeaseLost(lease.key));
        }
        Ok(job)
    }
}

/// Time until the next delayed job becomes visible or the next lease expires.
fn next_wakeup(state: &QueueState, now: u64) -> Option<Duration> {
    state
        .jobs
        .values()
        .filter_map(|job| match job.state {
            JobState::Pending => Some(job.available_at_ms),
            JobState::Active => job.lease_expires_ms,
            _ => None,
        })
        .min()
        .map(|at| Duration::from_millis(at.saturating_sub(now)))
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
