// This module contains the durable backing store for the relay work queues.
// Live jobs are stored in the "jobs" column family, terminal jobs in "history".
// Keys are the queue name followed by the big-endian job key, so one queue is a contiguous key range.

use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("General error: {0}")]
    General(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredJob {
    pub key: u64,
    // seq is the enqueue order within the queue.
    pub seq: u64,
    pub state: JobState,
    pub attempts: u32,
    // deferrals counts reschedules that did not consume an attempt.
    pub deferrals: u32,
    // lease_id is bumped every time the job is leased.
    pub lease_id: u64,
    // available_at_ms is the unix time in millis at which a pending job becomes visible.
    pub available_at_ms: u64,
    // lease_expires_ms is set while the job is active.
    pub lease_expires_ms: Option<u64>,
    pub last_error: Option<String>,
    pub payload: Vec<u8>,
}

impl StoredJob {
    pub fn new(key: u64, seq: u64, payload: Vec<u8>, available_at_ms: u64) -> Self {
        Self {
            key,
            seq,
            state: JobState::Pending,
            attempts: 0,
            deferrals: 0,
            lease_id: 0,
            available_at_ms,
            lease_expires_ms: None,
            last_error: None,
            payload,
        }
    }
}

/// JobStore persists queue state so jobs survive a process restart.
pub trait JobStore: Send + Sync {
    /// Inserts or replaces a live job.
    fn put_job(&self, queue: &str, job: &StoredJob) -> Result<(), JobStoreError>;

    fn delete_job(&self, queue: &str, key: u64) -> Result<(), JobStoreError>;

    /// Returns all live jobs of a queue in key order.
    fn load_jobs(&self, queue: &str) -> Result<Vec<StoredJob>, JobStoreError>;

    /// Moves a job out of the live set into the terminal history in one write.
    fn archive_job(&self, queue: &str, job: &StoredJob) -> Result<(), JobStoreError>;

    fn get_history(&self, queue: &str, key: u64) -> Result<Option<StoredJob>, JobStoreError>;

    fn delete_history(&self, queue: &str, key: u64) -> Result<(), JobStoreError>;

    fn reset_db(&self) -> Result<(), JobStoreError>;
}

const CF_JOBS: &str = "jobs";
const CF_HISTORY: &str = "history";

pub struct RocksDbJobStore {
    pub db: Arc<RwLock<DB>>,
}

impl RocksDbJobStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, JobStoreError> {
        let db_path = base_path.as_ref().join("jobs.db");

        let db = DB::open_cf_descriptors(&Self::get_opts(), db_path, Self::get_cfs())?;
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn get_opts() -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts
    }

    fn get_cfs() -> Vec<ColumnFamilyDescriptor> {
        vec![
            ColumnFamilyDescriptor::new(CF_JOBS, Options::default()),
            ColumnFamilyDescriptor::new(CF_HISTORY, Options::default()),
        ]
    }

    fn queue_prefix(queue: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(queue.len() + 1);
        prefix.extend_from_slice(queue.as_bytes());
        prefix.push(b'/');
        prefix
    }

    fn job_key(queue: &str, key: u64) -> Vec<u8> {
        let mut out = Self::queue_prefix(queue);
        out.extend_from_slice(&key.to_be_bytes());
        out
    }

    fn put(&self, cf_name: &str, queue: &str, job: &StoredJob) -> Result<(), JobStoreError> {
        // Serialize outside the lock to minimize lock duration
        let serialized = bincode::serialize(job)?;

        let write_lock = self
            .db
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {e}"))?;
        let cf = write_lock
            .cf_handle(cf_name)
            .with_context(|| format!("Missing {cf_name} column family"))?;
        write_lock.put_cf(cf, Self::job_key(queue, job.key), serialized)?;
        Ok(())
    }

    fn delete(&self, cf_name: &str, queue: &str, key: u64) -> Result<(), JobStoreError> {
        let write_lock = self
            .db
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {e}"))?;
        let cf = write_lock
            .cf_handle(cf_name)
            .with_context(|| format!("Missing {cf_name} column family"))?;
        write_lock.delete_cf(cf, Self::job_key(queue, key))?;
        Ok(())
    }
}

impl JobStore for RocksDbJobStore {
    fn put_job(&self, queue: &str, job: &StoredJob) -> Result<(), JobStoreError> {
        self.put(CF_JOBS, queue, job)
    }

    fn delete_job(&self, queue: &str, key: u64) -> Result<(), JobStoreError> {
        self.delete(CF_JOBS, queue, key)
    }

    fn load_jobs(&self, queue: &str) -> Result<Vec<StoredJob>, JobStoreError> {
        let read_lock = self.db.read().map_err(|e| anyhow!("lock error: {e}"))?;
        let cf = read_lock.cf_handle(CF_JOBS).context("Missing jobs column family")?;

        let prefix = Self::queue_prefix(queue);
        let mut jobs = Vec::new();
        for item in read_lock.iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            jobs.push(bincode::deserialize(&value)?);
        }
        Ok(jobs)
    }

    fn archive_job(&self, queue: &str, job: &StoredJob) -> Result<(), JobStoreError> {
        let serialized = bincode::serialize(job)?;
        let key = Self::job_key(queue, job.key);

        let write_lock = self
            .db
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {e}"))?;
        let jobs_cf = write_lock.cf_handle(CF_JOBS).context("Missing jobs column family")?;
        let history_cf = write_lock
            .cf_handle(CF_HISTORY)
            .context("Missing history column family")?;

        let mut batch = rocksdb::WriteBatch::default();
        batch.delete_cf(jobs_cf, &key);
        batch.put_cf(history_cf, &key, serialized);
        write_lock.write(batch)?;
        Ok(())
    }

    fn get_history(&self, queue: &str, key: u64) -> Result<Option<StoredJob>, JobStoreError> {
        let read_lock = self.db.read().map_err(|e| anyhow!("lock error: {e}"))?;
        let cf = read_lock
            .cf_handle(CF_HISTORY)
            .context("Missing history column family")?;
        match read_lock.get_cf(cf, Self::job_key(queue, key))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_history(&self, queue: &str, key: u64) -> Result<(), JobStoreError> {
        self.delete(CF_HISTORY, queue, key)
    }

    fn reset_db(&self) -> Result<(), JobStoreError> {
        let mut write_lock = self
            .db
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {e}"))?;
        let opts = Self::get_opts();
        for cf in Self::get_cfs() {
            write_lock.drop_cf(cf.name()).ok();
            write_lock.create_cf(cf.name(), &opts)?;
        }
        Ok(())
    }
}

/// Testing utilities for JobStore implementations.
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type QueueJobs = HashMap<(String, u64), StoredJob>;

    /// In-memory implementation of JobStore for testing.
    #[derive(Default)]
    pub struct MockJobStore {
        jobs: Mutex<QueueJobs>,
        history: Mutex<QueueJobs>,
    }

    impl MockJobStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl JobStore for MockJobStore {
        fn put_job(&self, queue: &str, job: &StoredJob) -> Result<(), JobStoreError> {
            self.jobs
                .lock()
                .unwrap()
                .insert((queue.to_string(), job.key), job.clone());
            Ok(())
        }

        fn delete_job(&self, queue: &str, key: u64) -> Result<(), JobStoreError> {
            self.jobs.lock().unwrap().remove(&(queue.to_string(), key));
            Ok(())
        }

        fn load_jobs(&self, queue: &str) -> Result<Vec<StoredJob>, JobStoreError> {
            let mut jobs: Vec<StoredJob> = self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|((name, _), _)| name == queue)
                .map(|(_, job)| job.clone())
                .collect();
            jobs.sort_by_key(|job| job.key);
            Ok(jobs)
        }

        fn archive_job(&self, queue: &str, job: &StoredJob) -> Result<(), JobStoreError> {
            self.jobs.lock().unwrap().remove(&(queue.to_string(), job.key));
            self.history
                .lock()
                .unwrap()
                .insert((queue.to_string(), job.key), job.clone());
            Ok(())
        }

        fn get_history(&self, queue: &str, key: u64) -> Result<Option<StoredJob>, JobStoreError> {
            Ok(self.history.lock().unwrap().get(&(queue.to_string(), key)).cloned())
        }

        fn delete_history(&self, queue: &str, key: u64) -> Result<(), JobStoreError> {
            self.history.lock().unwrap().remove(&(queue.to_string(), key));
            Ok(())
        }

        fn reset_db(&self) -> Result<(), JobStoreError> {
            self.jobs.lock().unwrap().clear();
            self.history.lock().unwrap().clear();
            Ok(())
        }
    }
}
