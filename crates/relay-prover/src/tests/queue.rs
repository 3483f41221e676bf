#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::anyhow;
    use storage::jobs::testing::MockJobStore;
    use storage::jobs::{JobState, JobStore, JobStoreError, RocksDbJobStore, StoredJob};
    use tempfile::TempDir;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    use crate::queue::{
        EnqueueOutcome, EventMonitor, FailOutcome, Job, JobOutcome, QueueConfig, QueueError, WorkQueue,
        PROOF_QUEUE,
    };
    use crate::tests::test_queue_config;

    fn open_queue(config: QueueConfig) -> (WorkQueue<String>, EventMonitor) {
        let events = EventMonitor::new(64);
        let queue = WorkQueue::open(PROOF_QUEUE, config, Arc::new(MockJobStore::new()), events.clone()).unwrap();
        (queue, events)
    }

    async fn next_job(queue: &WorkQueue<String>) -> Job<String> {
        timeout(Duration::from_secs(5), queue.dequeue())
            .await
            .expect("dequeue timed out")
            .unwrap()
            .expect("queue closed")
    }

    async fn dequeue_key(queue: &WorkQueue<String>) -> u64 {
        next_job(queue).await.key
    }

    fn short_lease(max_attempts: u32) -> QueueConfig {
        QueueConfig {
            visibility_timeout_secs: 1,
            ..test_queue_config(max_attempts)
        }
    }

    /// Job store whose next archive write fails.
    struct FlakyJobStore {
        inner: MockJobStore,
        fail_archive: AtomicBool,
    }

    impl JobStore for FlakyJobStore {
        fn put_job(&self, queue: &str, job: &StoredJob) -> Result<(), JobStoreError> {
            self.inner.put_job(queue, job)
        }

        fn delete_job(&self, queue: &str, key: u64) -> Result<(), JobStoreError> {
            self.inner.delete_job(queue, key)
        }

        fn load_jobs(&self, queue: &str) -> Result<Vec<StoredJob>, JobStoreError> {
            self.inner.load_jobs(queue)
        }

        fn archive_job(&self, queue: &str, job: &StoredJob) -> Result<(), JobStoreError> {
            if self.fail_archive.swap(false, Ordering::SeqCst) {
                return Err(JobStoreError::General(anyhow!("disk full")));
            }
            self.inner.archive_job(queue, job)
        }

        fn get_history(&self, queue: &str, key: u64) -> Result<Option<StoredJob>, JobStoreError> {
            self.inner.get_history(queue, key)
        }

        fn delete_history(&self, queue: &str, key: u64) -> Result<(), JobStoreError> {
            self.inner.delete_history(queue, key)
        }

        fn reset_db(&self) -> Result<(), JobStoreError> {
            self.inner.reset_db()
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = QueueConfig {
            backoff_base_ms: 15_000,
            backoff_max_ms: 60_000,
            ..QueueConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(15));
        assert_eq!(config.backoff(2), Duration::from_secs(30));
        assert_eq!(config.backoff(3), Duration::from_secs(60));
        assert_eq!(config.backoff(50), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let (queue, _) = open_queue(test_queue_config(3));

        assert_eq!(queue.enqueue(100, &"a".into()).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(queue.enqueue(100, &"b".into()).await.unwrap(), EnqueueOutcome::AlreadyPresent);
        assert_eq!(queue.stats().await.pending, 1);

        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.payload, "a");
        assert_eq!(queue.enqueue(100, &"c".into()).await.unwrap(), EnqueueOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_jobs_are_handed_out_in_enqueue_order() {
        let (queue, _) = open_queue(test_queue_config(3));
        for slot in [102, 100, 101] {
            queue.enqueue(slot, &slot.to_string()).await.unwrap();
        }

        assert_eq!(dequeue_key(&queue).await, 102);
        assert_eq!(dequeue_key(&queue).await, 100);
        assert_eq!(dequeue_key(&queue).await, 101);
        assert_eq!(queue.stats().await.active, 3);
    }

    #[tokio::test]
    async fn test_leased_job_is_invisible() {
        let (queue, _) = open_queue(test_queue_config(3));
        queue.enqueue(100, &"a".into()).await.unwrap();

        assert_eq!(dequeue_key(&queue).await, 100);
        assert!(timeout(Duration::from_millis(50), queue.dequeue()).await.is_err());
    }

    #[tokio::test]
    async fn test_ack_completes_job() {
        let (queue, events) = open_queue(test_queue_config(3));
        let mut stream = events.subscribe();
        queue.enqueue(100, &"a".into()).await.unwrap();

        let job = next_job(&queue).await;
        queue.ack(job.lease()).await.unwrap();

        assert_eq!(queue.job_state(100).await.unwrap(), Some(JobState::Completed));
        assert_eq!(queue.enqueue(100, &"a".into()).await.unwrap(), EnqueueOutcome::AlreadyPresent);
        assert_eq!(queue.stats().await.pending, 0);

        let event = stream.next().await.unwrap();
        assert_eq!(event.job_key, 100);
        assert_eq!(event.outcome, JobOutcome::Completed);

        match queue.ack(job.lease()).await {
            Err(QueueError::NotFound(100)) => {}
            other => panic!("unexpected ack result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_retries_then_fails_terminally() {
        let (queue, events) = open_queue(test_queue_config(3));
        let mut stream = events.subscribe();
        queue.enqueue(100, &"a".into()).await.unwrap();

        for attempt in 1..=2 {
            let job = timeout(Duration::from_secs(5), queue.dequeue()).await.unwrap().unwrap().unwrap();
            assert_eq!(job.attempts, attempt - 1);
            match queue.fail(job.lease(), "boom").await.unwrap() {
                FailOutcome::Retrying { attempt: a, delay } => {
                    assert_eq!(a, attempt);
                    assert_eq!(delay, Duration::from_millis(10 << (attempt - 1)));
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }

        let job = next_job(&queue).await;
        assert_eq!(
            queue.fail(job.lease(), "boom").await.unwrap(),
            FailOutcome::Failed { attempts: 3 }
        );
        assert_eq!(queue.job_state(100).await.unwrap(), Some(JobState::Failed));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(stream.next().await.unwrap().outcome);
        }
        assert!(matches!(seen[0], JobOutcome::Retrying { attempt: 1, .. }));
        assert!(matches!(seen[1], JobOutcome::Retrying { attempt: 2, .. }));
        assert_eq!(seen[2], JobOutcome::Failed { attempts: 3 });

        // a terminally failed key may be submitted again
        assert_eq!(queue.enqueue(100, &"a".into()).await.unwrap(), EnqueueOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let config = QueueConfig {
            backoff_base_ms: 300,
            backoff_max_ms: 300,
            ..test_queue_config(3)
        };
        let (queue, _) = open_queue(config);
        queue.enqueue(100, &"a".into()).await.unwrap();

        let job = next_job(&queue).await;
        queue.fail(job.lease(), "boom").await.unwrap();

        assert!(timeout(Duration::from_millis(50), queue.dequeue()).await.is_err());
        assert_eq!(dequeue_key(&queue).await, 100);
    }

    #[tokio::test]
    async fn test_defer_does_not_consume_attempt() {
        let (queue, _) = open_queue(test_queue_config(1));
        queue.enqueue(100, &"a".into()).await.unwrap();

        for _ in 0..3 {
            let job = next_job(&queue).await;
            queue.defer(job.lease(), Duration::from_millis(5)).await.unwrap();
        }

        let job = next_job(&queue).await;
        assert_eq!(job.attempts, 0);
        assert_eq!(job.deferrals, 3);
        assert_eq!(queue.job_state(100).await.unwrap(), Some(JobState::Active));
    }

    #[tokio::test]
    async fn test_cancel() {
        let (queue, _) = open_queue(test_queue_config(3));
        queue.enqueue(100, &"a".into()).await.unwrap();
        queue.enqueue(101, &"b".into()).await.unwrap();

        assert!(matches!(queue.cancel(7).await, Err(QueueError::NotFound(7))));

        assert_eq!(dequeue_key(&queue).await, 100);
        assert!(matches!(queue.cancel(100).await, Err(QueueError::JobActive(100))));

        queue.cancel(101).await.unwrap();
        assert_eq!(queue.job_state(101).await.unwrap(), None);
        assert!(timeout(Duration::from_millis(50), queue.dequeue()).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_lease_returns_job() {
        let config = QueueConfig {
            visibility_timeout_secs: 1,
            ..test_queue_config(3)
        };
        let (queue, events) = open_queue(config);
        let mut stream = events.subscribe();
        queue.enqueue(100, &"a".into()).await.unwrap();

        dequeue_key(&queue).await;
        let job = timeout(Duration::from_secs(5), queue.dequeue()).await.unwrap().unwrap().unwrap();
        assert_eq!(job.key, 100);
        assert_eq!(job.attempts, 1);
        assert_eq!(stream.next().await.unwrap().outcome, JobOutcome::Expired { attempt: 1 });
    }

    #[tokio::test]
    async fn test_close_releases_consumers() {
        let (queue, _) = open_queue(test_queue_config(3));
        let queue = Arc::new(queue);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        let result = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(result.unwrap().is_none());
        assert!(matches!(queue.enqueue(1, &"a".into()).await, Err(QueueError::Closed(_))));
    }

    #[tokio::test]
    async fn test_queue_state_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let events = EventMonitor::new(8);
        {
            let store = Arc::new(RocksDbJobStore::new(tmp.path()).unwrap());
            let queue: WorkQueue<String> =
                WorkQueue::open(PROOF_QUEUE, test_queue_config(3), store, events.clone()).unwrap();
            queue.enqueue(100, &"a".into()).await.unwrap();
            queue.enqueue(101, &"b".into()).await.unwrap();
            queue.enqueue(102, &"c".into()).await.unwrap();

            let job = next_job(&queue).await;
            assert_eq!(job.key, 100);
            queue.ack(job.lease()).await.unwrap();
            // leased when the process stops
            assert_eq!(dequeue_key(&queue).await, 101);
        }

        let store = Arc::new(RocksDbJobStore::new(tmp.path()).unwrap());
        let queue: WorkQueue<String> = WorkQueue::open(PROOF_QUEUE, test_queue_config(3), store, events).unwrap();

        assert_eq!(queue.stats().await.pending, 2);
        assert_eq!(queue.enqueue(100, &"a".into()).await.unwrap(), EnqueueOutcome::AlreadyPresent);
        assert_eq!(dequeue_key(&queue).await, 101);
        assert_eq!(dequeue_key(&queue).await, 102);
        assert_eq!(queue.enqueue(103, &"d".into()).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(dequeue_key(&queue).await, 103);
    }

    #[tokio::test]
    async fn test_superseded_lease_cannot_settle() {
        let (queue, _) = open_queue(short_lease(5));
        queue.enqueue(1, &"a".into()).await.unwrap();

        let first = next_job(&queue).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let second = next_job(&queue).await;
        assert_eq!(second.key, 1);
        assert_eq!(second.attempts, 1);

        assert!(matches!(queue.ack(first.lease()).await, Err(QueueError::LeaseLost(1))));
        assert!(matches!(queue.fail(first.lease(), "late").await, Err(QueueError::LeaseLost(1))));
        assert!(matches!(
            queue.defer(first.lease(), Duration::ZERO).await,
            Err(QueueError::LeaseLost(1))
        ));
        assert!(matches!(
            queue.fail_permanently(first.lease(), "late").await,
            Err(QueueError::LeaseLost(1))
        ));
        assert_eq!(queue.stats().await.active, 1);

        queue.ack(second.lease()).await.unwrap();
        assert_eq!(queue.job_state(1).await.unwrap(), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_expired_lease_cannot_settle() {
        let (queue, _) = open_queue(short_lease(5));
        queue.enqueue(1, &"a".into()).await.unwrap();

        let job = next_job(&queue).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(matches!(queue.ack(job.lease()).await, Err(QueueError::LeaseLost(1))));
        let retried = next_job(&queue).await;
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn test_failed_ack_keeps_lease_expiry() {
        let store = Arc::new(FlakyJobStore {
            inner: MockJobStore::new(),
            fail_archive: AtomicBool::new(true),
        });
        let queue: WorkQueue<String> =
            WorkQueue::open(PROOF_QUEUE, short_lease(5), store, EventMonitor::new(8)).unwrap();
        queue.enqueue(1, &"a".into()).await.unwrap();

        let job = next_job(&queue).await;
        assert!(matches!(queue.ack(job.lease()).await, Err(QueueError::Store(_))));
        assert_eq!(queue.stats().await.active, 1);

        // the lease still expires, so the job is handed out again
        let retried = next_job(&queue).await;
        assert_eq!(retried.key, 1);
        queue.ack(retried.lease()).await.unwrap();
        assert_eq!(queue.job_state(1).await.unwrap(), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_max_key_covers_live_jobs() {
        let (queue, _) = open_queue(test_queue_config(3));
        assert_eq!(queue.max_key().await, None);

        for key in [5, 9, 7] {
            queue.enqueue(key, &key.to_string()).await.unwrap();
        }
        assert_eq!(queue.max_key().await, Some(9));

        let job = next_job(&queue).await;
        assert_eq!(job.key, 5);
        assert_eq!(queue.max_key().await, Some(9));

        queue.cancel(9).await.unwrap();
        queue.ack(job.lease()).await.unwrap();
        assert_eq!(queue.max_key().await, Some(7));
    }
}
