#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use relay_types::{ProofData, Update};
    use storage::jobs::JobState;
    use storage::proofs::testing::MockProofStore;
    use storage::proofs::{ProofRecord, ProofStore};
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    use crate::pipeline::poller::testing::ReplaySource;
    use crate::pipeline::{
        ChainError, ChainVerifier, JobResult, PollSummary, ProofGeneratorWorker, RelayContext, UpdatePoller,
        UpdateScheduler, STALL_REPORT_INTERVAL,
    };
    use crate::prover::mock::{MockProver, MockVerifier};
    use crate::prover::{ProveError, UpdateProver};
    use crate::queue::{EnqueueOutcome, Job, JobOutcome};
    use crate::server::resume_slot;
    use crate::tests::{chain_updates, test_context, CHAIN};

    /// Proves and stores `updates` in order, bypassing the queues.
    async fn store_chain(store: &dyn ProofStore, updates: &[Update]) {
        let prover = MockProver::new();
        let mut predecessor: Option<ProofData> = None;
        for update in updates {
            let proof = prover.prove(predecessor.as_ref(), update).await.unwrap();
            store.put(&ProofRecord::new(update, proof.clone(), CHAIN)).await.unwrap();
            predecessor = Some(proof);
        }
    }

    fn worker(ctx: &RelayContext, prover: Arc<dyn UpdateProver>, prove_timeout: Duration) -> ProofGeneratorWorker {
        ProofGeneratorWorker::new(0, ctx.clone(), prover, prove_timeout, Duration::from_millis(10))
    }

    async fn lease(ctx: &RelayContext, update: &Update) -> Job<Update> {
        ctx.proof_queue.enqueue(update.slot, update).await.unwrap();
        timeout(Duration::from_secs(5), ctx.proof_queue.dequeue())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    /// Stores a conflicting record for the slot being proven while the proof is generated.
    struct RacingProver {
        inner: MockProver,
        store: Arc<MockProofStore>,
    }

    #[async_trait]
    impl UpdateProver for RacingProver {
        async fn prove(&self, predecessor: Option<&ProofData>, update: &Update) -> Result<ProofData, ProveError> {
            let proof = self.inner.prove(predecessor, update).await?;
            let rival = ProofRecord::new(update, ProofData::new(vec![0xde, 0xad], proof.public_inputs.clone()), CHAIN);
            self.store.overwrite_record(rival);
            Ok(proof)
        }
    }

    struct RejectingProver;

    #[async_trait]
    impl UpdateProver for RejectingProver {
        async fn prove(&self, _: Option<&ProofData>, _: &Update) -> Result<ProofData, ProveError> {
            Err(ProveError::Malformed("unsupported sync committee".into()))
        }
    }

    #[tokio::test]
    async fn test_worker_proves_genesis_and_successor() {
        let (ctx, store) = test_context(3);
        let prover = Arc::new(MockProver::new());
        let worker = worker(&ctx, prover.clone(), Duration::from_secs(5));
        let updates = chain_updates(100, 2);

        for update in &updates {
            let job = lease(&ctx, update).await;
            assert_eq!(worker.process(job).await.unwrap(), JobResult::Stored);
        }

        assert_eq!(prover.invocations(), 2);
        assert_eq!(store.len(), 2);
        let record = ctx.proof_store.get_next(CHAIN, 100).await.unwrap().unwrap();
        assert_eq!(record.update_slot, 101);
        assert_eq!(ctx.proof_queue.job_state(101).await.unwrap(), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_worker_skips_stored_proof() {
        let (ctx, _) = test_context(3);
        let updates = chain_updates(100, 2);
        store_chain(ctx.proof_store.as_ref(), &updates).await;

        let prover = Arc::new(MockProver::new());
        let worker = worker(&ctx, prover.clone(), Duration::from_secs(5));
        let job = lease(&ctx, &updates[1]).await;

        assert_eq!(worker.process(job).await.unwrap(), JobResult::AlreadyStored);
        assert_eq!(prover.invocations(), 0);
        assert_eq!(ctx.proof_queue.job_state(101).await.unwrap(), Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_worker_defers_until_predecessor_is_stored() {
        let (ctx, _) = test_context(1);
        let prover = Arc::new(MockProver::new());
        let worker = worker(&ctx, prover.clone(), Duration::from_secs(5));
        let updates = chain_updates(100, 2);

        let job = lease(&ctx, &updates[1]).await;
        assert_eq!(worker.process(job).await.unwrap(), JobResult::Deferred);
        assert_eq!(prover.invocations(), 0);
        assert_eq!(ctx.proof_queue.job_state(101).await.unwrap(), Some(JobState::Pending));

        store_chain(ctx.proof_store.as_ref(), &updates[..1]).await;

        // deferral consumed no attempt, so a single allowed attempt is still available
        let job = timeout(Duration::from_secs(5), ctx.proof_queue.dequeue())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(worker.process(job).await.unwrap(), JobResult::Stored);
    }

    #[tokio::test]
    async fn test_worker_retries_prover_timeout() {
        let (ctx, store) = test_context(3);
        let prover = Arc::new(MockProver::with_delay(Duration::from_millis(500)));
        let worker = worker(&ctx, prover, Duration::from_millis(20));
        let update = &chain_updates(100, 1)[0];

        let job = lease(&ctx, update).await;
        assert_eq!(worker.process(job).await.unwrap(), JobResult::Retrying);
        assert!(store.is_empty());
        assert_eq!(ctx.proof_queue.job_state(100).await.unwrap(), Some(JobState::Pending));
    }

    #[tokio::test]
    async fn test_worker_fails_malformed_update_without_retry() {
        let (ctx, _) = test_context(5);
        let mut events = ctx.events.subscribe();
        let worker = worker(&ctx, Arc::new(RejectingProver), Duration::from_secs(5));
        let update = &chain_updates(100, 1)[0];

        let job = lease(&ctx, update).await;
        assert_eq!(worker.process(job).await.unwrap(), JobResult::Failed);
        assert_eq!(ctx.proof_queue.job_state(100).await.unwrap(), Some(JobState::Failed));

        let event = events.next().await.unwrap();
        assert_eq!(event.outcome, JobOutcome::Failed { attempts: 1 });
        assert!(event.detail.unwrap().contains("sync committee"));
    }

    #[tokio::test]
    async fn test_worker_reports_conflicting_record_as_integrity_error() {
        let (ctx, store) = test_context(5);
        let mut events = ctx.events.subscribe();
        let prover = Arc::new(RacingProver {
            inner: MockProver::new(),
            store: store.clone(),
        });
        let worker = worker(&ctx, prover, Duration::from_secs(5));
        let update = &chain_updates(100, 1)[0];

        let job = lease(&ctx, update).await;
        assert_eq!(worker.process(job).await.unwrap(), JobResult::Failed);

        // the rival record is left untouched
        let stored = ctx.proof_store.get(100, CHAIN).await.unwrap().unwrap();
        assert_eq!(stored.proof_bytes, vec![0xde, 0xad]);

        let event = events.next().await.unwrap();
        assert!(matches!(event.outcome, JobOutcome::Failed { .. }));
        assert!(event.detail.unwrap().contains("integrity error"));
    }

    #[tokio::test]
    async fn test_worker_rejects_mismatched_job_key() {
        let (ctx, _) = test_context(5);
        let prover = Arc::new(MockProver::new());
        let worker = worker(&ctx, prover.clone(), Duration::from_secs(5));
        let update = &chain_updates(100, 1)[0];

        ctx.proof_queue.enqueue(7, update).await.unwrap();
        let job = ctx.proof_queue.dequeue().await.unwrap().unwrap();
        assert_eq!(worker.process(job).await.unwrap(), JobResult::Failed);
        assert_eq!(prover.invocations(), 0);
    }

    #[tokio::test]
    async fn test_poller_filters_updates() {
        let (ctx, _) = test_context(3);
        let updates = chain_updates(100, 3);
        store_chain(ctx.proof_store.as_ref(), &updates[..1]).await;

        let malformed = Update::new(200, 201, b"{}".to_vec());
        let source = Arc::new(ReplaySource::new(vec![
            vec![updates[0].clone(), updates[1].clone(), malformed],
            vec![updates[1].clone(), updates[2].clone()],
        ]));
        let poller = UpdatePoller::new(ctx.clone(), source.clone(), Duration::from_secs(1));

        let first = poller.poll_once().await.unwrap();
        assert_eq!(first.enqueued, 1);
        assert_eq!(first.already_proven, 1);
        assert_eq!(first.rejected, 1);

        let second = poller.poll_once().await.unwrap();
        assert_eq!(second.enqueued, 1);
        assert_eq!(second.already_present, 1);

        let empty = poller.poll_once().await.unwrap();
        assert_eq!(empty, PollSummary::default());
        assert_eq!(ctx.update_queue.stats().await.pending, 2);
    }

    #[tokio::test]
    async fn test_scheduler_moves_updates_to_proof_queue() {
        let (ctx, _) = test_context(3);
        let updates = chain_updates(100, 2);
        store_chain(ctx.proof_store.as_ref(), &updates[..1]).await;
        let scheduler = UpdateScheduler::new(ctx.clone());

        for update in &updates {
            ctx.update_queue.enqueue(update.slot, update).await.unwrap();
            let job = ctx.update_queue.dequeue().await.unwrap().unwrap();
            scheduler.schedule(job).await.unwrap();
            assert_eq!(ctx.update_queue.job_state(update.slot).await.unwrap(), Some(JobState::Completed));
        }

        // only the unproven update became proving work
        assert_eq!(ctx.proof_queue.job_state(100).await.unwrap(), None);
        assert_eq!(ctx.proof_queue.job_state(101).await.unwrap(), Some(JobState::Pending));
        assert_eq!(
            ctx.proof_queue.enqueue(101, &updates[1]).await.unwrap(),
            EnqueueOutcome::AlreadyPresent
        );
    }

    fn verifier(ctx: &RelayContext) -> ChainVerifier {
        ChainVerifier::new(ctx.proof_store.clone(), Arc::new(MockVerifier), CHAIN)
    }

    #[tokio::test]
    async fn test_verifier_walks_chain() {
        let (ctx, _) = test_context(3);
        store_chain(ctx.proof_store.as_ref(), &chain_updates(100, 5)).await;
        let verifier = verifier(&ctx);

        let full = verifier.verify(None, None).await.unwrap();
        assert_eq!(full.head, Some(104));
        assert_eq!(full.verified, 5);

        let from_checkpoint = verifier.verify(Some(101), None).await.unwrap();
        assert_eq!(from_checkpoint.checkpoint, Some(101));
        assert_eq!(from_checkpoint.head, Some(104));
        assert_eq!(from_checkpoint.verified, 3);

        let bounded = verifier.verify(None, Some(102)).await.unwrap();
        assert_eq!(bounded.head, Some(102));
        assert_eq!(bounded.verified, 3);

        let at_head = verifier.verify(Some(104), None).await.unwrap();
        assert_eq!(at_head.head, None);
        assert_eq!(at_head.verified, 0);
    }

    #[tokio::test]
    async fn test_verifier_on_empty_store() {
        let (ctx, _) = test_context(3);
        let result = verifier(&ctx).verify(None, None).await.unwrap();
        assert_eq!(result.head, None);
        assert_eq!(result.verified, 0);
    }

    #[tokio::test]
    async fn test_verifier_stops_at_invalid_proof() {
        let (ctx, store) = test_context(3);
        store_chain(ctx.proof_store.as_ref(), &chain_updates(100, 5)).await;

        let mut tampered = ctx.proof_store.get(102, CHAIN).await.unwrap().unwrap();
        tampered.proof_bytes[0] ^= 0xff;
        store.overwrite_record(tampered);

        match verifier(&ctx).verify(None, None).await {
            Err(ChainError::InvalidProof { slot }) => assert_eq!(slot, 102),
            other => panic!("expected invalid proof, got {other:?}"),
        }
        // the prefix before the tampered record still verifies
        assert_eq!(verifier(&ctx).verify(None, Some(101)).await.unwrap().head, Some(101));
    }

    #[tokio::test]
    async fn test_verifier_detects_broken_link() {
        let (ctx, store) = test_context(3);
        store_chain(ctx.proof_store.as_ref(), &chain_updates(100, 4)).await;

        let mut relinked = ctx.proof_store.get(102, CHAIN).await.unwrap().unwrap();
        relinked.prev_update_slot = 99;
        store.overwrite_record(relinked);

        match verifier(&ctx).verify(None, None).await {
            Err(ChainError::ChainBroken { slot, .. }) => assert_eq!(slot, 102),
            other => panic!("expected broken chain, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verifier_detects_gap() {
        let (ctx, _) = test_context(3);
        let updates = chain_updates(100, 4);
        store_chain(ctx.proof_store.as_ref(), &updates[..2]).await;

        // 103 links to 102, which was never stored
        let prover = MockProver::new();
        let fake_prev = ProofData::new(vec![1], vec![2]);
        let proof = prover.prove(Some(&fake_prev), &updates[3]).await.unwrap();
        ctx.proof_store.put(&ProofRecord::new(&updates[3], proof, CHAIN)).await.unwrap();

        match verifier(&ctx).verify(None, None).await {
            Err(ChainError::ChainBroken { slot, .. }) => assert_eq!(slot, 103),
            other => panic!("expected broken chain, got {other:?}"),
        }
        assert_eq!(verifier(&ctx).verify(None, Some(102)).await.unwrap().head, Some(101));
    }

    #[tokio::test]
    async fn test_worker_reports_stalled_job() {
        let (ctx, _) = test_context(1);
        let mut events = ctx.events.subscribe();
        let prover = Arc::new(MockProver::new());
        let worker = worker(&ctx, prover.clone(), Duration::from_secs(5));
        let updates = chain_updates(100, 2);

        ctx.proof_queue.enqueue(101, &updates[1]).await.unwrap();
        for _ in 0..STALL_REPORT_INTERVAL {
            let job = timeout(Duration::from_secs(5), ctx.proof_queue.dequeue())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(worker.process(job).await.unwrap(), JobResult::Deferred);
        }

        let event = timeout(Duration::from_secs(1), events.next()).await.unwrap().unwrap();
        assert_eq!(event.job_key, 101);
        assert_eq!(
            event.outcome,
            JobOutcome::Stalled {
                deferrals: STALL_REPORT_INTERVAL
            }
        );
        let detail = event.detail.unwrap();
        assert!(detail.contains("slot 100"));
        assert!(detail.contains("not queued"));
        assert_eq!(prover.invocations(), 0);
    }

    #[tokio::test]
    async fn test_resume_slot_includes_queued_updates() {
        let (ctx, _) = test_context(3);
        assert_eq!(resume_slot(&ctx, Some(50)).await.unwrap(), Some(50));
        assert_eq!(resume_slot(&ctx, None).await.unwrap(), None);

        let updates = chain_updates(100, 4);
        store_chain(ctx.proof_store.as_ref(), &updates[..2]).await;
        assert_eq!(resume_slot(&ctx, Some(50)).await.unwrap(), Some(101));

        // proven after the restart, so new updates must chain after it
        ctx.proof_queue.enqueue(102, &updates[2]).await.unwrap();
        assert_eq!(resume_slot(&ctx, Some(50)).await.unwrap(), Some(102));

        ctx.update_queue.enqueue(103, &updates[3]).await.unwrap();
        assert_eq!(resume_slot(&ctx, None).await.unwrap(), Some(103));
    }
}
