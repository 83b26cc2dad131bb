//! Embedding job queue service.
//!
//! [`EmbeddingQueue`] wraps a [`Store`] with the queue's policies: dedup
//! on enqueue, dimension checks and stale-text detection on complete,
//! retry/backoff on fail, and the stuck-job sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::check_dimensions;
use crate::error::{ProviderError, Result};
use crate::jobs::{failure_for, to_chrono, QueueConfig, Transition};
use crate::models::{EmbeddingJob, JobPriority, JobStatus, QueueStats, Rule};
use crate::rules::attach_embedding;
use crate::store::{ReclaimReport, Store};

/// What [`EmbeddingQueue::enqueue_if_needed`] did for a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new `Pending` job was inserted.
    Enqueued { job_id: String },
    /// A completed job for identical text was reused; no job inserted.
    Reused { job_id: String },
    /// An open job for this text already exists.
    AlreadyQueued { job_id: String },
    /// The rule was stored with a caller-supplied vector.
    Precomputed,
    /// The rule already carries an embedding for its current text.
    AlreadyEmbedded,
    /// Embeddings are disabled for this deployment.
    Disabled,
}

/// Tally of a bulk enqueue (`embed pending`, `embed reset`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueSummary {
    pub enqueued: u64,
    pub reused: u64,
    pub already_queued: u64,
    pub skipped: u64,
}

impl EnqueueSummary {
    fn record(&mut self, outcome: &EnqueueOutcome) {
        match outcome {
            EnqueueOutcome::Enqueued { .. } => self.enqueued += 1,
            EnqueueOutcome::Reused { .. } => self.reused += 1,
            EnqueueOutcome::AlreadyQueued { .. } => self.already_queued += 1,
            EnqueueOutcome::Precomputed
            | EnqueueOutcome::AlreadyEmbedded
            | EnqueueOutcome::Disabled => self.skipped += 1,
        }
    }
}

pub struct EmbeddingQueue<S: ?Sized> {
    store: Arc<S>,
    config: QueueConfig,
}

impl<S: ?Sized> Clone for EmbeddingQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store + ?Sized> EmbeddingQueue<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Request an embedding for the rule's current text.
    ///
    /// Reuses a completed vector for the same text and model when one
    /// exists; otherwise inserts a `Pending` job unless one is already open.
    pub async fn enqueue_if_needed(
        &self,
        rule: &Rule,
        priority: Option<JobPriority>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        if !self.config.enabled {
            return Ok(EnqueueOutcome::Disabled);
        }
        let hash = rule.content_hash();

        if let Some(done) = self
            .store
            .find_completed_job(&hash, &self.config.embedding_model)
            .await?
        {
            if let Some(vector) = done
                .result_vector
                .as_deref()
                .filter(|v| v.len() == self.config.dims)
            {
                attach_embedding(self.store.as_ref(), &rule.id, vector, Some(&hash)).await?;
                debug!(rule = %rule.slug, job = %done.id, "reused embedding for identical text");
                return Ok(EnqueueOutcome::Reused { job_id: done.id });
            }
        }

        if let Some(open) = self
            .store
            .find_open_job(&rule.id, &hash, &self.config.embedding_model)
            .await?
        {
            return Ok(EnqueueOutcome::AlreadyQueued { job_id: open.id });
        }

        let priority = priority.unwrap_or_else(|| rule.priority.into());
        let job = EmbeddingJob::pending(rule, priority, &self.config, now);
        self.store.insert_job(&job).await?;
        debug!(rule = %rule.slug, job = %job.id, %priority, "enqueued embedding job");
        Ok(EnqueueOutcome::Enqueued { job_id: job.id })
    }

    /// Claim the next runnable job for `worker_id`.
    pub async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<EmbeddingJob>> {
        let job = self.store.claim_next_job(worker_id, now).await?;
        if let Some(job) = &job {
            debug!(job = %job.id, worker = worker_id, attempt = job.attempts, "claimed job");
        }
        Ok(job)
    }

    /// Record a provider result for a claimed job.
    ///
    /// A vector of the wrong length fails the job permanently. The vector
    /// is attached to the rule only if the rule's text still hashes to the
    /// job's `content_hash`.
    pub async fn complete(
        &self,
        job: &EmbeddingJob,
        worker_id: &str,
        vector: Vec<f32>,
        processing_time_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        if let Err(mismatch) = check_dimensions(&vector, self.config.dims) {
            return self.fail(job, worker_id, &mismatch, now).await;
        }

        if !self
            .store
            .complete_job(&job.id, worker_id, &vector, processing_time_ms, now)
            .await?
        {
            warn!(job = %job.id, worker = worker_id, "completion ignored: job no longer held");
            return Ok(Transition::Lost);
        }

        let attached = attach_embedding(
            self.store.as_ref(),
            &job.rule_id,
            &vector,
            Some(&job.content_hash),
        )
        .await?;
        if !attached {
            debug!(job = %job.id, rule = %job.rule_id, "rule gone or re-worded, embedding not attached");
        }
        debug!(job = %job.id, attached, processing_time_ms, "job completed");
        Ok(Transition::Completed { attached })
    }

    /// Record a provider failure for a claimed job.
    pub async fn fail(
        &self,
        job: &EmbeddingJob,
        worker_id: &str,
        err: &ProviderError,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let failure = failure_for(job, err, &self.config, now);
        if !self.store.fail_job(&job.id, worker_id, &failure, now).await? {
            warn!(job = %job.id, worker = worker_id, "failure ignored: job no longer held");
            return Ok(Transition::Lost);
        }
        match (failure.status, failure.retry_at) {
            (JobStatus::Retrying, Some(retry_at)) => {
                warn!(job = %job.id, attempt = job.attempts, %retry_at, error = %err, "job will retry");
                Ok(Transition::Retrying { retry_at })
            }
            _ => {
                warn!(job = %job.id, attempt = job.attempts, error = %err, "job failed");
                Ok(Transition::Failed)
            }
        }
    }

    /// Put jobs stuck in `Processing` longer than the configured timeout
    /// back in the queue.
    pub async fn reclaim_stuck(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        let cutoff = now - to_chrono(self.config.stuck_timeout);
        let report = self.store.reclaim_stuck_jobs(cutoff, now).await?;
        if report != ReclaimReport::default() {
            info!(reset = report.reset, failed = report.failed, "reclaimed stuck jobs");
        }
        Ok(report)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.store.queue_stats().await?)
    }

    /// Enqueue every rule that has no embedding.
    pub async fn enqueue_missing(&self, now: DateTime<Utc>) -> Result<EnqueueSummary> {
        let mut summary = EnqueueSummary::default();
        for rule in self.store.all_rules().await? {
            let outcome = if rule.has_embedding() {
                EnqueueOutcome::AlreadyEmbedded
            } else {
                self.enqueue_if_needed(&rule, None, now).await?
            };
            summary.record(&outcome);
        }
        Ok(summary)
    }

    /// Drop every embedding and re-enqueue all rules at `Low` priority.
    ///
    /// Open jobs from before the reset are failed, including ones a worker
    /// is processing, so none can be claimed or completed under the old
    /// model name.
    pub async fn reset_embeddings(&self, now: DateTime<Utc>) -> Result<EnqueueSummary> {
        let cancelled = self
            .store
            .fail_open_jobs("cancelled by embedding reset", now)
            .await?;
        let cleared = self.store.clear_rule_embeddings().await?;
        self.store.clear_vectors().await?;
        info!(cleared, cancelled, "cleared embeddings");

        let mut summary = EnqueueSummary::default();
        for rule in self.store.all_rules().await? {
            let outcome = self
                .enqueue_if_needed(&rule, Some(JobPriority::Low), now)
                .await?;
            summary.record(&outcome);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, RuleScope};
    use crate::rules::tests::sample_rule;
    use crate::store::memory::InMemoryStore;
    use crate::store::{JobQueue, RuleStore};
    use chrono::Duration;

    const DIMS: usize = 3;

    async fn setup() -> (Arc<InMemoryStore>, EmbeddingQueue<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let queue = EmbeddingQueue::new(store.clone(), QueueConfig::new("test-model", DIMS));
        (store, queue)
    }

    async fn stored_rule(store: &InMemoryStore, id: &str, slug: &str) -> Rule {
        let rule = sample_rule(id, slug);
        store.insert_rule(&rule).await.unwrap();
        rule
    }

    #[tokio::test]
    async fn test_enqueue_derives_priority() {
        let (store, queue) = setup().await;
        let mut rule = sample_rule("r1", "critical-rule");
        rule.priority = Priority::Critical;
        store.insert_rule(&rule).await.unwrap();

        queue.enqueue_if_needed(&rule, None, Utc::now()).await.unwrap();
        let job = queue.claim("w", Utc::now()).await.unwrap().unwrap();
        assert_eq!(job.priority, JobPriority::Urgent);
    }

    #[tokio::test]
    async fn test_enqueue_twice_keeps_one_open_job() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "one").await;
        let now = Utc::now();

        let first = queue.enqueue_if_needed(&rule, None, now).await.unwrap();
        let second = queue.enqueue_if_needed(&rule, None, now).await.unwrap();
        let EnqueueOutcome::Enqueued { job_id } = first else {
            panic!("expected a new job");
        };
        assert_eq!(second, EnqueueOutcome::AlreadyQueued { job_id });
        assert_eq!(store.list_jobs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dedup_reuses_completed_vector() {
        let (store, queue) = setup().await;
        let first = stored_rule(&store, "r1", "first").await;
        let now = Utc::now();
        queue.enqueue_if_needed(&first, None, now).await.unwrap();
        let job = queue.claim("w", now).await.unwrap().unwrap();
        queue
            .complete(&job, "w", vec![0.1, 0.2, 0.3], 12, now)
            .await
            .unwrap();

        let mut twin = sample_rule("r2", "twin");
        twin.scope = RuleScope::Project("alpha".into());
        store.insert_rule(&twin).await.unwrap();
        let outcome = queue.enqueue_if_needed(&twin, None, now).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Reused { job_id: job.id });

        let twin = store.get_rule("r2").await.unwrap().unwrap();
        assert_eq!(twin.embedding, Some(vec![0.1, 0.2, 0.3]));
        assert_eq!(store.list_jobs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dedup_ignores_other_models() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "first").await;
        let now = Utc::now();
        queue.enqueue_if_needed(&rule, None, now).await.unwrap();
        let job = queue.claim("w", now).await.unwrap().unwrap();
        queue.complete(&job, "w", vec![1.0, 0.0, 0.0], 1, now).await.unwrap();

        let other = EmbeddingQueue::new(store.clone(), QueueConfig::new("other-model", DIMS));
        let twin = stored_rule(&store, "r2", "twin").await;
        let outcome = other.enqueue_if_needed(&twin, None, now).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Enqueued { .. }));
    }

    #[tokio::test]
    async fn test_complete_attaches_vector_and_indexes() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "attach").await;
        let now = Utc::now();
        queue.enqueue_if_needed(&rule, None, now).await.unwrap();
        let job = queue.claim("w", now).await.unwrap().unwrap();

        let t = queue
            .complete(&job, "w", vec![1.0, 0.0, 0.0], 40, now)
            .await
            .unwrap();
        assert_eq!(t, Transition::Completed { attached: true });

        let done = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processing_time_ms, Some(40));
        assert!(store.get_rule("r1").await.unwrap().unwrap().has_embedding());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_fails_permanently() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "dims").await;
        let now = Utc::now();
        queue.enqueue_if_needed(&rule, None, now).await.unwrap();
        let job = queue.claim("w", now).await.unwrap().unwrap();

        let t = queue.complete(&job, "w", vec![1.0; 5], 1, now).await.unwrap();
        assert_eq!(t, Transition::Failed);
        let failed = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(failed.result_vector.is_none());
        assert!(failed
            .error_message
            .unwrap()
            .contains("expected 3"));
    }

    #[tokio::test]
    async fn test_transient_failures_end_in_failed_after_max_attempts() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "flaky").await;
        let mut now = Utc::now();
        queue.enqueue_if_needed(&rule, None, now).await.unwrap();
        let err = ProviderError::Transient("503".into());

        let mut transitions = Vec::new();
        while let Some(job) = queue.claim("w", now).await.unwrap() {
            let t = queue.fail(&job, "w", &err, now).await.unwrap();
            if let Transition::Retrying { retry_at } = &t {
                assert!(queue.claim("w", now).await.unwrap().is_none());
                now = *retry_at;
            }
            transitions.push(t);
        }

        assert_eq!(transitions.len(), 3);
        assert_eq!(transitions[2], Transition::Failed);
        let jobs = store.list_jobs(None, 10).await.unwrap();
        assert_eq!(jobs[0].attempts, 3);
        assert_eq!(jobs[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_stale_completion_does_not_overwrite_new_text() {
        let (store, queue) = setup().await;
        let mut rule = stored_rule(&store, "r1", "edited").await;
        let now = Utc::now();
        queue.enqueue_if_needed(&rule, None, now).await.unwrap();
        let job = queue.claim("w", now).await.unwrap().unwrap();

        rule.guidance = "Different guidance".into();
        store.replace_rule(&rule).await.unwrap();

        let t = queue.complete(&job, "w", vec![1.0, 0.0, 0.0], 1, now).await.unwrap();
        assert_eq!(t, Transition::Completed { attached: false });
        assert!(!store.get_rule("r1").await.unwrap().unwrap().has_embedding());
    }

    #[tokio::test]
    async fn test_reclaimed_job_rejects_late_completion() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "slow").await;
        let t0 = Utc::now();
        queue.enqueue_if_needed(&rule, None, t0).await.unwrap();
        let job = queue.claim("slow-worker", t0).await.unwrap().unwrap();

        let later = t0 + Duration::minutes(11);
        let report = queue.reclaim_stuck(later).await.unwrap();
        assert_eq!(report.reset, 1);
        assert_eq!(queue.reclaim_stuck(later).await.unwrap(), ReclaimReport::default());

        let t = queue
            .complete(&job, "slow-worker", vec![1.0, 0.0, 0.0], 1, later)
            .await
            .unwrap();
        assert_eq!(t, Transition::Lost);

        let reclaimed = queue.claim("fast-worker", later).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_reset_requeues_everything_at_low_priority() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "reset-me").await;
        let now = Utc::now();
        queue.enqueue_if_needed(&rule, None, now).await.unwrap();
        let job = queue.claim("w", now).await.unwrap().unwrap();
        queue.complete(&job, "w", vec![1.0, 0.0, 0.0], 1, now).await.unwrap();
        let stale = stored_rule(&store, "r2", "still-open").await;
        queue.enqueue_if_needed(&stale, None, now).await.unwrap();

        let fresh = EmbeddingQueue::new(store.clone(), QueueConfig::new("new-model", DIMS));
        let summary = fresh.reset_embeddings(now).await.unwrap();
        assert_eq!(summary.enqueued, 2);
        assert!(!store.get_rule("r1").await.unwrap().unwrap().has_embedding());

        let pending = store.list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|j| j.priority == JobPriority::Low));
        assert!(pending.iter().all(|j| j.embedding_model == "new-model"));
    }

    #[tokio::test]
    async fn test_reset_cancels_in_flight_job_and_requeues_under_new_model() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "in-flight").await;
        let t0 = Utc::now();
        queue.enqueue_if_needed(&rule, None, t0).await.unwrap();
        let job = queue.claim("w", t0).await.unwrap().unwrap();

        let fresh = EmbeddingQueue::new(store.clone(), QueueConfig::new("new-model", DIMS));
        let summary = fresh.reset_embeddings(t0).await.unwrap();
        assert_eq!(summary.enqueued, 1);
        assert_eq!(summary.already_queued, 0);

        let cancelled = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);

        let late = queue
            .complete(&job, "w", vec![1.0, 0.0, 0.0], 1, t0)
            .await
            .unwrap();
        assert_eq!(late, Transition::Lost);
        assert!(!store.get_rule("r1").await.unwrap().unwrap().has_embedding());

        let later = t0 + Duration::minutes(11);
        assert_eq!(fresh.reclaim_stuck(later).await.unwrap(), ReclaimReport::default());
        let next = fresh.claim("w2", later).await.unwrap().unwrap();
        assert_eq!(next.embedding_model, "new-model");
        assert_eq!(next.rule_id, "r1");
    }

    #[tokio::test]
    async fn test_model_change_enqueues_despite_old_model_job() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "switch").await;
        let now = Utc::now();
        queue.enqueue_if_needed(&rule, None, now).await.unwrap();

        let fresh = EmbeddingQueue::new(store.clone(), QueueConfig::new("new-model", DIMS));
        let outcome = fresh.enqueue_if_needed(&rule, None, now).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Enqueued { .. }));

        let open = store.list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().any(|j| j.embedding_model == "new-model"));
    }

    #[tokio::test]
    async fn test_completion_leaves_updated_at_alone() {
        let (store, queue) = setup().await;
        let rule = stored_rule(&store, "r1", "untouched").await;
        let later = rule.updated_at + Duration::hours(1);
        queue.enqueue_if_needed(&rule, None, later).await.unwrap();
        let job = queue.claim("w", later).await.unwrap().unwrap();
        queue
            .complete(&job, "w", vec![1.0, 0.0, 0.0], 1, later)
            .await
            .unwrap();

        let stored = store.get_rule("r1").await.unwrap().unwrap();
        assert!(stored.has_embedding());
        assert_eq!(stored.updated_at, rule.updated_at);
    }

    #[tokio::test]
    async fn test_disabled_queue_enqueues_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let queue = EmbeddingQueue::new(store.clone(), QueueConfig::disabled());
        let rule = stored_rule(&store, "r1", "quiet").await;
        let outcome = queue.enqueue_if_needed(&rule, None, Utc::now()).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Disabled);
        assert!(store.list_jobs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let (store, queue) = setup().await;
        let now = Utc::now();
        for i in 0..40 {
            let rule = stored_rule(&store, &format!("r{i}"), &format!("rule-{i}")).await;
            queue.enqueue_if_needed(&rule, None, now).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let worker = format!("w{w}");
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim(&worker, now).await.unwrap() {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }
}
