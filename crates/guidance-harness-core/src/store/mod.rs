//! Storage abstraction for Guidance Harness.
//!
//! Three traits split the durable state by owner:
//!
//! | Trait | Owns |
//! |-------|------|
//! | [`RuleStore`] | rules, projects, project membership |
//! | [`JobQueue`] | embedding jobs |
//! | [`VectorIndex`] | the similarity-searchable projection of rule embeddings |
//!
//! A backend implements all three and gets [`Store`] for free. Every job
//! transition that can race (claim, complete, fail, reclaim) must be a
//! single atomic compare-and-set inside the backend.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CallerScope, EmbeddingJob, JobStatus, Project, QueueStats, Rule, RuleScope,
};

/// A rule id with its cosine similarity to a query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub rule_id: String,
    pub similarity: f32,
}

/// Terminal or retry state written by [`JobQueue::fail_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    /// Either [`JobStatus::Retrying`] or [`JobStatus::Failed`].
    pub status: JobStatus,
    pub error_message: String,
    pub retry_at: Option<DateTime<Utc>>,
}

/// What a stuck-job sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Jobs put back to `Pending`.
    pub reset: u64,
    /// Jobs that had no attempts left and were marked `Failed`.
    pub failed: u64,
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert a new rule. Fails with
    /// [`Error::DuplicateSlug`](crate::error::Error::DuplicateSlug) if
    /// `(scope, slug)` is already taken.
    async fn insert_rule(&self, rule: &Rule) -> Result<()>;

    /// Overwrite every field of an existing rule. Returns `false` if the id
    /// is unknown.
    async fn replace_rule(&self, rule: &Rule) -> Result<bool>;

    async fn get_rule(&self, id: &str) -> Result<Option<Rule>>;

    async fn find_rule(&self, scope: &RuleScope, slug: &str) -> Result<Option<Rule>>;

    /// Global rules plus rules of every project in `scope`, before shadowing.
    async fn rules_in_scope(&self, scope: &CallerScope) -> Result<Vec<Rule>>;

    async fn all_rules(&self) -> Result<Vec<Rule>>;

    /// Write or clear the embedding field of a rule, leaving `updated_at`
    /// alone.
    ///
    /// With `expected_hash` set, the write only happens while the rule's
    /// current text still hashes to it; the check and the write are one
    /// atomic step. Returns `false` if the rule does not exist or its hash
    /// differs.
    async fn set_rule_embedding(
        &self,
        rule_id: &str,
        embedding: Option<&[f32]>,
        expected_hash: Option<&str>,
    ) -> Result<bool>;

    /// Clear the embedding field of every rule. Returns the number cleared.
    async fn clear_rule_embeddings(&self) -> Result<u64>;

    async fn insert_project(&self, project: &Project) -> Result<()>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>>;

    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn add_project_member(&self, project_id: &str, caller: &str) -> Result<()>;

    /// Project ids the caller is a member of, sorted.
    async fn projects_for_caller(&self, caller: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn insert_job(&self, job: &EmbeddingJob) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<EmbeddingJob>>;

    /// Most recent completed job for this input hash and model.
    async fn find_completed_job(
        &self,
        content_hash: &str,
        model: &str,
    ) -> Result<Option<EmbeddingJob>>;

    /// Pending, processing or retrying job for this rule, hash and model.
    async fn find_open_job(
        &self,
        rule_id: &str,
        content_hash: &str,
        model: &str,
    ) -> Result<Option<EmbeddingJob>>;

    /// Fail every pending or retrying job of `rule_id` whose hash differs
    /// from `current_hash`. Returns the number superseded.
    async fn supersede_open_jobs(
        &self,
        rule_id: &str,
        current_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Fail every pending, retrying or processing job. A worker still
    /// holding one of them loses its later complete or fail. Returns the
    /// number failed.
    async fn fail_open_jobs(&self, reason: &str, now: DateTime<Utc>) -> Result<u64>;

    /// Atomically claim the next runnable job.
    ///
    /// Picks a `Pending` job, or a `Retrying` job whose `retry_at <= now`,
    /// ordered by priority descending, then `created_at` ascending, then
    /// insertion order. The winner is flipped to `Processing` with
    /// `started_at = now`, `worker_id`, and `attempts + 1`. Exactly one
    /// concurrent caller can win any given job.
    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmbeddingJob>>;

    /// `Processing ∧ worker_id` → `Completed`. Returns `false` on mismatch.
    async fn complete_job(
        &self,
        job_id: &str,
        worker_id: &str,
        vector: &[f32],
        processing_time_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `Processing ∧ worker_id` → `failure.status`. Returns `false` on mismatch.
    async fn fail_job(
        &self,
        job_id: &str,
        worker_id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Reset `Processing` jobs started before `started_before`.
    ///
    /// Jobs with attempts left go back to `Pending` with `worker_id` and
    /// `started_at` cleared. Jobs that used every attempt become `Failed`.
    async fn reclaim_stuck_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport>;

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize)
        -> Result<Vec<EmbeddingJob>>;

    async fn queue_stats(&self) -> Result<QueueStats>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert_vector(&self, rule_id: &str, vector: &[f32]) -> Result<()>;

    async fn remove_vector(&self, rule_id: &str) -> Result<()>;

    /// Cosine search restricted to `candidates`.
    ///
    /// Returns hits with `similarity >= min_similarity`, sorted by
    /// similarity descending then rule id ascending, at most `limit`.
    async fn search_vectors(
        &self,
        query: &[f32],
        candidates: &HashSet<String>,
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<VectorHit>>;

    async fn clear_vectors(&self) -> Result<()>;
}

/// A complete storage backend.
pub trait Store: RuleStore + JobQueue + VectorIndex {}

impl<T: RuleStore + JobQueue + VectorIndex + ?Sized> Store for T {}

/// Sort vector hits by similarity descending, rule id ascending.
pub fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
}
