//! In-memory [`Store`](super::Store) implementation for testing and
//! embedded use.
//!
//! Rules, projects and vectors live behind `std::sync::RwLock`. Jobs live
//! behind a single `Mutex` so that claim is one select-and-flip under the
//! lock. Vector search is brute-force cosine similarity.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::error::Error;
use crate::models::{
    CallerScope, EmbeddingJob, JobPriority, JobStatus, Project, QueueBucket, QueueStats, Rule,
    RuleScope, WorkerTally,
};

use super::{
    sort_hits, JobFailure, JobQueue, ReclaimReport, RuleStore, VectorHit, VectorIndex,
};

/// In-memory store. Insertion order of jobs is the final claim tie-break.
pub struct InMemoryStore {
    rules: RwLock<Vec<Rule>>,
    projects: RwLock<Vec<Project>>,
    members: RwLock<BTreeSet<(String, String)>>,
    jobs: Mutex<Vec<EmbeddingJob>>,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            projects: RwLock::new(Vec::new()),
            members: RwLock::new(BTreeSet::new()),
            jobs: Mutex::new(Vec::new()),
            vectors: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

fn is_runnable(job: &EmbeddingJob, now: DateTime<Utc>) -> bool {
    match job.status {
        JobStatus::Pending => true,
        JobStatus::Retrying => job.retry_at.map_or(true, |at| at <= now),
        JobStatus::Processing | JobStatus::Completed | JobStatus::Failed => false,
    }
}

fn held_by(job: &EmbeddingJob, job_id: &str, worker_id: &str) -> bool {
    job.id == job_id
        && job.status == JobStatus::Processing
        && job.worker_id.as_deref() == Some(worker_id)
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let mut rules = self.rules.write().map_err(poisoned)?;
        if rules
            .iter()
            .any(|r| r.scope == rule.scope && r.slug == rule.slug)
        {
            return Err(Error::DuplicateSlug {
                slug: rule.slug.clone(),
                scope: rule.scope.to_string(),
            }
            .into());
        }
        rules.push(rule.clone());
        Ok(())
    }

    async fn replace_rule(&self, rule: &Rule) -> Result<bool> {
        let mut rules = self.rules.write().map_err(poisoned)?;
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(slot) => {
                *slot = rule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_rule(&self, id: &str) -> Result<Option<Rule>> {
        let rules = self.rules.read().map_err(poisoned)?;
        Ok(rules.iter().find(|r| r.id == id).cloned())
    }

    async fn find_rule(&self, scope: &RuleScope, slug: &str) -> Result<Option<Rule>> {
        let rules = self.rules.read().map_err(poisoned)?;
        Ok(rules
            .iter()
            .find(|r| &r.scope == scope && r.slug == slug)
            .cloned())
    }

    async fn rules_in_scope(&self, scope: &CallerScope) -> Result<Vec<Rule>> {
        let rules = self.rules.read().map_err(poisoned)?;
        Ok(rules
            .iter()
            .filter(|r| scope.can_see(&r.scope))
            .cloned()
            .collect())
    }

    async fn all_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.read().map_err(poisoned)?.clone())
    }

    async fn set_rule_embedding(
        &self,
        rule_id: &str,
        embedding: Option<&[f32]>,
        expected_hash: Option<&str>,
    ) -> Result<bool> {
        let mut rules = self.rules.write().map_err(poisoned)?;
        match rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) if expected_hash.map_or(true, |h| rule.content_hash() == h) => {
                rule.embedding = embedding.map(<[f32]>::to_vec);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_rule_embeddings(&self) -> Result<u64> {
        let mut rules = self.rules.write().map_err(poisoned)?;
        let mut cleared = 0;
        for rule in rules.iter_mut().filter(|r| r.embedding.is_some()) {
            rule.embedding = None;
            cleared += 1;
        }
        Ok(cleared)
    }

    async fn insert_project(&self, project: &Project) -> Result<()> {
        let mut projects = self.projects.write().map_err(poisoned)?;
        if projects.iter().any(|p| p.id == project.id) {
            bail!("project '{}' already exists", project.id);
        }
        projects.push(project.clone());
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let projects = self.projects.read().map_err(poisoned)?;
        Ok(projects.iter().find(|p| p.id == id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects = self.projects.read().map_err(poisoned)?.clone();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn add_project_member(&self, project_id: &str, caller: &str) -> Result<()> {
        self.members
            .write()
            .map_err(poisoned)?
            .insert((project_id.to_string(), caller.to_string()));
        Ok(())
    }

    async fn projects_for_caller(&self, caller: &str) -> Result<Vec<String>> {
        let members = self.members.read().map_err(poisoned)?;
        Ok(members
            .iter()
            .filter(|(_, c)| c == caller)
            .map(|(p, _)| p.clone())
            .collect())
    }
}

#[async_trait]
impl JobQueue for InMemoryStore {
    async fn insert_job(&self, job: &EmbeddingJob) -> Result<()> {
        self.jobs.lock().map_err(poisoned)?.push(job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<EmbeddingJob>> {
        let jobs = self.jobs.lock().map_err(poisoned)?;
        Ok(jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn find_completed_job(
        &self,
        content_hash: &str,
        model: &str,
    ) -> Result<Option<EmbeddingJob>> {
        let jobs = self.jobs.lock().map_err(poisoned)?;
        Ok(jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Completed
                    && j.content_hash == content_hash
                    && j.embedding_model == model
                    && j.result_vector.is_some()
            })
            .max_by_key(|j| j.completed_at)
            .cloned())
    }

    async fn find_open_job(
        &self,
        rule_id: &str,
        content_hash: &str,
        model: &str,
    ) -> Result<Option<EmbeddingJob>> {
        let jobs = self.jobs.lock().map_err(poisoned)?;
        Ok(jobs
            .iter()
            .find(|j| {
                j.rule_id == rule_id
                    && j.content_hash == content_hash
                    && j.embedding_model == model
                    && j.status.is_open()
            })
            .cloned())
    }

    async fn supersede_open_jobs(
        &self,
        rule_id: &str,
        current_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        let mut superseded = 0;
        for job in jobs.iter_mut().filter(|j| {
            j.rule_id == rule_id
                && j.content_hash != current_hash
                && matches!(j.status, JobStatus::Pending | JobStatus::Retrying)
        }) {
            job.status = JobStatus::Failed;
            job.error_message = Some("superseded by newer rule text".to_string());
            job.completed_at = Some(now);
            job.retry_at = None;
            superseded += 1;
        }
        Ok(superseded)
    }

    async fn fail_open_jobs(&self, reason: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        let mut failed = 0;
        for job in jobs.iter_mut().filter(|j| j.status.is_open()) {
            job.status = JobStatus::Failed;
            job.error_message = Some(reason.to_string());
            job.completed_at = Some(now);
            job.retry_at = None;
            failed += 1;
        }
        Ok(failed)
    }

    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmbeddingJob>> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        let next = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| is_runnable(j, now))
            .min_by(|(ia, a), (ib, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(ia.cmp(ib))
            })
            .map(|(i, _)| i);

        let Some(idx) = next else {
            return Ok(None);
        };
        let job = &mut jobs[idx];
        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.attempts += 1;
        job.retry_at = None;
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        job_id: &str,
        worker_id: &str,
        vector: &[f32],
        processing_time_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        let Some(job) = jobs.iter_mut().find(|j| held_by(j, job_id, worker_id)) else {
            return Ok(false);
        };
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.result_vector = Some(vector.to_vec());
        job.result_dimensions = Some(vector.len());
        job.processing_time_ms = Some(processing_time_ms);
        job.error_message = None;
        Ok(true)
    }

    async fn fail_job(
        &self,
        job_id: &str,
        worker_id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        let Some(job) = jobs.iter_mut().find(|j| held_by(j, job_id, worker_id)) else {
            return Ok(false);
        };
        job.status = failure.status;
        job.error_message = Some(failure.error_message.clone());
        job.retry_at = failure.retry_at;
        if failure.status == JobStatus::Failed {
            job.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn reclaim_stuck_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        let mut report = ReclaimReport::default();
        for job in jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Processing && j.started_at.map_or(true, |t| t < started_before)
        }) {
            if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.error_message = Some(format!(
                    "stuck in processing after {} attempts",
                    job.attempts
                ));
                job.completed_at = Some(now);
                report.failed += 1;
            } else {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.started_at = None;
                report.reset += 1;
            }
        }
        Ok(report)
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<EmbeddingJob>> {
        let jobs = self.jobs.lock().map_err(poisoned)?;
        let mut selected: Vec<EmbeddingJob> = jobs
            .iter()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        selected.reverse();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        selected.truncate(limit);
        Ok(selected)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.lock().map_err(poisoned)?;
        let mut buckets: BTreeMap<(JobStatus, JobPriority), (u64, i64, u64)> = BTreeMap::new();
        let mut workers: BTreeMap<String, (u64, u64)> = BTreeMap::new();

        for job in jobs.iter() {
            let entry = buckets.entry((job.status, job.priority)).or_default();
            entry.0 += 1;
            if let Some(ms) = job.processing_time_ms {
                entry.1 += ms;
                entry.2 += 1;
            }
            if let Some(worker) = &job.worker_id {
                let tally = workers.entry(worker.clone()).or_default();
                match job.status {
                    JobStatus::Completed => tally.0 += 1,
                    JobStatus::Failed => tally.1 += 1,
                    _ => {}
                }
            }
        }

        Ok(QueueStats {
            buckets: buckets
                .into_iter()
                .map(|((status, priority), (count, sum_ms, timed))| QueueBucket {
                    status,
                    priority,
                    count,
                    avg_processing_ms: (timed > 0).then(|| sum_ms as f64 / timed as f64),
                })
                .collect(),
            workers: workers
                .into_iter()
                .filter(|(_, (c, f))| c + f > 0)
                .map(|(worker_id, (completed, failed))| WorkerTally {
                    worker_id,
                    completed,
                    failed,
                })
                .collect(),
        }
        .sorted())
    }
}

#[async_trait]
impl VectorIndex for InMemoryStore {
    async fn upsert_vector(&self, rule_id: &str, vector: &[f32]) -> Result<()> {
        self.vectors
            .write()
            .map_err(poisoned)?
            .insert(rule_id.to_string(), vector.to_vec());
        Ok(())
    }

    async fn remove_vector(&self, rule_id: &str) -> Result<()> {
        self.vectors.write().map_err(poisoned)?.remove(rule_id);
        Ok(())
    }

    async fn search_vectors(
        &self,
        query: &[f32],
        candidates: &HashSet<String>,
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let vectors = self.vectors.read().map_err(poisoned)?;
        let mut hits: Vec<VectorHit> = vectors
            .iter()
            .filter(|(id, _)| candidates.contains(id.as_str()))
            .map(|(id, v)| VectorHit {
                rule_id: id.clone(),
                similarity: cosine_similarity(query, v),
            })
            .filter(|h| h.similarity >= min_similarity)
            .collect();
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn clear_vectors(&self) -> Result<()> {
        self.vectors.write().map_err(poisoned)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests::sample_rule;
    use chrono::Duration;

    fn job(id: &str, priority: JobPriority, created_at: DateTime<Utc>) -> EmbeddingJob {
        EmbeddingJob {
            id: id.to_string(),
            rule_id: format!("rule-{}", id),
            status: JobStatus::Pending,
            priority,
            input_text: "text".to_string(),
            content_hash: format!("hash-{}", id),
            embedding_model: "test".to_string(),
            attempts: 0,
            max_attempts: 3,
            created_at,
            started_at: None,
            completed_at: None,
            retry_at: None,
            result_vector: None,
            result_dimensions: None,
            error_message: None,
            worker_id: None,
            processing_time_ms: None,
        }
    }

    #[tokio::test]
    async fn test_claim_order_priority_then_age_then_insertion() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        store.insert_job(&job("a", JobPriority::Normal, t0)).await.unwrap();
        store.insert_job(&job("b", JobPriority::Urgent, t0 + Duration::seconds(5))).await.unwrap();
        store.insert_job(&job("c", JobPriority::Normal, t0)).await.unwrap();
        store.insert_job(&job("d", JobPriority::Low, t0 - Duration::seconds(60))).await.unwrap();

        let now = t0 + Duration::seconds(10);
        let mut order = Vec::new();
        while let Some(j) = store.claim_next_job("w", now).await.unwrap() {
            assert_eq!(j.status, JobStatus::Processing);
            assert_eq!(j.attempts, 1);
            order.push(j.id);
        }
        assert_eq!(order, vec!["b", "a", "c", "d"]);
    }

    #[tokio::test]
    async fn test_retrying_job_waits_for_retry_at() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut j = job("r", JobPriority::Normal, now);
        j.status = JobStatus::Retrying;
        j.attempts = 1;
        j.retry_at = Some(now + Duration::seconds(60));
        store.insert_job(&j).await.unwrap();

        assert!(store.claim_next_job("w", now).await.unwrap().is_none());
        let claimed = store
            .claim_next_job("w", now + Duration::seconds(61))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_complete_requires_matching_worker() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert_job(&job("x", JobPriority::Normal, now)).await.unwrap();
        store.claim_next_job("w1", now).await.unwrap().unwrap();

        assert!(!store.complete_job("x", "w2", &[1.0], 5, now).await.unwrap());
        assert!(store.complete_job("x", "w1", &[1.0], 5, now).await.unwrap());
        assert!(!store.complete_job("x", "w1", &[1.0], 5, now).await.unwrap());

        let done = store.get_job("x").await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result_dimensions, Some(1));
    }

    #[tokio::test]
    async fn test_reclaim_resets_or_fails_exhausted() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        store.insert_job(&job("fresh", JobPriority::Normal, t0)).await.unwrap();
        let mut spent = job("spent", JobPriority::Normal, t0);
        spent.attempts = 2;
        store.insert_job(&spent).await.unwrap();
        store.claim_next_job("w", t0).await.unwrap();
        store.claim_next_job("w", t0).await.unwrap();

        let later = t0 + Duration::minutes(11);
        let report = store
            .reclaim_stuck_jobs(later - Duration::minutes(10), later)
            .await
            .unwrap();
        assert_eq!(report, ReclaimReport { reset: 1, failed: 1 });

        let fresh = store.get_job("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Pending);
        assert!(fresh.worker_id.is_none());
        let spent = store.get_job("spent").await.unwrap().unwrap();
        assert_eq!(spent.status, JobStatus::Failed);

        let again = store
            .reclaim_stuck_jobs(later - Duration::minutes(10), later)
            .await
            .unwrap();
        assert_eq!(again, ReclaimReport::default());
    }

    #[tokio::test]
    async fn test_vector_search_respects_candidates_and_threshold() {
        let store = InMemoryStore::new();
        store.upsert_vector("near", &[1.0, 0.0]).await.unwrap();
        store.upsert_vector("far", &[0.0, 1.0]).await.unwrap();
        store.upsert_vector("hidden", &[1.0, 0.0]).await.unwrap();

        let candidates: HashSet<String> = ["near", "far"].iter().map(|s| s.to_string()).collect();
        let hits = store
            .search_vectors(&[1.0, 0.1], &candidates, 0.5, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rule_id, "near");
    }

    #[tokio::test]
    async fn test_set_embedding_checks_hash_and_keeps_updated_at() {
        let store = InMemoryStore::new();
        let rule = sample_rule("r1", "hashed");
        store.insert_rule(&rule).await.unwrap();

        let stale = store
            .set_rule_embedding("r1", Some(&[1.0, 0.0]), Some("not-the-hash"))
            .await
            .unwrap();
        assert!(!stale);
        assert!(!store.get_rule("r1").await.unwrap().unwrap().has_embedding());

        let hash = rule.content_hash();
        assert!(store
            .set_rule_embedding("r1", Some(&[1.0, 0.0]), Some(&hash))
            .await
            .unwrap());
        let stored = store.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(stored.embedding, Some(vec![1.0, 0.0]));
        assert_eq!(stored.updated_at, rule.updated_at);
    }

    #[tokio::test]
    async fn test_duplicate_slug_insert_is_typed() {
        let store = InMemoryStore::new();
        store.insert_rule(&sample_rule("r1", "taken")).await.unwrap();
        let err = store
            .insert_rule(&sample_rule("r2", "taken"))
            .await
            .unwrap_err();
        assert!(matches!(
            Error::from_store(err),
            Error::DuplicateSlug { slug, .. } if slug == "taken"
        ));
    }
}
