//! SQLite-backed [`Store`](guidance_harness_core::store::Store) implementation.
//!
//! Implements the rule store, the job queue and the vector index over the
//! schema created by [`crate::migrate`]. Every job transition that can race
//! is a single conditional `UPDATE`, so any number of worker processes may
//! share one database file.

use std::collections::{BTreeSet, HashSet};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use guidance_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use guidance_harness_core::error::Error;
use guidance_harness_core::models::{
    CallerScope, EmbeddingJob, JobPriority, JobStatus, Project, QueueBucket, QueueStats, Rule,
    RuleScope, WorkerTally,
};
use guidance_harness_core::store::{
    sort_hits, JobFailure, JobQueue, ReclaimReport, RuleStore, VectorHit, VectorIndex,
};

/// SQLite implementation of the core storage traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

fn opt_from_ms(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

fn set_to_json(set: &BTreeSet<String>) -> Result<String> {
    Ok(serde_json::to_string(set)?)
}

fn set_from_json(text: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str(text).with_context(|| format!("invalid tag list: {}", text))
}

fn rule_from_row(row: &SqliteRow) -> Result<Rule> {
    let project_id: Option<String> = row.try_get("project_id")?;
    let category: String = row.try_get("category")?;
    let priority: String = row.try_get("priority")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    Ok(Rule {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        scope: RuleScope::from_project(project_id),
        title: row.try_get("title")?,
        guidance: row.try_get("guidance")?,
        rationale: row.try_get("rationale")?,
        category: category.parse()?,
        priority: priority.parse()?,
        contexts: set_from_json(&row.try_get::<String, _>("contexts")?)?,
        tech_stacks: set_from_json(&row.try_get::<String, _>("tech_stacks")?)?,
        keywords: set_from_json(&row.try_get::<String, _>("keywords")?)?,
        embedding: embedding.as_deref().map(blob_to_vec),
        created_at: from_ms(row.try_get("created_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
    })
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: from_ms(row.try_get("created_at")?)?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<EmbeddingJob> {
    let status: String = row.try_get("status")?;
    let result_vector: Option<Vec<u8>> = row.try_get("result_vector")?;
    let result_dimensions: Option<i64> = row.try_get("result_dimensions")?;
    Ok(EmbeddingJob {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        status: status.parse()?,
        priority: JobPriority::from_rank(row.try_get("priority")?)?,
        input_text: row.try_get("input_text")?,
        content_hash: row.try_get("content_hash")?,
        embedding_model: row.try_get("embedding_model")?,
        attempts: u32::try_from(row.try_get::<i64, _>("attempts")?)?,
        max_attempts: u32::try_from(row.try_get::<i64, _>("max_attempts")?)?,
        created_at: from_ms(row.try_get("created_at")?)?,
        started_at: opt_from_ms(row.try_get("started_at")?)?,
        completed_at: opt_from_ms(row.try_get("completed_at")?)?,
        retry_at: opt_from_ms(row.try_get("retry_at")?)?,
        result_vector: result_vector.as_deref().map(blob_to_vec),
        result_dimensions: result_dimensions.map(usize::try_from).transpose()?,
        error_message: row.try_get("error_message")?,
        worker_id: row.try_get("worker_id")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
    })
}

const RUNNABLE: &str =
    "(status = 'pending' OR (status = 'retrying' AND (retry_at IS NULL OR retry_at <= ?)))";

#[async_trait]
impl RuleStore for SqliteStore {
    async fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO rules (id, slug, project_id, title, guidance, rationale, category,
                               priority, contexts, tech_stacks, keywords, content_hash,
                               embedding, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.slug)
        .bind(rule.scope.project_id())
        .bind(&rule.title)
        .bind(&rule.guidance)
        .bind(&rule.rationale)
        .bind(rule.category.as_str())
        .bind(rule.priority.as_str())
        .bind(set_to_json(&rule.contexts)?)
        .bind(set_to_json(&rule.tech_stacks)?)
        .bind(set_to_json(&rule.keywords)?)
        .bind(rule.content_hash())
        .bind(rule.embedding.as_deref().map(vec_to_blob))
        .bind(to_ms(rule.created_at))
        .bind(to_ms(rule.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(Error::DuplicateSlug {
                    slug: rule.slug.clone(),
                    scope: rule.scope.to_string(),
                }
                .into())
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("inserting rule '{}' in scope {}", rule.slug, rule.scope))),
        }
    }

    async fn replace_rule(&self, rule: &Rule) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE rules SET
                slug = ?, project_id = ?, title = ?, guidance = ?, rationale = ?,
                category = ?, priority = ?, contexts = ?, tech_stacks = ?, keywords = ?,
                content_hash = ?, embedding = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&rule.slug)
        .bind(rule.scope.project_id())
        .bind(&rule.title)
        .bind(&rule.guidance)
        .bind(&rule.rationale)
        .bind(rule.category.as_str())
        .bind(rule.priority.as_str())
        .bind(set_to_json(&rule.contexts)?)
        .bind(set_to_json(&rule.tech_stacks)?)
        .bind(set_to_json(&rule.keywords)?)
        .bind(rule.content_hash())
        .bind(rule.embedding.as_deref().map(vec_to_blob))
        .bind(to_ms(rule.updated_at))
        .bind(&rule.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_rule(&self, id: &str) -> Result<Option<Rule>> {
        sqlx::query("SELECT * FROM rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(rule_from_row)
            .transpose()
    }

    async fn find_rule(&self, scope: &RuleScope, slug: &str) -> Result<Option<Rule>> {
        sqlx::query("SELECT * FROM rules WHERE COALESCE(project_id, '') = ? AND slug = ?")
            .bind(scope.project_id().unwrap_or(""))
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(rule_from_row)
            .transpose()
    }

    async fn rules_in_scope(&self, scope: &CallerScope) -> Result<Vec<Rule>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM rules WHERE project_id IS NULL");
        if !scope.accessible_projects.is_empty() {
            query.push(" OR project_id IN (");
            let mut ids = query.separated(", ");
            for project in &scope.accessible_projects {
                ids.push_bind(project.clone());
            }
            ids.push_unseparated(")");
        }
        query.push(" ORDER BY created_at, id");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn all_rules(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query("SELECT * FROM rules ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn set_rule_embedding(
        &self,
        rule_id: &str,
        embedding: Option<&[f32]>,
        expected_hash: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE rules SET embedding = ? WHERE id = ? AND (? IS NULL OR content_hash = ?)",
        )
        .bind(embedding.map(vec_to_blob))
        .bind(rule_id)
        .bind(expected_hash)
        .bind(expected_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_rule_embeddings(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE rules SET embedding = NULL WHERE embedding IS NOT NULL")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query("INSERT INTO projects (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&project.id)
            .bind(&project.name)
            .bind(to_ms(project.created_at))
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting project '{}'", project.id))?;
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(project_from_row)
            .transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn add_project_member(&self, project_id: &str, caller: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO project_members (project_id, caller) VALUES (?, ?)")
            .bind(project_id)
            .bind(caller)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn projects_for_caller(&self, caller: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT project_id FROM project_members WHERE caller = ? ORDER BY project_id",
        )
        .bind(caller)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl JobQueue for SqliteStore {
    async fn insert_job(&self, job: &EmbeddingJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embedding_jobs (id, rule_id, status, priority, input_text, content_hash,
                                        embedding_model, attempts, max_attempts, created_at,
                                        started_at, completed_at, retry_at, result_vector,
                                        result_dimensions, error_message, worker_id,
                                        processing_time_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.rule_id)
        .bind(job.status.as_str())
        .bind(job.priority.rank())
        .bind(&job.input_text)
        .bind(&job.content_hash)
        .bind(&job.embedding_model)
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_attempts))
        .bind(to_ms(job.created_at))
        .bind(job.started_at.map(to_ms))
        .bind(job.completed_at.map(to_ms))
        .bind(job.retry_at.map(to_ms))
        .bind(job.result_vector.as_deref().map(vec_to_blob))
        .bind(job.result_dimensions.map(|d| d as i64))
        .bind(&job.error_message)
        .bind(&job.worker_id)
        .bind(job.processing_time_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<EmbeddingJob>> {
        sqlx::query("SELECT * FROM embedding_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(job_from_row)
            .transpose()
    }

    async fn find_completed_job(
        &self,
        content_hash: &str,
        model: &str,
    ) -> Result<Option<EmbeddingJob>> {
        sqlx::query(
            r#"
            SELECT * FROM embedding_jobs
            WHERE status = 'completed' AND content_hash = ? AND embedding_model = ?
              AND result_vector IS NOT NULL
            ORDER BY completed_at DESC
            LIMIT 1
            "#,
        )
        .bind(content_hash)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(job_from_row)
        .transpose()
    }

    async fn find_open_job(
        &self,
        rule_id: &str,
        content_hash: &str,
        model: &str,
    ) -> Result<Option<EmbeddingJob>> {
        sqlx::query(
            r#"
            SELECT * FROM embedding_jobs
            WHERE rule_id = ? AND content_hash = ? AND embedding_model = ?
              AND status IN ('pending', 'processing', 'retrying')
            ORDER BY created_at, rowid
            LIMIT 1
            "#,
        )
        .bind(rule_id)
        .bind(content_hash)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(job_from_row)
        .transpose()
    }

    async fn supersede_open_jobs(
        &self,
        rule_id: &str,
        current_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'failed', error_message = 'superseded by newer rule text',
                completed_at = ?, retry_at = NULL
            WHERE rule_id = ? AND content_hash <> ? AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(to_ms(now))
        .bind(rule_id)
        .bind(current_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_open_jobs(&self, reason: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'failed', error_message = ?, completed_at = ?, retry_at = NULL
            WHERE status IN ('pending', 'processing', 'retrying')
            "#,
        )
        .bind(reason)
        .bind(to_ms(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmbeddingJob>> {
        // The outer status check turns a lost race into zero rows updated.
        let sql = format!(
            r#"
            UPDATE embedding_jobs
            SET status = 'processing', started_at = ?, worker_id = ?,
                attempts = attempts + 1, retry_at = NULL
            WHERE id = (
                SELECT id FROM embedding_jobs
                WHERE {RUNNABLE}
                ORDER BY priority DESC, created_at ASC, rowid ASC
                LIMIT 1
            )
            AND {RUNNABLE}
            RETURNING *
            "#
        );
        let now_ms = to_ms(now);
        sqlx::query(&sql)
            .bind(now_ms)
            .bind(worker_id)
            .bind(now_ms)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(job_from_row)
            .transpose()
    }

    async fn complete_job(
        &self,
        job_id: &str,
        worker_id: &str,
        vector: &[f32],
        processing_time_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'completed', completed_at = ?, result_vector = ?,
                result_dimensions = ?, processing_time_ms = ?, error_message = NULL
            WHERE id = ? AND status = 'processing' AND worker_id = ?
            "#,
        )
        .bind(to_ms(now))
        .bind(vec_to_blob(vector))
        .bind(vector.len() as i64)
        .bind(processing_time_ms)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_job(
        &self,
        job_id: &str,
        worker_id: &str,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let completed_at = (failure.status == JobStatus::Failed).then(|| to_ms(now));
        let result = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = ?, error_message = ?, retry_at = ?,
                completed_at = COALESCE(?, completed_at)
            WHERE id = ? AND status = 'processing' AND worker_id = ?
            "#,
        )
        .bind(failure.status.as_str())
        .bind(&failure.error_message)
        .bind(failure.retry_at.map(to_ms))
        .bind(completed_at)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reclaim_stuck_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport> {
        let cutoff = to_ms(started_before);
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'failed',
                error_message = 'stuck in processing after ' || attempts || ' attempts',
                completed_at = ?
            WHERE status = 'processing' AND (started_at IS NULL OR started_at < ?)
              AND attempts >= max_attempts
            "#,
        )
        .bind(to_ms(now))
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let reset = sqlx::query(
            r#"
            UPDATE embedding_jobs
            SET status = 'pending', worker_id = NULL, started_at = NULL
            WHERE status = 'processing' AND (started_at IS NULL OR started_at < ?)
              AND attempts < max_attempts
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(ReclaimReport { reset, failed })
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<EmbeddingJob>> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"
            SELECT * FROM embedding_jobs
            WHERE (? IS NULL OR status = ?)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let bucket_rows = sqlx::query(
            r#"
            SELECT status, priority, COUNT(*) AS count, AVG(processing_time_ms) AS avg_ms
            FROM embedding_jobs
            GROUP BY status, priority
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut buckets = Vec::with_capacity(bucket_rows.len());
        for row in &bucket_rows {
            let status: String = row.try_get("status")?;
            buckets.push(QueueBucket {
                status: status.parse()?,
                priority: JobPriority::from_rank(row.try_get("priority")?)?,
                count: u64::try_from(row.try_get::<i64, _>("count")?)?,
                avg_processing_ms: row.try_get("avg_ms")?,
            });
        }

        let worker_rows = sqlx::query(
            r#"
            SELECT worker_id,
                   SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                   SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
            FROM embedding_jobs
            WHERE worker_id IS NOT NULL
            GROUP BY worker_id
            HAVING completed + failed > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workers = Vec::with_capacity(worker_rows.len());
        for row in &worker_rows {
            workers.push(WorkerTally {
                worker_id: row.try_get("worker_id")?,
                completed: u64::try_from(row.try_get::<i64, _>("completed")?)?,
                failed: u64::try_from(row.try_get::<i64, _>("failed")?)?,
            });
        }

        Ok(QueueStats { buckets, workers }.sorted())
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn upsert_vector(&self, rule_id: &str, vector: &[f32]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_vectors (rule_id, dims, embedding) VALUES (?, ?, ?)
            ON CONFLICT(rule_id) DO UPDATE SET
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(rule_id)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_vector(&self, rule_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM rule_vectors WHERE rule_id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search_vectors(
        &self,
        query: &[f32],
        candidates: &HashSet<String>,
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        if candidates.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        // Only rows that can score are read: same length as the query and
        // visible to the caller.
        let mut select: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT rule_id, embedding FROM rule_vectors WHERE dims = ");
        select.push_bind(query.len() as i64);
        select.push(" AND rule_id IN (");
        let mut ids = select.separated(", ");
        for id in candidates {
            ids.push_bind(id.clone());
        }
        ids.push_unseparated(")");
        let rows = select.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::new();
        for row in &rows {
            let rule_id: String = row.try_get("rule_id")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            let similarity = cosine_similarity(query, &blob_to_vec(&blob));
            if similarity >= min_similarity {
                hits.push(VectorHit {
                    rule_id,
                    similarity,
                });
            }
        }

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn clear_vectors(&self) -> Result<()> {
        sqlx::query("DELETE FROM rule_vectors")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use chrono::Duration;
    use guidance_harness_core::jobs::{QueueConfig, Transition};
    use guidance_harness_core::models::{Category, Priority};
    use guidance_harness_core::queue::{EmbeddingQueue, EnqueueOutcome};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::open(&tmp.path().join("guide.sqlite"))
            .await
            .unwrap();
        migrate::migrate(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn rule(id: &str, slug: &str, project: Option<&str>) -> Rule {
        let now = Utc::now();
        Rule {
            id: id.to_string(),
            slug: slug.to_string(),
            scope: RuleScope::from_project(project.map(str::to_string)),
            title: "Use bcrypt for password hashing".to_string(),
            guidance: "Hash passwords with bcrypt at cost 12.".to_string(),
            rationale: None,
            category: Category::Security,
            priority: Priority::High,
            contexts: BTreeSet::from(["security".to_string()]),
            tech_stacks: BTreeSet::new(),
            keywords: BTreeSet::from(["bcrypt".to_string()]),
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_rule_roundtrip_and_scope_uniqueness() {
        let (_tmp, store) = open_store().await;
        store
            .insert_project(&Project {
                id: "payments".to_string(),
                name: "Payments".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store.insert_rule(&rule("r1", "use-bcrypt", None)).await.unwrap();
        store
            .insert_rule(&rule("r2", "use-bcrypt", Some("payments")))
            .await
            .unwrap();
        let err = store
            .insert_rule(&rule("r3", "use-bcrypt", None))
            .await
            .unwrap_err();
        assert!(matches!(
            Error::from_store(err),
            Error::DuplicateSlug { slug, .. } if slug == "use-bcrypt"
        ));

        let fetched = store
            .find_rule(&RuleScope::Project("payments".to_string()), "use-bcrypt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, "r2");
        assert_eq!(fetched.priority, Priority::High);
        assert!(fetched.contexts.contains("security"));

        let global_only = store
            .rules_in_scope(&CallerScope::global_only())
            .await
            .unwrap();
        assert_eq!(global_only.len(), 1);
        let with_project = store
            .rules_in_scope(&CallerScope::for_projects(["payments"]))
            .await
            .unwrap();
        assert_eq!(with_project.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let (_tmp, store) = open_store().await;
        let config = QueueConfig::new("test-model", 3);
        let base = Utc::now() - Duration::minutes(5);
        let r = rule("r1", "use-bcrypt", None);

        let mut low = EmbeddingJob::pending(&r, JobPriority::Low, &config, base);
        low.content_hash = "a".into();
        let mut urgent = EmbeddingJob::pending(&r, JobPriority::Urgent, &config, base + Duration::seconds(1));
        urgent.content_hash = "b".into();
        let mut normal_old = EmbeddingJob::pending(&r, JobPriority::Normal, &config, base);
        normal_old.content_hash = "c".into();
        let mut normal_new = EmbeddingJob::pending(&r, JobPriority::Normal, &config, base + Duration::seconds(2));
        normal_new.content_hash = "d".into();
        for job in [&low, &urgent, &normal_new, &normal_old] {
            store.insert_job(job).await.unwrap();
        }

        let now = Utc::now();
        let order: Vec<String> = {
            let mut ids = Vec::new();
            while let Some(job) = store.claim_next_job("w1", now).await.unwrap() {
                assert_eq!(job.status, JobStatus::Processing);
                assert_eq!(job.attempts, 1);
                assert_eq!(job.worker_id.as_deref(), Some("w1"));
                ids.push(job.id);
            }
            ids
        };
        assert_eq!(order, vec![urgent.id, normal_old.id, normal_new.id, low.id]);
    }

    #[tokio::test]
    async fn test_retrying_job_waits_for_retry_at() {
        let (_tmp, store) = open_store().await;
        let config = QueueConfig::new("test-model", 3);
        let now = Utc::now();
        let job = EmbeddingJob::pending(&rule("r1", "s", None), JobPriority::Normal, &config, now);
        store.insert_job(&job).await.unwrap();

        let claimed = store.claim_next_job("w1", now).await.unwrap().unwrap();
        let failure = JobFailure {
            status: JobStatus::Retrying,
            error_message: "rate limited".to_string(),
            retry_at: Some(now + Duration::seconds(60)),
        };
        assert!(store.fail_job(&claimed.id, "w1", &failure, now).await.unwrap());
        // A second fail from the same worker is a CAS miss.
        assert!(!store.fail_job(&claimed.id, "w1", &failure, now).await.unwrap());

        assert!(store.claim_next_job("w2", now).await.unwrap().is_none());
        let again = store
            .claim_next_job("w2", now + Duration::seconds(61))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempts, 2);
        assert!(again.retry_at.is_none());
    }

    #[tokio::test]
    async fn test_complete_requires_holder_and_records_result() {
        let (_tmp, store) = open_store().await;
        let config = QueueConfig::new("test-model", 3);
        let now = Utc::now();
        let job = EmbeddingJob::pending(&rule("r1", "s", None), JobPriority::Normal, &config, now);
        store.insert_job(&job).await.unwrap();
        store.claim_next_job("w1", now).await.unwrap().unwrap();

        assert!(!store
            .complete_job(&job.id, "w2", &[1.0, 0.0, 0.0], 12, now)
            .await
            .unwrap());
        assert!(store
            .complete_job(&job.id, "w1", &[1.0, 0.0, 0.0], 12, now)
            .await
            .unwrap());

        let done = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result_dimensions, Some(3));
        assert_eq!(done.result_vector, Some(vec![1.0, 0.0, 0.0]));

        let reused = store
            .find_completed_job(&job.content_hash, "test-model")
            .await
            .unwrap();
        assert_eq!(reused.map(|j| j.id), Some(job.id.clone()));
        assert!(store
            .find_completed_job(&job.content_hash, "other-model")
            .await
            .unwrap()
            .is_none());

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.count(JobStatus::Completed), 1);
        assert_eq!(stats.workers.len(), 1);
        assert_eq!(stats.workers[0].completed, 1);
        assert_eq!(stats.buckets[0].avg_processing_ms, Some(12.0));
    }

    #[tokio::test]
    async fn test_reclaim_resets_or_fails_stuck_jobs() {
        let (_tmp, store) = open_store().await;
        let config = QueueConfig {
            max_attempts: 1,
            ..QueueConfig::new("test-model", 3)
        };
        let start = Utc::now() - Duration::minutes(30);
        let r = rule("r1", "s", None);
        let mut exhausted = EmbeddingJob::pending(&r, JobPriority::High, &config, start);
        exhausted.content_hash = "x".into();
        let mut fresh = EmbeddingJob::pending(&r, JobPriority::Normal, &config, start);
        fresh.content_hash = "y".into();
        fresh.max_attempts = 3;
        store.insert_job(&exhausted).await.unwrap();
        store.insert_job(&fresh).await.unwrap();
        store.claim_next_job("w1", start).await.unwrap().unwrap();
        store.claim_next_job("w2", start).await.unwrap().unwrap();

        let report = store
            .reclaim_stuck_jobs(Utc::now() - Duration::minutes(10), Utc::now())
            .await
            .unwrap();
        assert_eq!(report, ReclaimReport { reset: 1, failed: 1 });

        let exhausted = store.get_job(&exhausted.id).await.unwrap().unwrap();
        assert_eq!(exhausted.status, JobStatus::Failed);
        let fresh = store.get_job(&fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Pending);
        assert!(fresh.worker_id.is_none());

        // The original holder's late completion is ignored.
        assert!(!store
            .complete_job(&fresh.id, "w2", &[1.0, 0.0, 0.0], 5, Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_vector_search_respects_candidates_and_threshold() {
        let (_tmp, store) = open_store().await;
        for (id, slug) in [("a", "a"), ("b", "b"), ("c", "c")] {
            store.insert_rule(&rule(id, slug, None)).await.unwrap();
        }
        store.upsert_vector("a", &[1.0, 0.0]).await.unwrap();
        store.upsert_vector("b", &[0.8, 0.6]).await.unwrap();
        store.upsert_vector("c", &[0.0, 1.0]).await.unwrap();

        let all: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let hits = store.search_vectors(&[1.0, 0.0], &all, 0.5, 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let only_b: HashSet<String> = ["b".to_string()].into_iter().collect();
        let hits = store.search_vectors(&[1.0, 0.0], &only_b, 0.0, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rule_id, "b");

        store.clear_vectors().await.unwrap();
        assert!(store.search_vectors(&[1.0, 0.0], &all, 0.0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_skips_other_dimensions() {
        let (_tmp, store) = open_store().await;
        store.insert_rule(&rule("a", "a", None)).await.unwrap();
        store.insert_rule(&rule("b", "b", None)).await.unwrap();
        store.upsert_vector("a", &[1.0, 0.0]).await.unwrap();
        store.upsert_vector("b", &[1.0, 0.0, 0.0]).await.unwrap();

        let all: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let hits = store.search_vectors(&[1.0, 0.0, 0.0], &all, -1.0, 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn test_set_embedding_checks_hash_and_keeps_updated_at() {
        let (_tmp, store) = open_store().await;
        let mut original = rule("r1", "hashed", None);
        store.insert_rule(&original).await.unwrap();
        let before = store.get_rule("r1").await.unwrap().unwrap();

        original.guidance = "Hash passwords with argon2id.".to_string();
        store.replace_rule(&original).await.unwrap();

        let stale = store
            .set_rule_embedding("r1", Some(&[1.0, 0.0]), Some(&before.content_hash()))
            .await
            .unwrap();
        assert!(!stale);
        assert!(!store.get_rule("r1").await.unwrap().unwrap().has_embedding());

        assert!(store
            .set_rule_embedding("r1", Some(&[1.0, 0.0]), Some(&original.content_hash()))
            .await
            .unwrap());
        let stored = store.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(stored.embedding, Some(vec![1.0, 0.0]));
        assert_eq!(stored.updated_at, before.updated_at);

        assert!(!store
            .set_rule_embedding("missing", Some(&[1.0, 0.0]), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reset_cancels_in_flight_job_and_requeues_under_new_model() {
        let (_tmp, store) = open_store().await;
        let store = Arc::new(store);
        store.insert_rule(&rule("r1", "in-flight", None)).await.unwrap();
        let r1 = store.get_rule("r1").await.unwrap().unwrap();
        let t0 = Utc::now();

        let old = EmbeddingQueue::new(store.clone(), QueueConfig::new("test-model", 3));
        old.enqueue_if_needed(&r1, None, t0).await.unwrap();
        let job = old.claim("w1", t0).await.unwrap().unwrap();

        let fresh = EmbeddingQueue::new(store.clone(), QueueConfig::new("new-model", 3));
        let summary = fresh.reset_embeddings(t0).await.unwrap();
        assert_eq!(summary.enqueued, 1);
        assert_eq!(summary.already_queued, 0);

        let late = old
            .complete(&job, "w1", vec![1.0, 0.0, 0.0], 5, t0)
            .await
            .unwrap();
        assert_eq!(late, Transition::Lost);
        assert!(!store.get_rule("r1").await.unwrap().unwrap().has_embedding());

        let later = t0 + Duration::minutes(11);
        assert_eq!(fresh.reclaim_stuck(later).await.unwrap(), ReclaimReport::default());
        let next = fresh.claim("w2", later).await.unwrap().unwrap();
        assert_eq!(next.embedding_model, "new-model");
        assert_eq!(
            fresh.complete(&next, "w2", vec![0.0, 1.0, 0.0], 5, later).await.unwrap(),
            Transition::Completed { attached: true }
        );
    }

    #[tokio::test]
    async fn test_model_change_enqueues_despite_old_model_job() {
        let (_tmp, store) = open_store().await;
        let store = Arc::new(store);
        store.insert_rule(&rule("r1", "switch", None)).await.unwrap();
        let r1 = store.get_rule("r1").await.unwrap().unwrap();
        let now = Utc::now();

        let old = EmbeddingQueue::new(store.clone(), QueueConfig::new("test-model", 3));
        old.enqueue_if_needed(&r1, None, now).await.unwrap();

        let fresh = EmbeddingQueue::new(store.clone(), QueueConfig::new("new-model", 3));
        let outcome = fresh.enqueue_if_needed(&r1, None, now).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Enqueued { .. }));
        assert!(store
            .find_open_job("r1", &r1.content_hash(), "new-model")
            .await
            .unwrap()
            .is_some());
    }
}
