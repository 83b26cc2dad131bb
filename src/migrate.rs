//! Idempotent schema migrations.
//!
//! Every statement is `CREATE … IF NOT EXISTS`, so `guide init` can be run
//! any number of times against the same database.
//!
//! | Table | Holds |
//! |-------|-------|
//! | `projects` | project id, display name |
//! | `project_members` | which callers may read a project's rules |
//! | `rules` | guidance rules, with the hash and embedding of their current text |
//! | `rule_vectors` | the searchable vector index, rebuildable from `rules` |
//! | `embedding_jobs` | the embedding job queue |
//!
//! Timestamps are Unix milliseconds. Tag sets are JSON arrays. Vectors are
//! little-endian `f32` BLOBs.

use anyhow::Result;
use guidance_harness_core::store::RuleStore;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS project_members (
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        caller TEXT NOT NULL,
        PRIMARY KEY (project_id, caller)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rules (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL,
        project_id TEXT REFERENCES projects(id),
        title TEXT NOT NULL,
        guidance TEXT NOT NULL,
        rationale TEXT,
        category TEXT NOT NULL,
        priority TEXT NOT NULL,
        contexts TEXT NOT NULL DEFAULT '[]',
        tech_stacks TEXT NOT NULL DEFAULT '[]',
        keywords TEXT NOT NULL DEFAULT '[]',
        content_hash TEXT NOT NULL DEFAULT '',
        embedding BLOB,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    // Slugs are unique per scope; the global scope is the empty project id.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_rules_scope_slug ON rules(COALESCE(project_id, ''), slug)",
    r#"
    CREATE TABLE IF NOT EXISTS rule_vectors (
        rule_id TEXT PRIMARY KEY REFERENCES rules(id) ON DELETE CASCADE,
        dims INTEGER NOT NULL,
        embedding BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embedding_jobs (
        id TEXT PRIMARY KEY,
        rule_id TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        input_text TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        embedding_model TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        completed_at INTEGER,
        retry_at INTEGER,
        result_vector BLOB,
        result_dimensions INTEGER,
        error_message TEXT,
        worker_id TEXT,
        processing_time_ms INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON embedding_jobs(status, priority DESC, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON embedding_jobs(content_hash, embedding_model, status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_rule ON embedding_jobs(rule_id, status)",
];

/// Create all tables and indexes on an open pool.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    add_rule_content_hash(pool).await
}

/// Databases created before `rules.content_hash` existed get the column
/// added and filled from each rule's current text.
async fn add_rule_content_hash(pool: &SqlitePool) -> Result<()> {
    let present: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('rules') WHERE name = 'content_hash'",
    )
    .fetch_one(pool)
    .await?;
    if present > 0 {
        return Ok(());
    }

    sqlx::query("ALTER TABLE rules ADD COLUMN content_hash TEXT NOT NULL DEFAULT ''")
        .execute(pool)
        .await?;
    let rules = SqliteStore::new(pool.clone()).all_rules().await?;
    for rule in &rules {
        sqlx::query("UPDATE rules SET content_hash = ? WHERE id = ?")
            .bind(rule.content_hash())
            .bind(&rule.id)
            .execute(pool)
            .await?;
    }
    info!(rules = rules.len(), "added content_hash to rules");
    Ok(())
}

/// Connect to the configured database and apply the schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}
