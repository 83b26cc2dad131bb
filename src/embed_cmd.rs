//! `guide embed …` and `guide index rebuild`: bulk embedding maintenance.
//!
//! These commands only touch the job queue and the vector index. Embedding
//! itself always happens in `guide worker`.

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::info;

use guidance_harness_core::queue::EnqueueSummary;
use guidance_harness_core::store::{RuleStore, VectorIndex};

use crate::config::Config;
use crate::harness::Harness;

fn require_embeddings(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    Ok(())
}

fn print_summary(title: &str, summary: &EnqueueSummary) {
    println!("{}", title);
    println!("  enqueued: {}", summary.enqueued);
    println!("  reused: {}", summary.reused);
    println!("  already queued: {}", summary.already_queued);
    println!("  up to date: {}", summary.skipped);
}

/// Enqueue a job for every rule that has no embedding yet.
pub async fn run_embed_pending(config: &Config, dry_run: bool) -> Result<()> {
    require_embeddings(config)?;
    let harness = Harness::open(config).await?;

    if dry_run {
        let missing = harness
            .store()
            .all_rules()
            .await?
            .iter()
            .filter(|r| !r.has_embedding())
            .count();
        println!("embed pending (dry-run)");
        println!("  rules needing embeddings: {}", missing);
        harness.close().await;
        return Ok(());
    }

    let summary = harness.queue().enqueue_missing(Utc::now()).await?;
    print_summary("embed pending", &summary);
    harness.close().await;
    Ok(())
}

/// Drop every embedding and re-enqueue all rules at low priority.
pub async fn run_embed_reset(config: &Config) -> Result<()> {
    require_embeddings(config)?;
    let harness = Harness::open(config).await?;
    let summary = harness.queue().reset_embeddings(Utc::now()).await?;
    print_summary("embed reset (existing embeddings cleared)", &summary);
    harness.close().await;
    Ok(())
}

/// Clear the vector index and re-project every rule that has an embedding.
/// Returns the number of vectors written.
pub async fn rebuild_index<S>(store: &S) -> Result<u64>
where
    S: RuleStore + VectorIndex + ?Sized,
{
    store.clear_vectors().await?;
    let mut written = 0;
    for rule in store.all_rules().await? {
        if let Some(vector) = &rule.embedding {
            store.upsert_vector(&rule.id, vector).await?;
            written += 1;
        }
    }
    info!(written, "vector index rebuilt");
    Ok(written)
}

pub async fn run_index_rebuild(config: &Config) -> Result<()> {
    let harness = Harness::open(config).await?;
    let written = rebuild_index(harness.store().as_ref()).await?;
    println!("index rebuild");
    println!("  vectors: {}", written);
    harness.close().await;
    Ok(())
}
