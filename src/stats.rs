//! Queue and index statistics: `guide jobs stats|list|sweep`.
//!
//! Gives a quick read on whether embeddings are keeping up: rule coverage,
//! job counts per status and priority, and which workers finished what.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use guidance_harness_core::models::{JobStatus, QueueStats};
use guidance_harness_core::store::{JobQueue, RuleStore};

use crate::config::Config;
use crate::harness::Harness;

/// Everything `guide jobs stats --json` prints.
#[derive(Debug, Serialize)]
struct StatsReport {
    rules: u64,
    embedded: u64,
    jobs: u64,
    queue: QueueStats,
}

pub async fn run_jobs_stats(config: &Config, json: bool) -> Result<()> {
    let harness = Harness::open(config).await?;
    let rules = harness.store().all_rules().await?;
    let queue = harness.queue().stats().await?;
    let report = StatsReport {
        rules: rules.len() as u64,
        embedded: rules.iter().filter(|r| r.has_embedding()).count() as u64,
        jobs: queue.total(),
        queue,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        harness.close().await;
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Guidance Harness: Queue Stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Rules:       {}", report.rules);
    println!(
        "  Embedded:    {} / {} ({}%)",
        report.embedded,
        report.rules,
        if report.rules > 0 {
            (report.embedded * 100) / report.rules
        } else {
            0
        }
    );
    println!("  Jobs:        {}", report.jobs);

    if !report.queue.buckets.is_empty() {
        println!();
        println!("  By status:");
        println!(
            "  {:<12} {:<9} {:>7} {:>12}",
            "STATUS", "PRIORITY", "JOBS", "AVG MS"
        );
        println!("  {}", "-".repeat(44));
        for bucket in &report.queue.buckets {
            let avg = bucket
                .avg_processing_ms
                .map(|ms| format!("{:.0}", ms))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<12} {:<9} {:>7} {:>12}",
                bucket.status.as_str(),
                bucket.priority.as_str(),
                bucket.count,
                avg
            );
        }
    }

    if !report.queue.workers.is_empty() {
        println!();
        println!("  By worker:");
        println!("  {:<20} {:>10} {:>8}", "WORKER", "COMPLETED", "FAILED");
        println!("  {}", "-".repeat(40));
        for w in &report.queue.workers {
            println!("  {:<20} {:>10} {:>8}", w.worker_id, w.completed, w.failed);
        }
    }

    println!();
    harness.close().await;
    Ok(())
}

pub async fn run_jobs_list(
    config: &Config,
    status: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let status = status.map(str::parse::<JobStatus>).transpose()?;
    let harness = Harness::open(config).await?;
    let jobs = harness.store().list_jobs(status, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
    } else if jobs.is_empty() {
        println!("No jobs.");
    } else {
        println!(
            "{:<36} {:<10} {:<8} {:>8}  {:<14} ERROR",
            "ID", "STATUS", "PRIORITY", "ATTEMPTS", "CREATED"
        );
        let now = Utc::now();
        for job in &jobs {
            println!(
                "{:<36} {:<10} {:<8} {:>8}  {:<14} {}",
                job.id,
                job.status.as_str(),
                job.priority.as_str(),
                format!("{}/{}", job.attempts, job.max_attempts),
                format_relative(job.created_at, now),
                job.error_message.as_deref().unwrap_or("-")
            );
        }
    }
    harness.close().await;
    Ok(())
}

/// Reset stuck `processing` jobs right away instead of waiting for a worker
/// pool's sweeper.
pub async fn run_jobs_sweep(config: &Config) -> Result<()> {
    let harness = Harness::open(config).await?;
    let report = harness.queue().reclaim_stuck(Utc::now()).await?;
    println!("jobs sweep");
    println!("  reset to pending: {}", report.reset);
    println!("  out of attempts:  {}", report.failed);
    harness.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style age of `ts` relative to `now`. Future timestamps and
/// anything older than a month print as a date.
fn format_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();
    if delta < 0 || delta >= 86400 * 30 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, plural(mins))
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, plural(hours))
    } else {
        let days = delta / 86400;
        format!("{} day{} ago", days, plural(days))
    }
}
