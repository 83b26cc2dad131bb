//! Embedding worker and stuck-job sweeper.
//!
//! A worker is a loop over the job queue: claim a job, call the provider
//! under a timeout, then record the result. Workers hold no state beyond
//! their id and counters, so any number of them may run in one process
//! (`guide worker --concurrency N`) or across processes sharing a database.
//!
//! The sweeper runs next to the workers and periodically returns jobs that
//! have sat in `processing` past the stuck timeout to the queue.
//!
//! Shutdown is cooperative: workers observe a `watch` channel between jobs,
//! so an in-flight job is always finished first.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use guidance_harness_core::embedding::EmbeddingProvider;
use guidance_harness_core::jobs::Transition;
use guidance_harness_core::queue::EmbeddingQueue;
use guidance_harness_core::store::Store;
use guidance_harness_core::ProviderError;

use crate::config::Config;
use crate::harness::Harness;

/// Timing knobs for workers and the sweeper.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Sleep between polls when no job is claimable.
    pub poll_interval: Duration,
    /// Upper bound on one provider call. Exceeding it is a transient failure.
    pub provider_timeout: Duration,
    pub sweep_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            provider_timeout: config.provider_timeout(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            provider_timeout: Duration::from_secs(35),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Per-worker outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    /// Results dropped because the job was reclaimed or superseded meanwhile.
    pub lost: u64,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.completed + self.retried + self.failed + self.lost
    }
}

/// What one [`EmbeddingWorker::run_once`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// No job was claimable.
    Idle,
    Processed(Transition),
}

pub fn new_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

pub struct EmbeddingWorker<S: ?Sized> {
    id: String,
    queue: EmbeddingQueue<S>,
    provider: Arc<dyn EmbeddingProvider>,
    settings: WorkerSettings,
    stats: WorkerStats,
}

impl<S: Store + ?Sized + 'static> EmbeddingWorker<S> {
    pub fn new(
        queue: EmbeddingQueue<S>,
        provider: Arc<dyn EmbeddingProvider>,
        settings: WorkerSettings,
    ) -> Self {
        Self::with_id(new_worker_id(), queue, provider, settings)
    }

    pub fn with_id(
        id: impl Into<String>,
        queue: EmbeddingQueue<S>,
        provider: Arc<dyn EmbeddingProvider>,
        settings: WorkerSettings,
    ) -> Self {
        let id = id.into();
        Self {
            stats: WorkerStats {
                worker_id: id.clone(),
                ..WorkerStats::default()
            },
            id,
            queue,
            provider,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Claim and process at most one job.
    pub async fn run_once(&mut self) -> Result<Tick> {
        let Some(job) = self.queue.claim(&self.id, Utc::now()).await? else {
            return Ok(Tick::Idle);
        };

        let outcome = if job.embedding_model != self.provider.model_name() {
            Err(ProviderError::Permanent(format!(
                "job was queued for model '{}' but the provider serves '{}'",
                job.embedding_model,
                self.provider.model_name()
            )))
        } else {
            let started = Instant::now();
            match tokio::time::timeout(
                self.settings.provider_timeout,
                self.provider.embed(&job.input_text),
            )
            .await
            {
                Ok(result) => result.map(|v| (v, started.elapsed())),
                Err(_) => Err(ProviderError::Transient(format!(
                    "provider timed out after {}s",
                    self.settings.provider_timeout.as_secs_f64()
                ))),
            }
        };

        let transition = match outcome {
            Ok((vector, elapsed)) => {
                let ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
                self.queue
                    .complete(&job, &self.id, vector, ms, Utc::now())
                    .await?
            }
            Err(err) => self.queue.fail(&job, &self.id, &err, Utc::now()).await?,
        };

        match &transition {
            Transition::Completed { .. } => self.stats.completed += 1,
            Transition::Retrying { .. } => self.stats.retried += 1,
            Transition::Failed => self.stats.failed += 1,
            Transition::Lost => self.stats.lost += 1,
        }
        Ok(Tick::Processed(transition))
    }

    /// Process jobs until none is claimable.
    pub async fn drain(&mut self) -> Result<&WorkerStats> {
        while let Tick::Processed(_) = self.run_once().await? {}
        Ok(&self.stats)
    }

    /// Poll until `shutdown` flips to `true`. Storage errors are logged
    /// and retried after the poll interval; they never end the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        info!(worker = %self.id, model = self.provider.model_name(), "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Tick::Processed(_)) => continue,
                Ok(Tick::Idle) => {}
                Err(e) => error!(worker = %self.id, error = %e, "worker iteration failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(
            worker = %self.id,
            completed = self.stats.completed,
            retried = self.stats.retried,
            failed = self.stats.failed,
            lost = self.stats.lost,
            "worker stopped"
        );
        self.stats
    }
}

/// Reclaim stuck jobs every `interval` until shutdown.
pub async fn run_sweeper<S: Store + ?Sized + 'static>(
    queue: EmbeddingQueue<S>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queue.reclaim_stuck(Utc::now()).await {
                    Ok(report) => debug!(reset = report.reset, failed = report.failed, "sweep finished"),
                    Err(e) => error!(error = %e, "stuck-job sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Run `concurrency` workers and one sweeper until `shutdown` fires.
/// Returns the per-worker counters.
pub async fn run_pool<S: Store + ?Sized + 'static>(
    queue: EmbeddingQueue<S>,
    provider: Arc<dyn EmbeddingProvider>,
    settings: WorkerSettings,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<WorkerStats> {
    let sweeper = tokio::spawn(run_sweeper(
        queue.clone(),
        settings.sweep_interval,
        shutdown.clone(),
    ));

    let mut workers = JoinSet::new();
    for _ in 0..concurrency.max(1) {
        let worker = EmbeddingWorker::new(queue.clone(), provider.clone(), settings.clone());
        workers.spawn(worker.run(shutdown.clone()));
    }

    let mut stats = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(s) => stats.push(s),
            Err(e) => warn!(error = %e, "worker task ended abnormally"),
        }
    }
    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweeper task ended abnormally");
    }
    stats.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    stats
}

fn print_stats(stats: &[WorkerStats]) {
    println!("{:<20} {:>10} {:>8} {:>7} {:>5}", "WORKER", "COMPLETED", "RETRIED", "FAILED", "LOST");
    for s in stats {
        println!(
            "{:<20} {:>10} {:>8} {:>7} {:>5}",
            s.worker_id, s.completed, s.retried, s.failed, s.lost
        );
    }
}

/// `guide worker`: process embedding jobs with the configured provider.
///
/// With `drain`, stuck jobs are reclaimed once, the workers run until the
/// queue has nothing claimable, and the command exits. Otherwise the pool
/// polls until Ctrl-C.
pub async fn run_worker(config: &Config, concurrency: Option<usize>, drain: bool) -> Result<()> {
    let harness = Harness::open(config).await?.with_configured_provider()?;
    let Some(provider) = harness.provider().cloned() else {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    };
    let concurrency = concurrency.unwrap_or(config.worker.concurrency).max(1);
    let settings = WorkerSettings::from_config(config);
    let queue = harness.queue().clone();

    let stats = if drain {
        let report = queue.reclaim_stuck(Utc::now()).await?;
        if report.reset + report.failed > 0 {
            info!(reset = report.reset, failed = report.failed, "reclaimed stuck jobs");
        }
        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            let mut worker = EmbeddingWorker::new(queue.clone(), provider.clone(), settings.clone());
            workers.spawn(async move {
                worker.drain().await?;
                Ok::<_, anyhow::Error>(worker.stats().clone())
            });
        }
        let mut stats = Vec::new();
        while let Some(joined) = workers.join_next().await {
            stats.push(joined??);
        }
        stats.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        stats
    } else {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested, finishing in-flight jobs");
                let _ = tx.send(true);
            }
        });
        println!(
            "Running {} worker(s) with model {} (Ctrl-C to stop)",
            concurrency,
            provider.model_name()
        );
        run_pool(queue, provider, settings, concurrency, rx).await
    };

    print_stats(&stats);
    harness.close().await;
    Ok(())
}
