//! Embedding job state machine.
//!
//! ```text
//! Pending ──claim──▶ Processing ──complete──▶ Completed
//!    ▲                  │  │
//!    │ reclaim stuck    │  └──fail (permanent | attempts spent)──▶ Failed
//!    └──────────────────┤
//!                       └──fail (transient)──▶ Retrying ──claim (retry_at ≤ now)──▶ Processing
//! ```
//!
//! The functions here decide transitions. Backends apply them atomically
//! through [`JobQueue`](crate::store::JobQueue).

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ProviderError;
use crate::models::{EmbeddingJob, JobPriority, JobStatus, Rule};
use crate::store::JobFailure;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(300);
pub const DEFAULT_STUCK_TIMEOUT: Duration = Duration::from_secs(600);

/// Settings for [`EmbeddingQueue`](crate::queue::EmbeddingQueue).
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// When false, new rules are stored without enqueueing jobs.
    pub enabled: bool,
    /// Model name recorded on new jobs and used for dedup lookups.
    pub embedding_model: String,
    /// Required vector length `D`.
    pub dims: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Processing jobs older than this are reclaimed by the sweeper.
    pub stuck_timeout: Duration,
}

impl QueueConfig {
    pub fn new(embedding_model: impl Into<String>, dims: usize) -> Self {
        Self {
            enabled: true,
            embedding_model: embedding_model.into(),
            dims,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            stuck_timeout: DEFAULT_STUCK_TIMEOUT,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new("disabled", 0)
        }
    }
}

/// What a complete or fail request did to the job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Job completed. `attached` is false when the rule was deleted or its
    /// text changed while the job ran.
    Completed { attached: bool },
    Retrying { retry_at: DateTime<Utc> },
    Failed,
    /// The job was no longer `Processing` under this worker.
    Lost,
}

/// `min(cap, base · 2^attempts)`.
pub fn backoff_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    2u32.checked_pow(attempts)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |delay| delay.min(cap))
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// Decide the state a claimed job moves to after `err`.
///
/// `job.attempts` already counts the attempt that just failed.
pub fn failure_for(
    job: &EmbeddingJob,
    err: &ProviderError,
    config: &QueueConfig,
    now: DateTime<Utc>,
) -> JobFailure {
    if err.is_retryable() && job.attempts < job.max_attempts {
        let delay = backoff_delay(job.attempts, config.backoff_base, config.backoff_cap);
        JobFailure {
            status: JobStatus::Retrying,
            error_message: err.to_string(),
            retry_at: Some(now + to_chrono(delay)),
        }
    } else {
        JobFailure {
            status: JobStatus::Failed,
            error_message: err.to_string(),
            retry_at: None,
        }
    }
}

impl EmbeddingJob {
    /// A fresh `Pending` job for the rule's current text.
    pub fn pending(
        rule: &Rule,
        priority: JobPriority,
        config: &QueueConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let input_text = rule.embedding_input();
        let content_hash = crate::rules::content_hash(&input_text);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            status: JobStatus::Pending,
            priority,
            input_text,
            content_hash,
            embedding_model: config.embedding_model.clone(),
            attempts: 0,
            max_attempts: config.max_attempts,
            created_at: now,
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_attempts(attempts: u32) -> EmbeddingJob {
        let rule = crate::rules::tests::sample_rule("r1", "use-bcrypt");
        let mut job = EmbeddingJob::pending(
            &rule,
            JobPriority::Normal,
            &QueueConfig::new("test", 4),
            Utc::now(),
        );
        job.status = JobStatus::Processing;
        job.attempts = attempts;
        job
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let base = DEFAULT_BACKOFF_BASE;
        let cap = DEFAULT_BACKOFF_CAP;
        assert_eq!(backoff_delay(0, base, cap), Duration::from_secs(30));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(120));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(240));
        assert_eq!(backoff_delay(4, base, cap), Duration::from_secs(300));
        assert_eq!(backoff_delay(64, base, cap), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let mut last = Duration::ZERO;
        for attempts in 0..40 {
            let d = backoff_delay(attempts, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP);
            assert!(d >= last);
            assert!(d <= DEFAULT_BACKOFF_CAP);
            last = d;
        }
    }

    #[test]
    fn test_transient_failure_retries_until_attempts_spent() {
        let config = QueueConfig::new("test", 4);
        let now = Utc::now();
        let err = ProviderError::Transient("timeout".into());

        let first = failure_for(&job_with_attempts(1), &err, &config, now);
        assert_eq!(first.status, JobStatus::Retrying);
        assert_eq!(first.retry_at, Some(now + chrono::Duration::seconds(60)));

        let last = failure_for(&job_with_attempts(3), &err, &config, now);
        assert_eq!(last.status, JobStatus::Failed);
        assert!(last.retry_at.is_none());
    }

    #[test]
    fn test_permanent_failure_is_immediate() {
        let config = QueueConfig::new("test", 4);
        let failure = failure_for(
            &job_with_attempts(1),
            &ProviderError::Permanent("bad input".into()),
            &config,
            Utc::now(),
        );
        assert_eq!(failure.status, JobStatus::Failed);
        assert!(failure.error_message.contains("bad input"));
    }

    #[test]
    fn test_pending_job_snapshot_of_rule_text() {
        let rule = crate::rules::tests::sample_rule("r1", "use-bcrypt");
        let job = EmbeddingJob::pending(
            &rule,
            JobPriority::High,
            &QueueConfig::new("test", 4),
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.input_text, rule.embedding_input());
        assert_eq!(job.content_hash, rule.content_hash());
    }
}
