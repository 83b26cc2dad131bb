//! Core data models used throughout Guidance Harness.
//!
//! These types represent the rules, projects, caller scopes and embedding
//! jobs that flow through the authoring, embedding and retrieval pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Where a rule applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Global,
    Project(String),
}

impl RuleScope {
    pub fn from_project(project: Option<String>) -> Self {
        match project {
            Some(id) => RuleScope::Project(id),
            None => RuleScope::Global,
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            RuleScope::Global => None,
            RuleScope::Project(id) => Some(id),
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleScope::Global => f.write_str("global"),
            RuleScope::Project(id) => write!(f, "project:{}", id),
        }
    }
}

/// Rule priority. Ordered `low < medium < high < critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Multiplier applied to keyword scores.
    pub fn boost(&self) -> f64 {
        match self {
            Priority::Critical => 1.5,
            Priority::High => 1.2,
            Priority::Medium | Priority::Low => 1.0,
        }
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(ValidationError::UnknownPriority(s.to_string())),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject area of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    #[default]
    Architecture,
    Security,
    Performance,
    Testing,
    AiMl,
    Ux,
    Devops,
    Data,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Architecture,
        Category::Security,
        Category::Performance,
        Category::Testing,
        Category::AiMl,
        Category::Ux,
        Category::Devops,
        Category::Data,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Architecture => "architecture",
            Category::Security => "security",
            Category::Performance => "performance",
            Category::Testing => "testing",
            Category::AiMl => "ai-ml",
            Category::Ux => "ux",
            Category::Devops => "devops",
            Category::Data => "data",
        }
    }
}

impl FromStr for Category {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| ValidationError::UnknownCategory(s.to_string()))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of team guidance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub slug: String,
    pub scope: RuleScope,
    pub title: String,
    pub guidance: String,
    pub rationale: Option<String>,
    pub category: Category,
    pub priority: Priority,
    pub contexts: BTreeSet<String>,
    pub tech_stacks: BTreeSet<String>,
    pub keywords: BTreeSet<String>,
    #[serde(skip_serializing, default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Text fed to the embedding provider for this rule.
    pub fn embedding_input(&self) -> String {
        crate::rules::embedding_input(&self.title, &self.guidance, self.rationale.as_deref())
    }

    pub fn content_hash(&self) -> String {
        crate::rules::content_hash(&self.embedding_input())
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }
}

/// Input to [`RuleBook::put_rule`](crate::rules::RuleBook::put_rule).
///
/// When `slug` is `None` one is derived from the title.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDraft {
    pub slug: Option<String>,
    pub project_id: Option<String>,
    pub title: String,
    pub guidance: String,
    pub rationale: Option<String>,
    pub category: Category,
    pub priority: Priority,
    pub contexts: BTreeSet<String>,
    pub tech_stacks: BTreeSet<String>,
    pub keywords: BTreeSet<String>,
    /// A precomputed embedding. Skips the job queue when present.
    pub embedding: Option<Vec<f32>>,
}

/// Field changes for [`RuleBook::update_rule`](crate::rules::RuleBook::update_rule).
/// `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub title: Option<String>,
    pub guidance: Option<String>,
    /// `Some(None)` clears the rationale.
    pub rationale: Option<Option<String>>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub contexts: Option<BTreeSet<String>>,
    pub tech_stacks: Option<BTreeSet<String>>,
    pub keywords: Option<BTreeSet<String>>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.guidance.is_none()
            && self.rationale.is_none()
            && self.category.is_none()
            && self.priority.is_none()
            && self.contexts.is_none()
            && self.tech_stacks.is_none()
            && self.keywords.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// The set of projects a caller may read rules from.
///
/// Global rules are always visible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerScope {
    pub caller: Option<String>,
    pub accessible_projects: BTreeSet<String>,
}

impl CallerScope {
    pub fn global_only() -> Self {
        Self::default()
    }

    pub fn for_projects<I, P>(projects: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            caller: None,
            accessible_projects: projects.into_iter().map(Into::into).collect(),
        }
    }

    pub fn can_see(&self, scope: &RuleScope) -> bool {
        match scope {
            RuleScope::Global => true,
            RuleScope::Project(id) => self.accessible_projects.contains(id),
        }
    }
}

/// Lifecycle state of an [`EmbeddingJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown job status '{}'", s))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim order of an [`EmbeddingJob`]. Ordered `low < normal < high < urgent`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Low,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Urgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Urgent => "urgent",
        }
    }

    /// Numeric rank used by SQL backends for `ORDER BY`.
    pub fn rank(&self) -> i64 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i64) -> anyhow::Result<Self> {
        JobPriority::ALL
            .into_iter()
            .find(|p| p.rank() == rank)
            .ok_or_else(|| anyhow::anyhow!("unknown job priority rank {}", rank))
    }
}

impl From<Priority> for JobPriority {
    fn from(p: Priority) -> Self {
        match p {
            Priority::Critical => JobPriority::Urgent,
            Priority::High => JobPriority::High,
            Priority::Medium | Priority::Low => JobPriority::Normal,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks generation of one embedding for one rule's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub id: String,
    pub rule_id: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub input_text: String,
    pub content_hash: String,
    pub embedding_model: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_vector: Option<Vec<f32>>,
    pub result_dimensions: Option<usize>,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub processing_time_ms: Option<i64>,
}

/// Job counts for one `(status, priority)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueBucket {
    pub status: JobStatus,
    pub priority: JobPriority,
    pub count: u64,
    pub avg_processing_ms: Option<f64>,
}

/// Terminal outcomes recorded against one worker id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerTally {
    pub worker_id: String,
    pub completed: u64,
    pub failed: u64,
}

/// Snapshot of the job queue, as reported by `guide jobs stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub buckets: Vec<QueueBucket>,
    pub workers: Vec<WorkerTally>,
}

impl QueueStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.buckets
            .iter()
            .filter(|b| b.status == status)
            .map(|b| b.count)
            .sum()
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.count).sum()
    }

    /// Sort buckets by status then priority descending, workers by id.
    pub fn sorted(mut self) -> Self {
        self.buckets
            .sort_by_key(|b| (b.status, std::cmp::Reverse(b.priority)));
        self.workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        self
    }
}
