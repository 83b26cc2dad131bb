//! Rule authoring, validation, and scope resolution.
//!
//! [`RuleBook`] is the write path for rules and projects. Creating or
//! re-wording a rule hands it to the [`EmbeddingQueue`] so that an
//! embedding is produced in the background; reads never wait on it.
//!
//! # Scoping
//!
//! A caller sees every global rule plus the rules of each project it can
//! access. When a project rule and a global rule share a slug, the project
//! rule shadows the global one:
//!
//! ```text
//! global:  use-bcrypt, prefer-uuids
//! alpha:   use-bcrypt
//! ─────────────────────────────────
//! caller with {alpha}: alpha/use-bcrypt, global/prefer-uuids
//! ```

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::embedding::check_dimensions;
use crate::error::{Error, Result, ValidationError};
use crate::models::{CallerScope, Project, Rule, RuleDraft, RulePatch, RuleScope};
use crate::queue::{EmbeddingQueue, EnqueueOutcome};
use crate::store::{RuleStore, Store, VectorIndex};

pub const MAX_SLUG_LEN: usize = 64;
const MAX_DERIVED_SLUG_LEN: usize = 50;
const GENERIC_SLUGS: &[&str] = &["rule", "guidance", "pattern"];

/// Check `^[a-z0-9]+(-[a-z0-9]+)*$` with at most 64 characters.
pub fn validate_slug(slug: &str) -> std::result::Result<(), ValidationError> {
    let well_formed = !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--");
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::MalformedSlug(slug.to_string()))
    }
}

/// Derive a slug from a title.
///
/// Lowercases, turns every run of non-alphanumerics into one hyphen, and
/// keeps the first 50 characters. Short or generic results get a
/// timestamp suffix so they stay unique.
pub fn slugify(title: &str, now: DateTime<Utc>) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(MAX_DERIVED_SLUG_LEN);
    let slug = slug.trim_end_matches('-');

    let stamp = now.format("%Y%m%d%H%M%S");
    if slug.is_empty() {
        format!("rule-{}", stamp)
    } else if slug.len() < 3 || GENERIC_SLUGS.contains(&slug) {
        format!("{}-{}", slug, stamp)
    } else {
        slug.to_string()
    }
}

/// The embedding input text: non-empty trimmed parts joined by a space.
pub fn embedding_input(title: &str, guidance: &str, rationale: Option<&str>) -> String {
    [Some(title), Some(guidance), rationale]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex SHA-256 of an embedding input.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize_set(values: BTreeSet<String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn normalize_rationale(rationale: Option<String>) -> Option<String> {
    rationale
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
}

fn check_rule_fields(rule: &Rule) -> std::result::Result<(), ValidationError> {
    if rule.title.is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    if rule.guidance.is_empty() {
        return Err(ValidationError::EmptyGuidance);
    }
    if rule.contexts.is_empty() {
        return Err(ValidationError::NoContexts);
    }
    Ok(())
}

/// Apply project-over-global shadowing and sort by slug, then scope.
pub fn apply_shadowing(rules: Vec<Rule>) -> Vec<Rule> {
    let shadowed: HashSet<String> = rules
        .iter()
        .filter(|r| r.scope != RuleScope::Global)
        .map(|r| r.slug.clone())
        .collect();
    let mut visible: Vec<Rule> = rules
        .into_iter()
        .filter(|r| r.scope != RuleScope::Global || !shadowed.contains(&r.slug))
        .collect();
    visible.sort_by(|a, b| a.slug.cmp(&b.slug).then_with(|| a.scope.cmp(&b.scope)));
    visible
}

/// Write a vector onto a rule and into the index.
///
/// With `expected_hash` set, the vector is only written while the rule's
/// text still hashes to it. Returns `false` without touching the index if
/// the rule is gone or was re-worded.
pub async fn attach_embedding<S>(
    store: &S,
    rule_id: &str,
    vector: &[f32],
    expected_hash: Option<&str>,
) -> anyhow::Result<bool>
where
    S: RuleStore + VectorIndex + ?Sized,
{
    if !store
        .set_rule_embedding(rule_id, Some(vector), expected_hash)
        .await?
    {
        return Ok(false);
    }
    store.upsert_vector(rule_id, vector).await?;
    Ok(true)
}

/// A stored rule together with what happened to its embedding.
#[derive(Debug, Clone)]
pub struct StoredRule {
    pub rule: Rule,
    pub embedding: EnqueueOutcome,
}

/// Rule and project write path.
pub struct RuleBook<S: ?Sized> {
    store: Arc<S>,
    queue: EmbeddingQueue<S>,
}

impl<S: Store + ?Sized> RuleBook<S> {
    pub fn new(store: Arc<S>, queue: EmbeddingQueue<S>) -> Self {
        Self { store, queue }
    }

    pub fn queue(&self) -> &EmbeddingQueue<S> {
        &self.queue
    }

    /// Validate and store a new rule, then request its embedding.
    pub async fn put_rule(&self, draft: RuleDraft) -> Result<StoredRule> {
        let now = Utc::now();
        let slug = match draft.slug.as_deref().map(str::trim) {
            Some(s) => {
                validate_slug(s)?;
                s.to_string()
            }
            None => slugify(&draft.title, now),
        };

        let scope = RuleScope::from_project(draft.project_id);
        if let Some(project_id) = scope.project_id() {
            if self.store.get_project(project_id).await?.is_none() {
                return Err(Error::ProjectNotFound(project_id.to_string()));
            }
        }

        let rule = Rule {
            id: uuid::Uuid::new_v4().to_string(),
            slug,
            scope,
            title: draft.title.trim().to_string(),
            guidance: draft.guidance.trim().to_string(),
            rationale: normalize_rationale(draft.rationale),
            category: draft.category,
            priority: draft.priority,
            contexts: normalize_set(draft.contexts),
            tech_stacks: normalize_set(draft.tech_stacks),
            keywords: normalize_set(draft.keywords),
            embedding: draft.embedding,
            created_at: now,
            updated_at: now,
        };
        check_rule_fields(&rule)?;
        if let Some(vector) = &rule.embedding {
            check_dimensions(vector, self.queue.config().dims)?;
        }

        if self.store.find_rule(&rule.scope, &rule.slug).await?.is_some() {
            return Err(Error::DuplicateSlug {
                slug: rule.slug,
                scope: rule.scope.to_string(),
            });
        }

        self.store
            .insert_rule(&rule)
            .await
            .map_err(Error::from_store)?;
        info!(rule = %rule.slug, scope = %rule.scope, "stored rule");

        let embedding = match &rule.embedding {
            Some(vector) => {
                self.store.upsert_vector(&rule.id, vector).await?;
                EnqueueOutcome::Precomputed
            }
            None => self.queue.enqueue_if_needed(&rule, None, now).await?,
        };

        let rule = self.store.get_rule(&rule.id).await?.unwrap_or(rule);
        Ok(StoredRule { rule, embedding })
    }

    /// Apply a patch. Re-wording a rule drops its embedding and requests a
    /// new one; open jobs for the old wording are superseded.
    pub async fn update_rule(&self, id: &str, patch: RulePatch) -> Result<StoredRule> {
        let now = Utc::now();
        let mut rule = self
            .store
            .get_rule(id)
            .await?
            .ok_or_else(|| Error::RuleNotFound(id.to_string()))?;
        let old_hash = rule.content_hash();

        if let Some(title) = patch.title {
            rule.title = title.trim().to_string();
        }
        if let Some(guidance) = patch.guidance {
            rule.guidance = guidance.trim().to_string();
        }
        if let Some(rationale) = patch.rationale {
            rule.rationale = normalize_rationale(rationale);
        }
        if let Some(category) = patch.category {
            rule.category = category;
        }
        if let Some(priority) = patch.priority {
            rule.priority = priority;
        }
        if let Some(contexts) = patch.contexts {
            rule.contexts = normalize_set(contexts);
        }
        if let Some(tech_stacks) = patch.tech_stacks {
            rule.tech_stacks = normalize_set(tech_stacks);
        }
        if let Some(keywords) = patch.keywords {
            rule.keywords = normalize_set(keywords);
        }
        check_rule_fields(&rule)?;

        let new_hash = rule.content_hash();
        let reworded = new_hash != old_hash;
        if reworded {
            rule.embedding = None;
        }
        rule.updated_at = now;

        if !self.store.replace_rule(&rule).await? {
            return Err(Error::RuleNotFound(id.to_string()));
        }

        if reworded {
            self.store.remove_vector(&rule.id).await?;
            let superseded = self
                .store
                .supersede_open_jobs(&rule.id, &new_hash, now)
                .await?;
            debug!(rule = %rule.slug, superseded, "rule text changed");
        }

        let embedding = if rule.embedding.is_some() {
            EnqueueOutcome::AlreadyEmbedded
        } else {
            self.queue.enqueue_if_needed(&rule, None, now).await?
        };

        let rule = self.store.get_rule(&rule.id).await?.unwrap_or(rule);
        Ok(StoredRule { rule, embedding })
    }

    /// Rules visible to `scope`, with shadowing applied.
    pub async fn visible_rules(&self, scope: &CallerScope) -> Result<Vec<Rule>> {
        Ok(apply_shadowing(self.store.rules_in_scope(scope).await?))
    }

    pub async fn get_rule(&self, id: &str) -> Result<Rule> {
        self.store
            .get_rule(id)
            .await?
            .ok_or_else(|| Error::RuleNotFound(id.to_string()))
    }

    pub async fn find_rule(&self, scope: &RuleScope, slug: &str) -> Result<Rule> {
        self.store
            .find_rule(scope, slug)
            .await?
            .ok_or_else(|| Error::RuleNotFound(format!("{}/{}", scope, slug)))
    }

    pub async fn attach_embedding(&self, rule_id: &str, vector: &[f32]) -> Result<bool> {
        check_dimensions(vector, self.queue.config().dims)?;
        Ok(attach_embedding(self.store.as_ref(), rule_id, vector, None).await?)
    }

    /// Create a project. Project ids follow the slug format.
    pub async fn create_project(&self, id: &str, name: Option<&str>) -> Result<Project> {
        validate_slug(id)?;
        let project = Project {
            id: id.to_string(),
            name: name.unwrap_or(id).to_string(),
            created_at: Utc::now(),
        };
        self.store.insert_project(&project).await?;
        info!(project = %project.id, "created project");
        Ok(project)
    }

    pub async fn grant_access(&self, project_id: &str, caller: &str) -> Result<()> {
        if self.store.get_project(project_id).await?.is_none() {
            return Err(Error::ProjectNotFound(project_id.to_string()));
        }
        self.store.add_project_member(project_id, caller).await?;
        Ok(())
    }

    /// Build a scope from a caller's memberships plus explicitly named projects.
    pub async fn resolve_scope(
        &self,
        caller: Option<&str>,
        projects: &[String],
    ) -> Result<CallerScope> {
        let mut scope = CallerScope::for_projects(projects.iter().cloned());
        if let Some(caller) = caller {
            scope.caller = Some(caller.to_string());
            scope
                .accessible_projects
                .extend(self.store.projects_for_caller(caller).await?);
        }
        Ok(scope)
    }
}
