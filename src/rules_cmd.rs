//! `guide project …` and `guide rule …`: authoring commands.

use anyhow::Result;
use std::collections::BTreeSet;

use guidance_harness_core::models::{Category, Priority, Rule, RuleDraft, RulePatch, RuleScope};
use guidance_harness_core::queue::EnqueueOutcome;
use guidance_harness_core::rules::StoredRule;
use guidance_harness_core::store::RuleStore;

use crate::config::Config;
use crate::harness::Harness;

/// Rule fields as given on the command line. Set-valued fields accept
/// repeated flags and comma-separated lists.
#[derive(Debug, Clone, Default)]
pub struct RuleFields {
    pub title: Option<String>,
    pub guidance: Option<String>,
    pub rationale: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub contexts: Vec<String>,
    pub tech_stacks: Vec<String>,
    pub keywords: Vec<String>,
}

fn split_list(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty_list(values: &[String]) -> Option<BTreeSet<String>> {
    (!values.is_empty()).then(|| split_list(values))
}

pub async fn run_project_create(config: &Config, id: &str, name: Option<&str>) -> Result<()> {
    let harness = Harness::open(config).await?;
    let project = harness.rules().create_project(id, name).await?;
    println!("Created project {} ({})", project.id, project.name);
    harness.close().await;
    Ok(())
}

pub async fn run_project_grant(config: &Config, project_id: &str, caller: &str) -> Result<()> {
    let harness = Harness::open(config).await?;
    harness.rules().grant_access(project_id, caller).await?;
    println!("Granted {} access to project {}", caller, project_id);
    harness.close().await;
    Ok(())
}

pub async fn run_project_list(config: &Config) -> Result<()> {
    let harness = Harness::open(config).await?;
    let projects = harness.store().list_projects().await?;
    if projects.is_empty() {
        println!("No projects.");
    }
    for project in projects {
        println!(
            "{:<24} {:<32} {}",
            project.id,
            project.name,
            project.created_at.format("%Y-%m-%d")
        );
    }
    harness.close().await;
    Ok(())
}

pub async fn run_rule_add(
    config: &Config,
    slug: Option<String>,
    project: Option<String>,
    fields: RuleFields,
) -> Result<()> {
    let draft = RuleDraft {
        slug,
        project_id: project,
        title: fields.title.unwrap_or_default(),
        guidance: fields.guidance.unwrap_or_default(),
        rationale: fields.rationale,
        category: fields
            .category
            .as_deref()
            .map(str::parse::<Category>)
            .transpose()?
            .unwrap_or_default(),
        priority: fields
            .priority
            .as_deref()
            .map(str::parse::<Priority>)
            .transpose()?
            .unwrap_or_default(),
        contexts: split_list(&fields.contexts),
        tech_stacks: split_list(&fields.tech_stacks),
        keywords: split_list(&fields.keywords),
        embedding: None,
    };

    let harness = Harness::open(config).await?;
    let stored = harness.rules().put_rule(draft).await?;
    print_stored("Stored", &stored);
    harness.close().await;
    Ok(())
}

pub async fn run_rule_edit(config: &Config, id: &str, fields: RuleFields) -> Result<()> {
    let patch = RulePatch {
        title: fields.title,
        guidance: fields.guidance,
        rationale: fields.rationale.map(Some),
        category: fields
            .category
            .as_deref()
            .map(str::parse::<Category>)
            .transpose()?,
        priority: fields
            .priority
            .as_deref()
            .map(str::parse::<Priority>)
            .transpose()?,
        contexts: non_empty_list(&fields.contexts),
        tech_stacks: non_empty_list(&fields.tech_stacks),
        keywords: non_empty_list(&fields.keywords),
    };
    if patch.is_empty() {
        anyhow::bail!("nothing to change: pass at least one field flag");
    }

    let harness = Harness::open(config).await?;
    let stored = harness.rules().update_rule(id, patch).await?;
    print_stored("Updated", &stored);
    harness.close().await;
    Ok(())
}

pub async fn run_rule_show(config: &Config, id: &str, json: bool) -> Result<()> {
    let harness = Harness::open(config).await?;
    let rule = harness.rules().get_rule(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rule)?);
    } else {
        print_rule(&rule);
    }
    harness.close().await;
    Ok(())
}

/// List the rules a caller sees, after shadowing.
pub async fn run_rule_list(
    config: &Config,
    caller: Option<&str>,
    projects: &[String],
    json: bool,
) -> Result<()> {
    let harness = Harness::open(config).await?;
    let scope = harness.rules().resolve_scope(caller, projects).await?;
    let rules = harness.rules().visible_rules(&scope).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
    } else if rules.is_empty() {
        println!("No rules.");
    } else {
        for rule in &rules {
            println!(
                "{:<40} {:<16} {:<9} {:<14} {}",
                rule.slug,
                rule.scope.to_string(),
                rule.priority.as_str(),
                rule.category.as_str(),
                if rule.has_embedding() { "embedded" } else { "-" }
            );
        }
    }
    harness.close().await;
    Ok(())
}

fn describe_outcome(outcome: &EnqueueOutcome) -> String {
    match outcome {
        EnqueueOutcome::Enqueued { job_id } => format!("queued (job {})", job_id),
        EnqueueOutcome::Reused { job_id } => format!("reused from job {}", job_id),
        EnqueueOutcome::AlreadyQueued { job_id } => format!("already queued (job {})", job_id),
        EnqueueOutcome::Precomputed => "precomputed".to_string(),
        EnqueueOutcome::AlreadyEmbedded => "up to date".to_string(),
        EnqueueOutcome::Disabled => "disabled".to_string(),
    }
}

fn print_stored(verb: &str, stored: &StoredRule) {
    println!("{} rule {}", verb, stored.rule.slug);
    println!("  id:        {}", stored.rule.id);
    println!("  scope:     {}", stored.rule.scope);
    println!("  embedding: {}", describe_outcome(&stored.embedding));
}

fn join(set: &BTreeSet<String>) -> String {
    if set.is_empty() {
        "-".to_string()
    } else {
        set.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

fn print_rule(rule: &Rule) {
    println!("--- Rule ---");
    println!("id:          {}", rule.id);
    println!("slug:        {}", rule.slug);
    match &rule.scope {
        RuleScope::Global => println!("scope:       global"),
        RuleScope::Project(p) => println!("scope:       project {}", p),
    }
    println!("category:    {}", rule.category);
    println!("priority:    {}", rule.priority);
    println!("contexts:    {}", join(&rule.contexts));
    println!("tech:        {}", join(&rule.tech_stacks));
    println!("keywords:    {}", join(&rule.keywords));
    println!(
        "embedding:   {}",
        rule.embedding
            .as_ref()
            .map(|v| format!("{} dims", v.len()))
            .unwrap_or_else(|| "none".to_string())
    );
    println!("created_at:  {}", rule.created_at.to_rfc3339());
    println!("updated_at:  {}", rule.updated_at.to_rfc3339());
    println!();
    println!("--- {} ---", rule.title);
    println!("{}", rule.guidance);
    if let Some(rationale) = &rule.rationale {
        println!();
        println!("Why: {}", rationale);
    }
}
