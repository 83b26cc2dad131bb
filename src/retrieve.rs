//! `guide retrieve`: rank the guidance that applies to an action.

use anyhow::{bail, Result};

use guidance_harness_core::search::{EngineMode, RetrievalOutcome, RetrievalQuery};

use crate::config::Config;
use crate::harness::Harness;

/// Options for one retrieval from the command line.
#[derive(Debug, Clone, Default)]
pub struct RetrieveArgs {
    pub action: String,
    pub code: Option<String>,
    pub context: Option<String>,
    pub caller: Option<String>,
    pub projects: Vec<String>,
    pub limit: Option<usize>,
    pub mode: Option<String>,
    pub explain: bool,
    pub json: bool,
}

pub async fn run_retrieve(config: &Config, args: RetrieveArgs) -> Result<()> {
    if args.action.trim().is_empty() {
        bail!("action must not be empty");
    }
    if args.limit == Some(0) {
        bail!("--limit must be >= 1");
    }
    let mode = args
        .mode
        .as_deref()
        .map(str::parse::<EngineMode>)
        .transpose()?;

    let harness = Harness::open(config).await?;
    let harness = if mode == Some(EngineMode::Keyword) {
        harness
    } else {
        harness.with_available_provider()
    };

    let scope = harness
        .rules()
        .resolve_scope(args.caller.as_deref(), &args.projects)
        .await?;
    let query = RetrievalQuery {
        code: args.code,
        context: args.context,
        max_results: args.limit,
        mode,
        explain: args.explain,
        ..RetrievalQuery::new(args.action, scope)
    };

    let outcome = harness.retrieve(&query).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }

    harness.close().await;
    Ok(())
}

fn print_outcome(outcome: &RetrievalOutcome) {
    if outcome.degraded {
        println!("(embeddings unavailable, keyword results only)");
    }
    if outcome.results.is_empty() {
        println!("No guidance found.");
        return;
    }

    println!(
        "strategy: {}   candidates: {}",
        outcome.strategy, outcome.candidates
    );
    println!();
    for (i, scored) in outcome.results.iter().enumerate() {
        let rule = &scored.rule;
        println!(
            "{}. [{:.2}] {} ({}, {})",
            i + 1,
            scored.score,
            rule.title,
            rule.priority,
            rule.scope
        );
        println!("    slug: {}", rule.slug);
        println!("    guidance: \"{}\"", rule.guidance.replace('\n', " ").trim());
        if let Some(rationale) = &rule.rationale {
            println!("    why: {}", rationale.replace('\n', " ").trim());
        }
        if let Some(explain) = &scored.explain {
            print!(
                "    matched: title {} / guidance {} / keywords {} x{:.1}",
                explain.title_matches, explain.guidance_matches, explain.keyword_matches, explain.boost
            );
            match explain.similarity {
                Some(sim) => println!(", similarity {:.3}", sim),
                None => println!(),
            }
        }
        println!("    id: {}", rule.id);
        println!();
    }
}
