//! Retrieval engine with keyword, vector, and auto (merged) modes.
//!
//! The engine operates entirely through the [`RuleStore`] and
//! [`VectorIndex`] traits. The calling application supplies the embedding
//! provider, if any, and a [`RetrievalConfig`].
//!
//! # Algorithm
//!
//! 1. Load rules visible to the caller and apply shadowing.
//! 2. Drop rules that do not list the requested context (before scoring).
//! 3. Embed the query text. On provider failure, mark the outcome
//!    `degraded` and continue with keyword scoring only.
//! 4. `auto` mode: vector hits at `vector_threshold` win; otherwise keyword
//!    hits; otherwise vector hits widened to `fallback_threshold`.
//! 5. Sort by score (desc), `created_at` (desc), id (asc). Truncate.
//!
//! # Keyword score
//!
//! ```text
//! (3 × |title ∩ q| + 2 × |guidance ∩ q| + |keywords ∩ q|) × boost(priority)
//! ```
//!
//! with boost 1.5 for critical, 1.2 for high, 1.0 otherwise.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::{check_dimensions, EmbeddingProvider};
use crate::error::{Result, ValidationError};
use crate::models::{CallerScope, Rule};
use crate::rules::apply_shadowing;
use crate::store::{RuleStore, VectorIndex};

pub const DEFAULT_MAX_RESULTS: usize = 10;
pub const DEFAULT_VECTOR_THRESHOLD: f32 = 0.7;
pub const DEFAULT_FALLBACK_THRESHOLD: f32 = 0.5;

const STOPWORDS: &[&str] = &[
    "an", "and", "are", "as", "at", "be", "but", "by", "can", "do", "does", "for", "from", "how",
    "if", "in", "into", "is", "it", "its", "me", "my", "of", "on", "or", "our", "should", "so",
    "that", "the", "their", "then", "there", "these", "this", "to", "was", "we", "what", "when",
    "where", "which", "who", "why", "will", "with", "would", "you", "your",
];

/// Which scoring strategies a retrieval may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    #[default]
    Auto,
    Keyword,
    Vector,
}

impl FromStr for EngineMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(EngineMode::Auto),
            "keyword" => Ok(EngineMode::Keyword),
            "vector" => Ok(EngineMode::Vector),
            _ => Err(ValidationError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineMode::Auto => "auto",
            EngineMode::Keyword => "keyword",
            EngineMode::Vector => "vector",
        })
    }
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    pub mode: EngineMode,
    pub max_results: usize,
    /// Minimum cosine similarity for a vector hit.
    pub vector_threshold: f32,
    /// Widened minimum used when nothing else matched.
    pub fallback_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::Auto,
            max_results: DEFAULT_MAX_RESULTS,
            vector_threshold: DEFAULT_VECTOR_THRESHOLD,
            fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
        }
    }
}

/// A single retrieval request.
#[derive(Debug, Clone, Default)]
pub struct RetrievalQuery {
    /// What the caller is trying to do, in natural language.
    pub action: String,
    /// Optional code under discussion. Joined to `action` for scoring.
    pub code: Option<String>,
    /// Only rules listing this context are considered.
    pub context: Option<String>,
    pub scope: CallerScope,
    pub max_results: Option<usize>,
    pub mode: Option<EngineMode>,
    /// Populate [`ScoreExplanation`] on each result.
    pub explain: bool,
}

impl RetrievalQuery {
    pub fn new(action: impl Into<String>, scope: CallerScope) -> Self {
        Self {
            action: action.into(),
            scope,
            ..Default::default()
        }
    }

    /// The text that is tokenized and embedded.
    pub fn text(&self) -> String {
        match self.code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => format!("{}\n{}", self.action.trim(), code),
            _ => self.action.trim().to_string(),
        }
    }
}

/// Which signal produced the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Vector,
    Keyword,
    /// Vector hits below the main threshold but above the fallback.
    VectorWidened,
    /// Nothing matched.
    None,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Vector => "vector",
            Strategy::Keyword => "keyword",
            Strategy::VectorWidened => "vector_widened",
            Strategy::None => "none",
        })
    }
}

/// Per-field overlap counts behind a keyword score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreExplanation {
    pub title_matches: usize,
    pub guidance_matches: usize,
    pub keyword_matches: usize,
    pub boost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredRule {
    pub rule: Rule,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreExplanation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    pub results: Vec<ScoredRule>,
    pub strategy: Strategy,
    /// The query could not be embedded; results are keyword-only.
    pub degraded: bool,
    /// Rules left after scope and context filtering.
    pub candidates: usize,
}

impl RetrievalOutcome {
    fn empty(candidates: usize, degraded: bool) -> Self {
        Self {
            results: Vec::new(),
            strategy: Strategy::None,
            degraded,
            candidates,
        }
    }
}

/// Fold a lowercase word to a crude stem so that plural, past and
/// progressive forms meet: `passwords → password`, `hashing → hash`,
/// `stored → stor`, `store → stor`.
fn stem(word: &str) -> String {
    let mut w = word.to_string();

    if w.len() > 4 && w.ends_with("ies") {
        w.truncate(w.len() - 3);
        w.push('y');
    } else if w.ends_with("es")
        && ["sh", "ch", "x", "z"]
            .iter()
            .any(|end| w[..w.len() - 2].ends_with(end))
        && w.len() - 2 >= 3
    {
        w.truncate(w.len() - 2);
    } else if w.len() > 3
        && w.ends_with('s')
        && !w.ends_with("ss")
        && !w.ends_with("us")
        && !w.ends_with("is")
    {
        w.truncate(w.len() - 1);
    }

    if w.ends_with("ing") && w.len() - 3 >= 3 {
        w.truncate(w.len() - 3);
    } else if w.ends_with("ed") && w.len() - 2 >= 3 {
        w.truncate(w.len() - 2);
    }

    if w.ends_with('e') && w.len() - 1 >= 3 {
        w.truncate(w.len() - 1);
    }
    w
}

/// Lowercase token set of `text`.
///
/// Splits on anything that is not ASCII alphanumeric, drops stopwords and
/// single characters, and folds simple English suffixes.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(t))
        .map(stem)
        .filter(|t| t.len() > 1)
        .collect()
}

fn keyword_tokens(rule: &Rule) -> BTreeSet<String> {
    rule.keywords.iter().flat_map(|k| tokenize(k)).collect()
}

/// Keyword score of one rule against a query token set.
pub fn keyword_score(rule: &Rule, query: &BTreeSet<String>) -> (f64, ScoreExplanation) {
    let title_matches = tokenize(&rule.title).intersection(query).count();
    let guidance_matches = tokenize(&rule.guidance).intersection(query).count();
    let keyword_matches = keyword_tokens(rule).intersection(query).count();
    let boost = rule.priority.boost();
    let raw = 3 * title_matches + 2 * guidance_matches + keyword_matches;
    (
        raw as f64 * boost,
        ScoreExplanation {
            title_matches,
            guidance_matches,
            keyword_matches,
            boost,
            similarity: None,
        },
    )
}

/// Score desc, `created_at` desc, id asc.
fn rank(results: &mut [ScoredRule]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.rule.created_at.cmp(&a.rule.created_at))
            .then_with(|| a.rule.id.cmp(&b.rule.id))
    });
}

/// Keyword-rank candidates, dropping zero scores.
pub fn rank_by_keywords(
    candidates: &[Rule],
    query: &BTreeSet<String>,
    limit: usize,
    explain: bool,
) -> Vec<ScoredRule> {
    if query.is_empty() {
        return Vec::new();
    }
    let mut results: Vec<ScoredRule> = candidates
        .iter()
        .filter_map(|rule| {
            let (score, why) = keyword_score(rule, query);
            (score > 0.0).then(|| ScoredRule {
                rule: rule.clone(),
                score,
                explain: explain.then_some(why),
            })
        })
        .collect();
    rank(&mut results);
    results.truncate(limit);
    results
}

/// Ranks visible rules for a query.
#[derive(Debug, Clone, Default)]
pub struct RetrievalEngine {
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Run one retrieval. Embedding failures degrade to keyword scoring
    /// and never surface as errors; storage failures do.
    pub async fn retrieve<S>(
        &self,
        store: &S,
        provider: Option<&dyn EmbeddingProvider>,
        query: &RetrievalQuery,
    ) -> Result<RetrievalOutcome>
    where
        S: RuleStore + VectorIndex + ?Sized,
    {
        let limit = query.max_results.unwrap_or(self.config.max_results);
        let mode = query.mode.unwrap_or(self.config.mode);

        let context = query
            .context
            .as_deref()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty());
        let candidates: Vec<Rule> = apply_shadowing(store.rules_in_scope(&query.scope).await?)
            .into_iter()
            .filter(|r| context.as_ref().map_or(true, |c| r.contexts.contains(c)))
            .collect();

        let text = query.text();
        if candidates.is_empty() || text.is_empty() || limit == 0 {
            return Ok(RetrievalOutcome::empty(candidates.len(), false));
        }

        let mut degraded = false;
        let query_vec = match (mode, provider) {
            (EngineMode::Keyword, _) => None,
            (EngineMode::Auto, None) => None,
            (EngineMode::Vector, None) => {
                warn!("vector retrieval requested but no embedding provider is configured");
                degraded = true;
                None
            }
            (_, Some(provider)) => {
                match provider
                    .embed(&text)
                    .await
                    .and_then(|v| check_dimensions(&v, provider.dims()).map(|_| v))
                {
                    Ok(v) => Some(v),
                    Err(e) => {
                        warn!(error = %e, "query embedding failed, falling back to keyword retrieval");
                        degraded = true;
                        None
                    }
                }
            }
        };

        let tokens = tokenize(&text);

        let Some(query_vec) = query_vec else {
            let results = rank_by_keywords(&candidates, &tokens, limit, query.explain);
            let strategy = if results.is_empty() {
                Strategy::None
            } else {
                Strategy::Keyword
            };
            debug!(%strategy, degraded, hits = results.len(), "retrieval finished");
            return Ok(RetrievalOutcome {
                results,
                strategy,
                degraded,
                candidates: candidates.len(),
            });
        };

        let by_id: HashMap<&str, &Rule> = candidates.iter().map(|r| (r.id.as_str(), r)).collect();
        let ids: HashSet<String> = candidates
            .iter()
            .filter(|r| r.has_embedding())
            .map(|r| r.id.clone())
            .collect();
        let floor = self.config.fallback_threshold.min(self.config.vector_threshold);
        let hits = store
            .search_vectors(&query_vec, &ids, floor, ids.len())
            .await?;

        let vector_results = |min: f32| -> Vec<ScoredRule> {
            let mut results: Vec<ScoredRule> = hits
                .iter()
                .filter(|h| h.similarity >= min)
                .filter_map(|h| by_id.get(h.rule_id.as_str()).map(|rule| (h, *rule)))
                .map(|(h, rule)| ScoredRule {
                    rule: rule.clone(),
                    score: f64::from(h.similarity),
                    explain: query.explain.then(|| ScoreExplanation {
                        similarity: Some(h.similarity),
                        ..keyword_score(rule, &tokens).1
                    }),
                })
                .collect();
            rank(&mut results);
            results.truncate(limit);
            results
        };

        let (results, strategy) = {
            let strong = vector_results(self.config.vector_threshold);
            if !strong.is_empty() {
                (strong, Strategy::Vector)
            } else {
                let keyword = if mode == EngineMode::Auto {
                    rank_by_keywords(&candidates, &tokens, limit, query.explain)
                } else {
                    Vec::new()
                };
                if !keyword.is_empty() {
                    (keyword, Strategy::Keyword)
                } else {
                    let widened = vector_results(self.config.fallback_threshold);
                    if widened.is_empty() {
                        (widened, Strategy::None)
                    } else {
                        (widened, Strategy::VectorWidened)
                    }
                }
            }
        };

        debug!(%strategy, hits = results.len(), candidates = candidates.len(), "retrieval finished");
        Ok(RetrievalOutcome {
            results,
            strategy,
            degraded,
            candidates: candidates.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::models::{Priority, RuleScope};
    use crate::rules::tests::sample_rule;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    struct FixedProvider(std::result::Result<Vec<f32>, ProviderError>);

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            self.0.clone()
        }
    }

    fn rule(id: &str, slug: &str, title: &str, guidance: &str) -> Rule {
        let mut r = sample_rule(id, slug);
        r.title = title.to_string();
        r.guidance = guidance.to_string();
        r
    }

    async fn seed(store: &InMemoryStore, rule: &Rule) {
        store.insert_rule(rule).await.unwrap();
        if let Some(v) = &rule.embedding {
            store.upsert_vector(&rule.id, v).await.unwrap();
        }
    }

    #[test]
    fn test_tokenize_folds_and_filters() {
        let tokens = tokenize("How should I store user passwords? Hashing, hashes & hashed!");
        let expected: BTreeSet<String> = ["stor", "user", "password", "hash"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(tokens, expected);
        assert_eq!(tokenize("databases database"), tokenize("database"));
        assert_eq!(tokenize("queries"), tokenize("query"));
        assert!(tokenize("a I x").is_empty());
    }

    #[test]
    fn test_keyword_score_weights_and_boost() {
        let mut r = rule("r1", "bcrypt", "Use bcrypt", "Hash passwords with bcrypt");
        r.keywords = ["password".to_string()].into();
        let q = tokenize("bcrypt password");
        // title: bcrypt (3), guidance: bcrypt + password (4), keywords: password (1)
        assert_eq!(keyword_score(&r, &q).0, 8.0);

        r.priority = Priority::Critical;
        assert_eq!(keyword_score(&r, &q).0, 12.0);
        r.priority = Priority::High;
        assert!((keyword_score(&r, &q).0 - 9.6).abs() < 1e-9);
    }

    #[test]
    fn test_keyword_ties_break_by_created_at_then_id() {
        let now = Utc::now();
        let mut older = rule("b", "older", "cache layer", "x");
        older.created_at = now - Duration::seconds(10);
        let mut newer = rule("c", "newer", "cache layer", "x");
        newer.created_at = now;
        let mut twin = rule("a", "twin", "cache layer", "x");
        twin.created_at = now;

        let q = tokenize("cache");
        let ranked = rank_by_keywords(&[older, newer, twin], &q, 10, false);
        let ids: Vec<&str> = ranked.iter().map(|s| s.rule.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_context_filter_applies_before_scoring() {
        let store = InMemoryStore::new();
        let mut frontend = rule("r1", "fe-cache", "cache assets", "cache everything");
        frontend.contexts = ["frontend".to_string()].into();
        let backend = rule("r2", "be-cache", "cache", "cache");
        seed(&store, &frontend).await;
        seed(&store, &backend).await;

        let engine = RetrievalEngine::default();
        let mut q = RetrievalQuery::new("cache", CallerScope::global_only());
        q.context = Some("Security".into());
        let out = engine.retrieve(&store, None, &q).await.unwrap();
        assert_eq!(out.candidates, 1);
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].rule.id, "r2");
    }

    #[tokio::test]
    async fn test_project_rules_hidden_and_shadowing() {
        let store = InMemoryStore::new();
        let global = rule("g", "use-bcrypt", "bcrypt global", "bcrypt");
        let mut local = rule("p", "use-bcrypt", "bcrypt alpha", "bcrypt");
        local.scope = RuleScope::Project("alpha".into());
        seed(&store, &global).await;
        seed(&store, &local).await;

        let engine = RetrievalEngine::default();
        let outsider = engine
            .retrieve(&store, None, &RetrievalQuery::new("bcrypt", CallerScope::global_only()))
            .await
            .unwrap();
        assert_eq!(outsider.results.len(), 1);
        assert_eq!(outsider.results[0].rule.id, "g");

        let member = engine
            .retrieve(
                &store,
                None,
                &RetrievalQuery::new("bcrypt", CallerScope::for_projects(["alpha"])),
            )
            .await
            .unwrap();
        assert_eq!(member.results.len(), 1);
        assert_eq!(member.results[0].rule.id, "p");
    }

    #[tokio::test]
    async fn test_auto_prefers_strong_vector_hits() {
        let store = InMemoryStore::new();
        let mut near = rule("near", "near", "unrelated words", "nothing");
        near.embedding = Some(vec![1.0, 0.0]);
        let far = rule("kw", "kw", "password", "password");
        seed(&store, &near).await;
        seed(&store, &far).await;

        let provider = FixedProvider(Ok(vec![1.0, 0.05]));
        let out = RetrievalEngine::default()
            .retrieve(
                &store,
                Some(&provider),
                &RetrievalQuery::new("password", CallerScope::global_only()),
            )
            .await
            .unwrap();
        assert_eq!(out.strategy, Strategy::Vector);
        assert_eq!(out.results[0].rule.id, "near");
        assert!(!out.degraded);
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_keyword_then_widened_vector() {
        let store = InMemoryStore::new();
        let mut weak = rule("weak", "weak", "unrelated words", "nothing");
        // cos([0.6, 0.8], [1, 0]) = 0.6
        weak.embedding = Some(vec![0.6, 0.8]);
        let kw = rule("kw", "kw", "password policy", "rotate password");
        seed(&store, &weak).await;
        seed(&store, &kw).await;

        let provider = FixedProvider(Ok(vec![1.0, 0.0]));
        let engine = RetrievalEngine::default();

        let out = engine
            .retrieve(
                &store,
                Some(&provider),
                &RetrievalQuery::new("password", CallerScope::global_only()),
            )
            .await
            .unwrap();
        assert_eq!(out.strategy, Strategy::Keyword);
        assert_eq!(out.results[0].rule.id, "kw");

        let out = engine
            .retrieve(
                &store,
                Some(&provider),
                &RetrievalQuery::new("kubernetes", CallerScope::global_only()),
            )
            .await
            .unwrap();
        assert_eq!(out.strategy, Strategy::VectorWidened);
        assert_eq!(out.results[0].rule.id, "weak");
        assert!((out.results[0].score - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_provider_failure_degrades_to_keyword() {
        let store = InMemoryStore::new();
        let kw = rule("kw", "kw", "password policy", "rotate password");
        seed(&store, &kw).await;

        let provider = FixedProvider(Err(ProviderError::Transient("timeout".into())));
        let out = RetrievalEngine::default()
            .retrieve(
                &store,
                Some(&provider),
                &RetrievalQuery::new("password", CallerScope::global_only()),
            )
            .await
            .unwrap();
        assert!(out.degraded);
        assert_eq!(out.strategy, Strategy::Keyword);
        assert_eq!(out.results.len(), 1);
    }

    #[tokio::test]
    async fn test_keyword_mode_never_embeds() {
        let store = InMemoryStore::new();
        seed(&store, &rule("kw", "kw", "password", "password")).await;

        let provider = FixedProvider(Err(ProviderError::Permanent("must not be called".into())));
        let mut q = RetrievalQuery::new("password", CallerScope::global_only());
        q.mode = Some(EngineMode::Keyword);
        let out = RetrievalEngine::default()
            .retrieve(&store, Some(&provider), &q)
            .await
            .unwrap();
        assert!(!out.degraded);
        assert_eq!(out.strategy, Strategy::Keyword);
    }

    #[tokio::test]
    async fn test_max_results_and_determinism() {
        let store = InMemoryStore::new();
        for i in 0..15 {
            seed(&store, &rule(&format!("r{i:02}"), &format!("s{i}"), "cache", "cache")).await;
        }
        let engine = RetrievalEngine::default();
        let q = RetrievalQuery::new("cache", CallerScope::global_only());
        let first = engine.retrieve(&store, None, &q).await.unwrap();
        let second = engine.retrieve(&store, None, &q).await.unwrap();
        assert_eq!(first.results.len(), DEFAULT_MAX_RESULTS);
        let ids = |o: &RetrievalOutcome| -> Vec<String> {
            o.results.iter().map(|s| s.rule.id.clone()).collect()
        };
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn test_empty_query_or_no_candidates() {
        let store = InMemoryStore::new();
        let engine = RetrievalEngine::default();
        let out = engine
            .retrieve(&store, None, &RetrievalQuery::new("anything", CallerScope::global_only()))
            .await
            .unwrap();
        assert_eq!(out.strategy, Strategy::None);

        seed(&store, &rule("r", "r", "cache", "cache")).await;
        let out = engine
            .retrieve(&store, None, &RetrievalQuery::new("   ", CallerScope::global_only()))
            .await
            .unwrap();
        assert!(out.results.is_empty());
    }
}
