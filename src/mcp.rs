//! MCP JSON-RPC bridge.
//!
//! Exposes retrieval and authoring to MCP clients over Streamable HTTP:
//!
//! | Tool | Does |
//! |------|------|
//! | `get_guidance` | rank the rules that apply to an action |
//! | `add_guidance` | store a rule and queue its embedding |
//! | `queue_status` | embedding queue counts per status and worker |
//!
//! Every tool answers with pretty-printed JSON text. Bad arguments and
//! domain failures come back as tool errors (`isError: true`), unknown tool
//! names as a JSON-RPC `METHOD_NOT_FOUND`.

use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{bail, Context};
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use guidance_harness_core::models::{Category, Priority, RuleDraft};
use guidance_harness_core::search::{EngineMode, RetrievalQuery};

use crate::harness::Harness;

#[derive(Debug, Deserialize)]
struct GetGuidanceParams {
    action: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    caller: Option<String>,
    #[serde(default)]
    projects: Vec<String>,
    #[serde(default)]
    max_results: Option<usize>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    explain: bool,
}

#[derive(Debug, Deserialize)]
struct AddGuidanceParams {
    title: String,
    guidance: String,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    contexts: Vec<String>,
    #[serde(default)]
    tech_stacks: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

/// Each MCP session gets a clone; the harness behind it is shared.
#[derive(Clone)]
pub struct McpBridge {
    harness: Arc<Harness>,
}

impl McpBridge {
    pub fn new(harness: Arc<Harness>) -> Self {
        Self { harness }
    }

    fn tool(name: &str, description: &str, schema: Value, read_only: bool) -> Tool {
        let input_schema = match schema {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };
        Tool {
            name: Cow::Owned(name.to_string()),
            title: None,
            description: Some(Cow::Owned(description.to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(read_only)),
            execution: None,
            icons: None,
            meta: None,
        }
    }

    fn tools() -> Vec<Tool> {
        let list = json!({ "type": "array", "items": { "type": "string" } });
        vec![
            Self::tool(
                "get_guidance",
                "Find the team guidance that applies to an action, ranked by relevance.",
                json!({
                    "type": "object",
                    "properties": {
                        "action": { "type": "string", "description": "What you are about to do" },
                        "code": { "type": "string", "description": "Code under discussion" },
                        "context": { "type": "string", "description": "Only rules tagged with this context" },
                        "caller": { "type": "string", "description": "Caller id; adds the caller's projects" },
                        "projects": list.clone(),
                        "max_results": { "type": "integer", "minimum": 1 },
                        "mode": { "type": "string", "enum": ["auto", "vector", "keyword"] },
                        "explain": { "type": "boolean" }
                    },
                    "required": ["action"]
                }),
                true,
            ),
            Self::tool(
                "add_guidance",
                "Store a new guidance rule. Its embedding is generated in the background.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "guidance": { "type": "string" },
                        "slug": { "type": "string" },
                        "project": { "type": "string", "description": "Project id; omit for a global rule" },
                        "rationale": { "type": "string" },
                        "category": { "type": "string" },
                        "priority": { "type": "string", "enum": ["low", "medium", "high", "critical"] },
                        "contexts": list.clone(),
                        "tech_stacks": list.clone(),
                        "keywords": list
                    },
                    "required": ["title", "guidance"]
                }),
                false,
            ),
            Self::tool(
                "queue_status",
                "Embedding queue counts by status and priority, and per-worker totals.",
                json!({ "type": "object", "properties": {} }),
                true,
            ),
        ]
    }

    /// Run one tool. `Ok(None)` means the name is unknown.
    async fn execute(&self, name: &str, params: Value) -> anyhow::Result<Option<Value>> {
        let result = match name {
            "get_guidance" => self.get_guidance(serde_json::from_value(params)?).await?,
            "add_guidance" => self.add_guidance(serde_json::from_value(params)?).await?,
            "queue_status" => serde_json::to_value(self.harness.queue().stats().await?)?,
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    async fn get_guidance(&self, params: GetGuidanceParams) -> anyhow::Result<Value> {
        if params.action.trim().is_empty() {
            bail!("action must not be empty");
        }
        if params.max_results == Some(0) {
            bail!("max_results must be >= 1");
        }
        let mode = params
            .mode
            .as_deref()
            .map(str::parse::<EngineMode>)
            .transpose()?;

        let scope = self
            .harness
            .rules()
            .resolve_scope(params.caller.as_deref(), &params.projects)
            .await?;
        let query = RetrievalQuery {
            code: params.code,
            context: params.context,
            max_results: params.max_results,
            mode,
            explain: params.explain,
            ..RetrievalQuery::new(params.action, scope)
        };
        let outcome = self.harness.retrieve(&query).await?;
        debug!(
            results = outcome.results.len(),
            strategy = %outcome.strategy,
            degraded = outcome.degraded,
            "get_guidance"
        );
        Ok(serde_json::to_value(outcome)?)
    }

    async fn add_guidance(&self, params: AddGuidanceParams) -> anyhow::Result<Value> {
        let category = params
            .category
            .as_deref()
            .map(str::parse::<Category>)
            .transpose()
            .context("invalid category")?
            .unwrap_or_default();
        let priority = params
            .priority
            .as_deref()
            .map(str::parse::<Priority>)
            .transpose()
            .context("invalid priority")?
            .unwrap_or_default();

        let draft = RuleDraft {
            slug: params.slug,
            project_id: params.project,
            title: params.title,
            guidance: params.guidance,
            rationale: params.rationale,
            category,
            priority,
            contexts: params.contexts.into_iter().collect(),
            tech_stacks: params.tech_stacks.into_iter().collect(),
            keywords: params.keywords.into_iter().collect(),
            embedding: None,
        };
        let stored = self.harness.rules().put_rule(draft).await?;
        Ok(json!({ "rule": stored.rule, "embedding": stored.embedding }))
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "guidance-harness".to_string(),
                title: Some("Guidance Harness".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Team guidance for coding agents. Call get_guidance with the action you are \
                 about to take before writing code, add_guidance to record a new rule, and \
                 queue_status to check whether new rules have been embedded yet."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(Self::tools())))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        Self::tools().into_iter().find(|t| t.name == name)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let params = request
            .arguments
            .map(Value::Object)
            .unwrap_or(Value::Object(serde_json::Map::new()));

        match self.execute(&request.name, params).await {
            Ok(Some(result)) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Ok(None) => Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!("{:#}", e))])),
        }
    }
}
