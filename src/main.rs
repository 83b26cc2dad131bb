//! # Guidance Harness CLI (`guide`)
//!
//! The `guide` binary manages a store of team guidance rules, keeps their
//! embeddings up to date through a background job queue, and serves
//! retrieval to coding agents over MCP.
//!
//! ## Usage
//!
//! ```bash
//! guide --config ./config/guide.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `init` | Create the SQLite schema |
//! | `project create\|grant\|list` | Manage projects and membership |
//! | `rule add\|edit\|show\|list` | Author and inspect rules |
//! | `retrieve <action>` | Rank the guidance for an action |
//! | `worker` | Process embedding jobs |
//! | `jobs stats\|list\|sweep` | Inspect the embedding queue |
//! | `embed pending\|reset` | Bulk (re)enqueue embedding jobs |
//! | `index rebuild` | Rebuild the vector index from stored embeddings |
//! | `serve mcp` | Start the MCP HTTP server |

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use guidance_harness::{
    config, embed_cmd, migrate, retrieve, rules_cmd, server, stats, worker,
};
use retrieve::RetrieveArgs;
use rules_cmd::RuleFields;

#[derive(Parser)]
#[command(
    name = "guide",
    about = "Guidance Harness: team coding guidance for AI agents",
    version,
    long_about = "Guidance Harness stores team coding rules in global and project scopes, \
    embeds them in the background through a durable job queue, and ranks the rules that \
    apply to an action by keyword and vector similarity, via a CLI and an MCP server."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/guide.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; safe to run repeatedly.
    Init,

    /// Manage projects and who can see them.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Author and inspect guidance rules.
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Rank the guidance that applies to an action.
    ///
    /// Uses vector similarity when embeddings are available and keyword
    /// scoring otherwise.
    Retrieve {
        /// What you are about to do, in plain words.
        action: String,

        /// Code under discussion; joined to the action for scoring.
        #[arg(long)]
        code: Option<String>,

        /// Only consider rules tagged with this context.
        #[arg(long)]
        context: Option<String>,

        /// Caller id; adds every project the caller is a member of.
        #[arg(long)]
        caller: Option<String>,

        /// Project id to include (repeatable).
        #[arg(long = "project")]
        projects: Vec<String>,

        /// Maximum number of results (default from config).
        #[arg(long)]
        limit: Option<usize>,

        /// `auto`, `vector`, or `keyword`.
        #[arg(long)]
        mode: Option<String>,

        /// Show how each score was computed.
        #[arg(long)]
        explain: bool,

        #[arg(long)]
        json: bool,
    },

    /// Process embedding jobs with the configured provider.
    ///
    /// Runs until Ctrl-C. In-flight jobs are finished before exiting.
    Worker {
        /// Number of concurrent workers (default from config).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Exit once no job is claimable.
        #[arg(long)]
        drain: bool,
    },

    /// Inspect the embedding job queue.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Bulk embedding maintenance.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Vector index maintenance.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project.
    Create {
        /// Project id (lowercase letters, digits, and hyphens).
        id: String,
        /// Display name (defaults to the id).
        #[arg(long)]
        name: Option<String>,
    },
    /// Grant a caller access to a project's rules.
    Grant {
        project: String,
        caller: String,
    },
    List,
}

/// Rule fields shared by `rule add` and `rule edit`.
#[derive(Args)]
struct RuleFieldArgs {
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    guidance: Option<String>,
    #[arg(long)]
    rationale: Option<String>,
    /// architecture, security, performance, testing, ai-ml, ux, devops, data
    #[arg(long)]
    category: Option<String>,
    /// low, medium, high, critical
    #[arg(long)]
    priority: Option<String>,
    /// Context tag (repeatable or comma-separated).
    #[arg(long = "context")]
    contexts: Vec<String>,
    /// Tech stack tag (repeatable or comma-separated).
    #[arg(long = "tech")]
    tech_stacks: Vec<String>,
    /// Extra keyword (repeatable or comma-separated).
    #[arg(long = "keyword")]
    keywords: Vec<String>,
}

impl From<RuleFieldArgs> for RuleFields {
    fn from(a: RuleFieldArgs) -> Self {
        RuleFields {
            title: a.title,
            guidance: a.guidance,
            rationale: a.rationale,
            category: a.category,
            priority: a.priority,
            contexts: a.contexts,
            tech_stacks: a.tech_stacks,
            keywords: a.keywords,
        }
    }
}

#[derive(Subcommand)]
enum RuleAction {
    /// Store a new rule and queue its embedding.
    Add {
        /// Slug (derived from the title when omitted).
        #[arg(long)]
        slug: Option<String>,
        /// Project id; omit for a global rule.
        #[arg(long)]
        project: Option<String>,
        #[command(flatten)]
        fields: RuleFieldArgs,
    },
    /// Change fields of a rule. Text changes re-queue its embedding.
    Edit {
        id: String,
        #[command(flatten)]
        fields: RuleFieldArgs,
    },
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// List the rules a caller sees, after project rules shadow global ones.
    List {
        #[arg(long)]
        caller: Option<String>,
        #[arg(long = "project")]
        projects: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// Job counts by status and priority, and per-worker totals.
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// List jobs, newest first.
    List {
        /// pending, processing, completed, failed, or retrying
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Return jobs stuck in `processing` to the queue now.
    Sweep,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Queue a job for every rule without an embedding.
    Pending {
        /// Show counts without enqueuing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Drop all embeddings and re-queue every rule.
    ///
    /// Needed after switching embedding model or dimensions.
    Reset,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Clear the vector index and re-project every stored embedding.
    Rebuild,
}

#[derive(Subcommand)]
enum ServeService {
    /// MCP Streamable HTTP server at `/mcp`.
    Mcp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project { action } => match action {
            ProjectAction::Create { id, name } => {
                rules_cmd::run_project_create(&cfg, &id, name.as_deref()).await?;
            }
            ProjectAction::Grant { project, caller } => {
                rules_cmd::run_project_grant(&cfg, &project, &caller).await?;
            }
            ProjectAction::List => {
                rules_cmd::run_project_list(&cfg).await?;
            }
        },
        Commands::Rule { action } => match action {
            RuleAction::Add {
                slug,
                project,
                fields,
            } => {
                rules_cmd::run_rule_add(&cfg, slug, project, fields.into()).await?;
            }
            RuleAction::Edit { id, fields } => {
                rules_cmd::run_rule_edit(&cfg, &id, fields.into()).await?;
            }
            RuleAction::Show { id, json } => {
                rules_cmd::run_rule_show(&cfg, &id, json).await?;
            }
            RuleAction::List {
                caller,
                projects,
                json,
            } => {
                rules_cmd::run_rule_list(&cfg, caller.as_deref(), &projects, json).await?;
            }
        },
        Commands::Retrieve {
            action,
            code,
            context,
            caller,
            projects,
            limit,
            mode,
            explain,
            json,
        } => {
            let args = RetrieveArgs {
                action,
                code,
                context,
                caller,
                projects,
                limit,
                mode,
                explain,
                json,
            };
            retrieve::run_retrieve(&cfg, args).await?;
        }
        Commands::Worker { concurrency, drain } => {
            worker::run_worker(&cfg, concurrency, drain).await?;
        }
        Commands::Jobs { action } => match action {
            JobsAction::Stats { json } => {
                stats::run_jobs_stats(&cfg, json).await?;
            }
            JobsAction::List {
                status,
                limit,
                json,
            } => {
                stats::run_jobs_list(&cfg, status.as_deref(), limit, json).await?;
            }
            JobsAction::Sweep => {
                stats::run_jobs_sweep(&cfg).await?;
            }
        },
        Commands::Embed { action } => match action {
            EmbedAction::Pending { dry_run } => {
                embed_cmd::run_embed_pending(&cfg, dry_run).await?;
            }
            EmbedAction::Reset => {
                embed_cmd::run_embed_reset(&cfg).await?;
            }
        },
        Commands::Index { action } => match action {
            IndexAction::Rebuild => {
                embed_cmd::run_index_rebuild(&cfg).await?;
            }
        },
        Commands::Serve { service } => match service {
            ServeService::Mcp => {
                server::run_server(&cfg).await?;
            }
        },
    }

    Ok(())
}
