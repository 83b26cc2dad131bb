//! # Guidance Harness
//!
//! Team coding guidance for AI agents.
//!
//! Rules live in a global scope or in project scopes, where a project rule
//! shadows the global rule with the same slug. Every stored rule gets an
//! embedding through a durable SQLite job queue drained by background
//! workers; retrieval ranks the visible rules for an action by vector
//! similarity and falls back to keyword scoring whenever embeddings are
//! missing or the provider is down.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  put_rule  ┌────────────┐  claim/complete  ┌──────────┐
//! │ CLI/MCP  │──────────▶│  SQLite    │◀────────────────│ Workers  │──▶ provider
//! └────┬─────┘            │ rules/jobs │                  └──────────┘
//!      │ retrieve         │ vectors    │
//!      └────────────────▶└────────────┘
//! ```
//!
//! The domain logic (rule book, queue policy, retrieval) lives in
//! `guidance-harness-core`; this crate supplies storage, providers, the
//! worker loop, and the user-facing surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | Store, queue, and vector index over SQLite |
//! | [`embedding`] | OpenAI, Ollama, and local embedding providers |
//! | [`harness`] | Wiring of core services over the store |
//! | [`worker`] | Embedding workers and the stuck-job sweeper |
//! | [`mcp`] / [`server`] | MCP bridge and HTTP server |
//! | [`rules_cmd`], [`retrieve`], [`stats`], [`embed_cmd`] | CLI commands |

pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod harness;
pub mod mcp;
pub mod migrate;
pub mod retrieve;
pub mod rules_cmd;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod worker;
