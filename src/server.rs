//! HTTP server hosting the MCP endpoint.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` / `GET` / `DELETE` | `/mcp` | MCP Streamable HTTP (JSON-RPC) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! All origins, methods, and headers are permitted so browser-based MCP
//! clients can connect.
//!
//! # Cursor Integration
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "guidance": { "url": "http://127.0.0.1:7341/mcp" }
//!   }
//! }
//! ```

use anyhow::Context;
use axum::{routing::get, Json, Router};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::harness::Harness;
use crate::mcp::McpBridge;

/// Build the router for a harness: `/mcp`, `/health` and CORS.
pub fn build_router(harness: Arc<Harness>) -> Router {
    let bridge = McpBridge::new(harness);
    let mcp = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .nest_service("/mcp", mcp)
        .layer(cors)
}

/// `guide serve mcp`: serve until the process is terminated.
///
/// Retrieval uses the configured embedding provider when it can be built
/// and degrades to keyword scoring otherwise.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let harness = Harness::open(config).await?.with_available_provider();
    let router = build_router(Arc::new(harness));

    let bind = &config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!(%bind, "MCP server listening");
    println!("Guidance Harness MCP server listening on http://{}/mcp", bind);

    axum::serve(listener, router).await?;
    Ok(())
}

async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
