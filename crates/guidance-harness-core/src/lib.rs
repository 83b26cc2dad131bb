//! # Guidance Harness Core
//!
//! Runtime-agnostic logic for Guidance Harness: rule models and validation,
//! project scoping, the embedding job state machine and queue service, the
//! store traits with an in-memory backend, and the retrieval engine.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Concrete storage and embedding providers live in the `guidance-harness`
//! application crate.

pub mod embedding;
pub mod error;
pub mod jobs;
pub mod models;
pub mod queue;
pub mod rules;
pub mod search;
pub mod store;

pub use error::{Error, ProviderError, Result, ValidationError};
