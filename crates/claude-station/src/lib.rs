//! ClaudeStation core - cache-aware client runtime for the Anthropic
//! Messages API.
//!
//! The crate assembles four-layer prompts whose byte-stable prefixes
//! maximise the provider's cache hit rate, while a background worker folds
//! old conversation turns into a rolling summary. The GUI shell sits on
//! top of the [`station::ClaudeStation`] facade and the event stream it
//! exposes; nothing in here draws pixels.

pub mod api;
pub mod config;
pub mod context;
pub mod orchestrator;
pub mod pricing;
pub mod station;
pub mod store;
pub mod telemetry;

// Public API exports
pub use config::{ProjectSettings, StationConfig};
pub use pricing::{CacheTtl, CostColor, TokenTracker, Usage};
pub use store::{Conversation, Document, Message, Project, StationDatabase, StoreError};

// Runtime exports
pub use api::{ApiClient, ApiError, StreamEvent};
pub use context::{BuiltContext, ContextBuilder, ContextError, TurnEstimate};
pub use orchestrator::{Orchestrator, TurnEvent};
pub use station::ClaudeStation;
