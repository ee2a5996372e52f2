//! Huginn - discovery-first MCP gateway for observability backends
//!
//! Huginn sits between AI assistants speaking the MCP tool-calling
//! protocol and an observability backend with a GraphQL surface and a
//! time-series query language. Before any query runs, it *discovers* what
//! actually exists in the caller's tenant — event types, service
//! identifiers, error indicators, dashboard widget shapes — caches those
//! findings with confidence and coverage, and composes or refuses queries
//! accordingly instead of trusting hard-coded field names.
//!
//! # Embedding example
//!
//! ```rust,no_run
//! use huginn::{HuginnConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let mut config = HuginnConfig::default();
//!     config.apply_env();
//!     Supervisor::new(config).run().await
//! }
//! ```
//!
//! The `hugd` binary (feature `server`) wraps exactly this with CLI flags
//! and TOML configuration.

pub mod backend;
pub mod builder;
pub mod config;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod tools;
pub mod transport;
pub mod types;
pub mod validator;

// Re-export main types at crate root
pub use builder::{BuildOutcome, Discoveries, QueryBuilder, QueryIntent, QueryScope};
pub use config::HuginnConfig;
pub use discovery::{DiscoveryConfig, DiscoveryEngine, HealthStatus, SingleFlight};
pub use error::{HuginnError, Result};
pub use state::{CacheKey, CacheStats, CacheStore, SessionStore, StateConfig, StateManager};
pub use supervisor::Supervisor;
pub use tools::{DispatchLimits, Dispatcher, ToolCall, ToolRegistry};
pub use validator::{CanonicalQuery, Validator, ValidatorLimits};

// Re-export the data model
pub use types::{
    Attribute, AttributeType, DiscoveryHints, DiscoveryKind, DiscoveryResult, DiscoveryScope,
    ParamSchema, ParamSpec, ParamType, Prerequisite, ProfileDepth, QualityReport, QualityWeights,
    QueryRecord, Relationship, RelationshipKind, Schema, SchemaFilter, Session, ToolSpec,
};
