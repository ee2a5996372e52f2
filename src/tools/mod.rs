//! Tool registry and dispatch.
//!
//! Tools are the unit AI callers invoke. The registry is a closed map
//! populated at startup; the [`Dispatcher`](dispatcher::Dispatcher) binds
//! incoming calls to discovery prerequisites, validates parameters,
//! enforces concurrency limits, and annotates results with the discoveries
//! they rest on.

pub mod dispatcher;
pub mod handlers;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::builder::QueryBuilder;
use crate::discovery::DiscoveryEngine;
use crate::state::StateManager;
use crate::types::{DiscoveryResult, ToolSpec};
use crate::validator::Validator;
use crate::Result;

pub use dispatcher::{DispatchLimits, DispatchResult, Dispatcher, ResponseMeta, ToolCall};

/// Everything a tool handler may touch, injected per call.
#[derive(Clone)]
pub struct ToolContext {
    pub engine: Arc<DiscoveryEngine>,
    pub state: Arc<StateManager>,
    pub backend: Arc<dyn Backend>,
    pub builder: Arc<QueryBuilder>,
    pub validator: Arc<Validator>,
    /// Account the call runs against.
    pub account: i64,
    /// Session bound to the call, when the caller supplied one.
    pub session_id: Option<String>,
    /// Request-scoped cancellation; observed at every suspension point.
    pub cancel: CancellationToken,
    /// Discoveries the dispatcher ensured for the declared prerequisites.
    pub prerequisites: Vec<DiscoveryResult>,
    /// Confidence floor the dispatcher applied.
    pub min_confidence: f64,
}

/// What a handler returns: a JSON body plus whether the executed query was
/// composed or rewritten from discoveries.
#[derive(Debug)]
pub struct ToolOutput {
    pub body: Value,
    pub query_adapted: bool,
}

impl ToolOutput {
    pub fn json(body: Value) -> Self {
        Self {
            body,
            query_adapted: false,
        }
    }

    pub fn adapted(body: Value) -> Self {
        Self {
            body,
            query_adapted: true,
        }
    }
}

/// A tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, ctx: ToolContext, args: Map<String, Value>) -> Result<ToolOutput>;
}

/// Spec + handler pair.
pub struct Tool {
    pub spec: ToolSpec,
    pub handler: Arc<dyn ToolHandler>,
}

/// Closed tool table. Populated at startup, immutable thereafter; there is
/// no runtime registration surface.
pub struct ToolRegistry {
    tools: BTreeMap<String, Tool>,
}

impl ToolRegistry {
    /// The built-in tool set.
    pub fn builtin() -> Self {
        Self::with_tools(handlers::builtin_tools())
    }

    /// A registry over an explicit tool table. Embedders extending the
    /// built-in set register everything here, at startup; the map is
    /// closed afterwards.
    pub fn with_tools(tools: Vec<Tool>) -> Self {
        let mut registry = Self {
            tools: BTreeMap::new(),
        };
        for tool in tools {
            registry.register(tool);
        }
        registry
    }

    fn register(&mut self, tool: Tool) {
        debug_assert!(
            !self.tools.contains_key(&tool.spec.name),
            "duplicate tool {}",
            tool.spec.name
        );
        self.tools.insert(tool.spec.name.clone(), tool);
    }

    pub fn lookup(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Tool specs in name order.
    pub fn list(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values().map(|t| &t.spec)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_populated_and_closed() {
        let registry = ToolRegistry::builtin();
        assert!(registry.lookup("query_nrdb").is_some());
        assert!(registry.lookup("list_schemas").is_some());
        assert!(registry.lookup("no_such_tool").is_none());
        assert!(registry.len() >= 8);
    }

    #[test]
    fn query_nrdb_schema_requires_query_string() {
        let registry = ToolRegistry::builtin();
        let spec = &registry.lookup("query_nrdb").unwrap().spec;
        let schema = spec.params.to_json_schema();
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert!(
            schema["required"]
                .as_array()
                .unwrap()
                .contains(&serde_json::json!("query"))
        );
    }

    #[test]
    fn tool_names_are_underscored() {
        let registry = ToolRegistry::builtin();
        for spec in registry.list() {
            assert!(
                !spec.name.contains('.') && !spec.name.contains('-'),
                "{} is not underscored",
                spec.name
            );
        }
    }
}
