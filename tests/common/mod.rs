//! Shared test harness: a scripted mock backend and a fully wired
//! protocol stack over it.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use huginn::backend::{AccountMeta, Backend, ResultSet};
use huginn::builder::QueryBuilder;
use huginn::discovery::{DiscoveryConfig, DiscoveryEngine};
use huginn::protocol::{ProtocolConfig, ProtocolHandler};
use huginn::state::{StateConfig, StateManager};
use huginn::tools::{DispatchLimits, Dispatcher, ToolRegistry};
use huginn::validator::Validator;
use huginn::{HuginnError, Result};

pub const ACCOUNT: i64 = 42;

/// A backend scripted to look like a small healthy tenant: Transaction
/// (1000 records, 99% carrying `appName`) and TransactionError. Counts
/// every query-language call and remembers the statements.
pub struct MockBackend {
    pub querylang_calls: AtomicU32,
    pub statements: Mutex<Vec<String>>,
    /// When set, every call fails with this error.
    pub fail_with: Mutex<Option<HuginnError>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            querylang_calls: AtomicU32::new(0),
            statements: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        }
    }
}

impl MockBackend {
    pub fn calls(&self) -> u32 {
        self.querylang_calls.load(Ordering::SeqCst)
    }

    pub fn saw_statement(&self, needle: &str) -> bool {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.contains(needle))
    }

    fn respond(statement: &str) -> Vec<Value> {
        if statement.starts_with("SHOW EVENT TYPES") {
            return vec![
                json!({"eventType": "Transaction"}),
                json!({"eventType": "TransactionError"}),
            ];
        }
        if statement.contains("keyset()") {
            return vec![
                json!({"key": "appName", "type": "string"}),
                json!({"key": "duration", "type": "numeric"}),
                json!({"key": "error", "type": "boolean"}),
                json!({"key": "timestamp", "type": "timestamp"}),
                json!({"key": "http.statusCode", "type": "numeric"}),
            ];
        }
        if statement.contains("SELECT * FROM") {
            return (0..10)
                .map(|i| {
                    json!({
                        "appName": if i % 2 == 0 { "checkout" } else { "cart" },
                        "duration": 0.1 + i as f64 / 100.0,
                        "error": i == 9,
                        "timestamp": 1_700_000_000_000_i64 + i,
                        "http.statusCode": if i == 9 { 500 } else { 200 },
                    })
                })
                .collect();
        }
        if statement.contains("latest(timestamp)") {
            return vec![json!({"latest.timestamp": chrono_now_millis()})];
        }
        if statement.contains("FACET") {
            return vec![
                json!({"appName": "checkout", "count": 600.0}),
                json!({"appName": "cart", "count": 390.0}),
            ];
        }
        // Aggregate counts.
        if statement.contains("`appName` IS NOT NULL") {
            return vec![json!({"count": 990.0})];
        }
        if statement.contains("error IS NOT NULL") {
            return vec![json!({"count": 1000.0})];
        }
        if statement.contains("error IS true") {
            return vec![json!({"count": 25.0})];
        }
        if statement.contains("IS NOT NULL") || statement.contains("LIKE") {
            return vec![json!({"count": 0.0})];
        }
        if statement.contains("count(*) FROM TransactionError") {
            return vec![json!({"count": 50.0})];
        }
        if statement.contains("count(*) FROM Transaction") {
            return vec![json!({"count": 1000.0})];
        }
        vec![json!({"count": 0.0})]
    }
}

fn chrono_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn graphql(&self, _cancel: &CancellationToken, _query: &str, _vars: Value) -> Result<Value> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(json!({"actor": {"account": {"dashboards": []}}}))
    }

    async fn querylang(
        &self,
        cancel: &CancellationToken,
        statement: &str,
        _account: i64,
        _timeout: Duration,
    ) -> Result<ResultSet> {
        if cancel.is_cancelled() {
            return Err(HuginnError::Cancelled);
        }
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        self.querylang_calls.fetch_add(1, Ordering::SeqCst);
        self.statements.lock().unwrap().push(statement.to_string());
        Ok(ResultSet {
            rows: Self::respond(statement),
            metadata: Value::Null,
            elapsed: Duration::from_millis(1),
        })
    }

    async fn account_info(&self, _cancel: &CancellationToken, account: i64) -> Result<AccountMeta> {
        Ok(AccountMeta {
            id: account,
            name: "test account".to_string(),
            region: "us".to_string(),
        })
    }
}

/// A fully wired stack over the given backend and tool table.
pub struct Harness {
    pub protocol: Arc<ProtocolHandler>,
    pub dispatcher: Arc<Dispatcher>,
    pub state: Arc<StateManager>,
    pub root: CancellationToken,
}

pub fn harness(backend: Arc<dyn Backend>) -> Harness {
    harness_with(backend, ToolRegistry::builtin(), DispatchLimits::default())
}

pub fn harness_with(
    backend: Arc<dyn Backend>,
    registry: ToolRegistry,
    limits: DispatchLimits,
) -> Harness {
    let state = Arc::new(StateManager::in_memory(StateConfig::default()));
    let engine = Arc::new(
        DiscoveryEngine::new(
            backend.clone(),
            state.cache().clone(),
            DiscoveryConfig::default(),
        )
        .expect("engine config"),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        engine,
        state.clone(),
        backend,
        Arc::new(QueryBuilder::default()),
        Arc::new(Validator::default()),
        limits,
        ACCOUNT,
    ));
    let root = CancellationToken::new();
    let protocol = Arc::new(ProtocolHandler::new(
        dispatcher.clone(),
        ProtocolConfig::default(),
        root.clone(),
    ));
    Harness {
        protocol,
        dispatcher,
        state,
        root,
    }
}
