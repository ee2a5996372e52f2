//! Conversational sessions.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schema::Schema;

/// Upper bound on retained query-history entries per session.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// One executed query, as remembered by a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query: String,
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Truncated digest of the result (first rows / counts), not the data.
    pub result_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A conversational context binding a sequence of tool calls.
///
/// Schemas discovered during the session live here, in an arena keyed by
/// event-type name; relationships reference names, never handles. History
/// is bounded and append-ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// User-declared goal, from `X-Session-Goal` or initialize params.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// Schemas profiled during this session.
    #[serde(default)]
    pub schemas: BTreeMap<String, Schema>,
    #[serde(default)]
    pub history: VecDeque<QueryRecord>,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Session {
    pub fn new(id: impl Into<String>, goal: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            last_access: now,
            goal,
            schemas: BTreeMap::new(),
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Refresh the inactivity clock.
    pub fn touch(&mut self) {
        self.last_access = Utc::now();
    }

    /// Append to history, evicting the oldest entry past the bound.
    pub fn record_query(&mut self, record: QueryRecord) {
        if self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn remember_schema(&mut self, schema: Schema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Whether the session has been idle longer than `ttl` at `now`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_access);
        idle.num_seconds() >= 0 && idle.num_seconds() as u64 >= ttl.as_secs()
    }
}
