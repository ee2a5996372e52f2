//! HTTP implementation of the [`Backend`] trait.
//!
//! Speaks GraphQL to the backend's regional endpoint; query-language
//! statements ride a GraphQL wrapper, as the backend's own API does.
//! Rate limiting and circuit breaking are applied here, per operation
//! class, so every decorator above sees a governed endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::breaker::{BreakerConfig, CircuitBreaker};
use super::ratelimit::{RateLimitConfig, RateLimiter};
use super::{AccountMeta, Backend, MAX_TIMEOUT, OpClass, ResultSet};
use crate::telemetry;
use crate::{HuginnError, Result};

/// Backend region selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    Us,
    Eu,
    Staging,
}

impl Region {
    /// GraphQL endpoint for the region.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Us => "https://api.newrelic.com/graphql",
            Self::Eu => "https://api.eu.newrelic.com/graphql",
            Self::Staging => "https://staging-api.newrelic.com/graphql",
        }
    }

    /// Parse a region name. Unknown names fall back to US.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "eu" => Self::Eu,
            "staging" => Self::Staging,
            _ => Self::Us,
        }
    }
}

/// Configuration for [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub api_key: String,
    pub region: Region,
    /// Explicit endpoint URL; overrides the region when set (used by tests
    /// and self-hosted gateways).
    pub endpoint: Option<String>,
    pub ratelimit: RateLimitConfig,
    pub breaker: BreakerConfig,
    /// TTL for cached account metadata. Default: 1 hour.
    pub account_cache_ttl: Duration,
}

impl BackendConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            region: Region::default(),
            endpoint: None,
            ratelimit: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            account_cache_ttl: Duration::from_secs(3600),
        }
    }

    pub fn region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }
}

/// reqwest-backed [`Backend`] with inline rate limiting and per-operation
/// circuit breakers.
#[derive(Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    limiter: RateLimiter,
    graphql_breaker: CircuitBreaker,
    querylang_breaker: CircuitBreaker,
    account_breaker: CircuitBreaker,
    account_cache: Cache<i64, AccountMeta>,
    region: Region,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(HuginnError::Configuration("backend API key is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(MAX_TIMEOUT)
            .build()
            .map_err(|e| HuginnError::Configuration(format!("HTTP client: {e}")))?;
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| config.region.endpoint().to_string());
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key,
            limiter: RateLimiter::new(config.ratelimit),
            graphql_breaker: CircuitBreaker::new("graphql", config.breaker.clone()),
            querylang_breaker: CircuitBreaker::new("querylang", config.breaker.clone()),
            account_breaker: CircuitBreaker::new("account", config.breaker),
            account_cache: Cache::builder()
                .max_capacity(256)
                .time_to_live(config.account_cache_ttl)
                .build(),
            region: config.region,
        })
    }

    fn breaker(&self, class: OpClass) -> &CircuitBreaker {
        match class {
            OpClass::Graphql => &self.graphql_breaker,
            OpClass::QueryLang => &self.querylang_breaker,
            OpClass::Account => &self.account_breaker,
        }
    }

    /// Breaker state per operation class, for health reporting.
    pub fn breaker_states(&self) -> Value {
        json!({
            "graphql": self.graphql_breaker.state_name(),
            "querylang": self.querylang_breaker.state_name(),
            "account": self.account_breaker.state_name(),
        })
    }

    /// One governed POST to the GraphQL endpoint.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        class: OpClass,
        account: i64,
        timeout: Duration,
        body: Value,
    ) -> Result<Value> {
        self.limiter.try_acquire(account, class)?;
        let breaker = self.breaker(class);
        breaker.check()?;

        let timeout = timeout.min(MAX_TIMEOUT);
        let request = self
            .client
            .post(&self.endpoint)
            .header("Api-Key", &self.api_key)
            .json(&body)
            .send();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(HuginnError::Cancelled),
            result = tokio::time::timeout(timeout, request) => match result {
                Err(_) => Err(HuginnError::Timeout(timeout)),
                Ok(Err(e)) if e.is_timeout() => Err(HuginnError::Timeout(timeout)),
                Ok(Err(e)) if e.is_connect() => {
                    Err(HuginnError::BackendUnavailable(format!("connect: {e}")))
                }
                Ok(Err(e)) => Err(HuginnError::BackendUnavailable(e.to_string())),
                Ok(Ok(response)) => self.handle_response(response).await,
            },
        };

        match &outcome {
            Ok(_) => {
                breaker.on_success();
                metrics::counter!(telemetry::BACKEND_REQUESTS_TOTAL,
                    "operation" => class.as_str(), "status" => "ok")
                .increment(1);
            }
            Err(e) => {
                if CircuitBreaker::counts_as_failure(e) {
                    breaker.on_failure();
                }
                if !matches!(e, HuginnError::Cancelled) {
                    metrics::counter!(telemetry::BACKEND_REQUESTS_TOTAL,
                        "operation" => class.as_str(), "status" => "error")
                    .increment(1);
                }
            }
        }
        outcome
    }

    async fn handle_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), retry_after, &body));
        }
        let doc: Value = response
            .json()
            .await
            .map_err(|e| HuginnError::BackendUnavailable(format!("malformed response: {e}")))?;

        if let Some(errors) = doc.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(map_graphql_errors(errors));
            }
        }
        Ok(doc.get("data").cloned().unwrap_or(Value::Null))
    }
}

/// Map an HTTP status to an error kind. The body is inspected only for
/// logging-safe detail, never echoed wholesale.
fn map_status(status: u16, retry_after: Option<Duration>, body: &str) -> HuginnError {
    debug!(status, body_len = body.len(), "backend error response");
    match status {
        401 | 403 => HuginnError::Unauthorized("backend rejected the API key".into()),
        429 => HuginnError::RateLimited { retry_after },
        400 => HuginnError::invalid_input("backend rejected the request"),
        _ => HuginnError::BackendUnavailable(format!("status {status}")),
    }
}

fn map_graphql_errors(errors: &[Value]) -> HuginnError {
    let message = errors
        .iter()
        .filter_map(|e| e.get("message").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("; ");
    let lower = message.to_lowercase();
    if lower.contains("unauthorized") || lower.contains("access denied") {
        HuginnError::Unauthorized("backend denied access".into())
    } else if lower.contains("timeout") || lower.contains("timed out") {
        HuginnError::Timeout(MAX_TIMEOUT)
    } else {
        HuginnError::invalid_input(format!("backend error: {message}"))
    }
}

/// GraphQL wrapper for query-language statements.
const QUERYLANG_WRAPPER: &str = "\
query ($accountId: Int!, $statement: Nrql!, $timeout: Seconds) {\
  actor { account(id: $accountId) { nrql(query: $statement, timeout: $timeout) {\
    results metadata { eventTypes facets timeWindow { since until } }\
  } } }\
}";

const ACCOUNT_QUERY: &str = "\
query ($accountId: Int!) {\
  actor { account(id: $accountId) { id name } }\
}";

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn graphql(&self, cancel: &CancellationToken, query: &str, vars: Value) -> Result<Value> {
        let body = json!({ "query": query, "variables": vars });
        // Raw GraphQL runs under the calling account's bucket only when the
        // caller encodes it in vars; otherwise it is account 0 (shared).
        let account = vars
            .get("accountId")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        self.execute(cancel, OpClass::Graphql, account, super::DEFAULT_TIMEOUT, body)
            .await
    }

    async fn querylang(
        &self,
        cancel: &CancellationToken,
        statement: &str,
        account: i64,
        timeout: Duration,
    ) -> Result<ResultSet> {
        let timeout = timeout.min(MAX_TIMEOUT);
        let body = json!({
            "query": QUERYLANG_WRAPPER,
            "variables": {
                "accountId": account,
                "statement": statement,
                "timeout": timeout.as_secs(),
            },
        });
        let started = Instant::now();
        let data = self
            .execute(cancel, OpClass::QueryLang, account, timeout, body)
            .await?;
        let container = &data["actor"]["account"]["nrql"];
        if container.is_null() {
            return Err(HuginnError::BackendUnavailable(
                "query response missing result container".into(),
            ));
        }
        let rows = container
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(ResultSet {
            rows,
            metadata: container.get("metadata").cloned().unwrap_or(Value::Null),
            elapsed: started.elapsed(),
        })
    }

    async fn account_info(&self, cancel: &CancellationToken, account: i64) -> Result<AccountMeta> {
        if let Some(meta) = self.account_cache.get(&account).await {
            return Ok(meta);
        }
        let body = json!({
            "query": ACCOUNT_QUERY,
            "variables": { "accountId": account },
        });
        let data = self
            .execute(cancel, OpClass::Account, account, super::DEFAULT_TIMEOUT, body)
            .await?;
        let node = &data["actor"]["account"];
        let id = node
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| HuginnError::NotFound(format!("account {account}")))?;
        let meta = AccountMeta {
            id,
            name: node
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            region: format!("{:?}", self.region).to_lowercase(),
        };
        self.account_cache.insert(account, meta.clone()).await;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_parsing_defaults_to_us() {
        assert_eq!(Region::parse("eu"), Region::Eu);
        assert_eq!(Region::parse("EU"), Region::Eu);
        assert_eq!(Region::parse("staging"), Region::Staging);
        assert_eq!(Region::parse("anything"), Region::Us);
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_status(401, None, ""),
            HuginnError::Unauthorized(_)
        ));
        assert!(matches!(
            map_status(429, Some(Duration::from_secs(2)), ""),
            HuginnError::RateLimited {
                retry_after: Some(_)
            }
        ));
        assert!(matches!(
            map_status(503, None, ""),
            HuginnError::BackendUnavailable(_)
        ));
        assert!(matches!(
            map_status(400, None, ""),
            HuginnError::InvalidInput { .. }
        ));
    }

    #[test]
    fn empty_api_key_is_a_config_error() {
        let err = HttpBackend::new(BackendConfig::new("")).unwrap_err();
        assert!(matches!(err, HuginnError::Configuration(_)));
    }
}
