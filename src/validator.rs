//! Read-only query-language guard.
//!
//! Purely syntactic: rejects statements that could mutate data or smuggle a
//! second statement past the backend, without ever consulting it. The check
//! runs on every query the server executes, whether caller-written or
//! produced by the [query builder](crate::builder).

use serde::{Deserialize, Serialize};

use crate::{HuginnError, Result};

/// Verbs a statement may start with.
const ALLOWED_VERBS: &[&str] = &["SELECT", "SHOW", "EXPLAIN"];

/// Keywords that are never legitimate in a read-only telemetry query.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
    "MERGE", "EXEC", "EXECUTE",
];

/// Validator limits. Length and nesting caps are configuration; the
/// defaults suit LLM-generated queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorLimits {
    /// Maximum statement length in bytes.
    pub max_length: usize,
    /// Maximum parenthesis nesting depth.
    pub max_nesting: usize,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            max_length: 4096,
            max_nesting: 8,
        }
    }
}

/// A statement that passed validation, in canonical form: trimmed, with
/// runs of whitespace outside string literals collapsed to single spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalQuery(String);

impl CanonicalQuery {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for CanonicalQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Syntactic query guard.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    limits: ValidatorLimits,
}

impl Validator {
    pub fn new(limits: ValidatorLimits) -> Self {
        Self { limits }
    }

    /// Validate a query-language statement.
    ///
    /// Checks, in order: emptiness, length, quoting balance, comment
    /// sequences, multi-statement separators, leading verb, destructive
    /// keywords, nesting depth. The first failure wins; its `reason` slug
    /// is stable (`length`, `quoting`, `comment`, `multi-statement`,
    /// `verb`, `destructive-keyword`, `nesting`).
    pub fn validate(&self, statement: &str) -> Result<CanonicalQuery> {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            return Err(reject("empty", "statement is empty"));
        }
        if statement.len() > self.limits.max_length {
            return Err(reject(
                "length",
                format!(
                    "statement is {} bytes, limit is {}",
                    statement.len(),
                    self.limits.max_length
                ),
            ));
        }

        let scan = Scan::run(trimmed)?;

        if scan.has_comment {
            return Err(reject(
                "comment",
                "comment sequences are not allowed in queries",
            ));
        }
        if scan.statement_count > 1 {
            return Err(reject(
                "multi-statement",
                "multi-statement input is not allowed",
            ));
        }
        if scan.max_depth > self.limits.max_nesting {
            return Err(reject(
                "nesting",
                format!(
                    "nesting depth {} exceeds limit {}",
                    scan.max_depth, self.limits.max_nesting
                ),
            ));
        }

        let first = scan
            .tokens
            .first()
            .ok_or_else(|| reject("verb", "statement has no leading keyword"))?;
        if !ALLOWED_VERBS.contains(&first.as_str()) {
            return Err(reject(
                "verb",
                format!("statement must start with one of {ALLOWED_VERBS:?}, got {first}"),
            ));
        }

        for token in &scan.tokens {
            if FORBIDDEN_KEYWORDS.contains(&token.as_str()) {
                return Err(reject(
                    "destructive-keyword",
                    format!("forbidden keyword: {token}"),
                ));
            }
        }

        Ok(CanonicalQuery(scan.canonical))
    }
}

fn reject(reason: &str, detail: impl Into<String>) -> HuginnError {
    HuginnError::ValidationFailed {
        reason: reason.to_string(),
        detail: detail.into(),
    }
}

/// Single pass over the statement: canonicalises whitespace, collects
/// upper-cased bare tokens, counts statements and nesting, and flags
/// comment sequences. Quoted regions ('…', "…", `…`) are opaque.
struct Scan {
    canonical: String,
    tokens: Vec<String>,
    statement_count: usize,
    max_depth: usize,
    has_comment: bool,
}

impl Scan {
    fn run(input: &str) -> Result<Self> {
        let mut canonical = String::with_capacity(input.len());
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut statement_count = 1;
        let mut depth: usize = 0;
        let mut max_depth = 0;
        let mut has_comment = false;

        let mut chars = input.chars().peekable();
        let mut pending_space = false;

        while let Some(c) = chars.next() {
            match c {
                '\'' | '"' | '`' => {
                    flush_token(&mut current, &mut tokens);
                    if pending_space && !canonical.is_empty() {
                        canonical.push(' ');
                    }
                    pending_space = false;
                    canonical.push(c);
                    let quote = c;
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        canonical.push(inner);
                        if inner == quote {
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(reject("quoting", format!("unterminated {quote} quote")));
                    }
                }
                ';' => {
                    flush_token(&mut current, &mut tokens);
                    // A trailing semicolon is tolerated; anything after one
                    // is a second statement (the input is pre-trimmed).
                    if chars.peek().is_some() {
                        statement_count += 1;
                    }
                }
                '-' if chars.peek() == Some(&'-') => {
                    has_comment = true;
                    flush_token(&mut current, &mut tokens);
                    chars.next();
                }
                '/' if chars.peek() == Some(&'*') => {
                    has_comment = true;
                    flush_token(&mut current, &mut tokens);
                    chars.next();
                }
                '#' => {
                    has_comment = true;
                    flush_token(&mut current, &mut tokens);
                }
                '(' => {
                    flush_token(&mut current, &mut tokens);
                    depth += 1;
                    max_depth = max_depth.max(depth);
                    if pending_space && !canonical.is_empty() {
                        canonical.push(' ');
                    }
                    pending_space = false;
                    canonical.push(c);
                }
                ')' => {
                    flush_token(&mut current, &mut tokens);
                    depth = depth.saturating_sub(1);
                    canonical.push(c);
                    pending_space = false;
                }
                c if c.is_whitespace() => {
                    flush_token(&mut current, &mut tokens);
                    pending_space = true;
                }
                c => {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        current.push(c);
                    } else {
                        flush_token(&mut current, &mut tokens);
                    }
                    if pending_space && !canonical.is_empty() {
                        canonical.push(' ');
                    }
                    pending_space = false;
                    canonical.push(c);
                }
            }
        }
        flush_token(&mut current, &mut tokens);

        Ok(Self {
            canonical,
            tokens,
            statement_count,
            max_depth,
            has_comment,
        })
    }
}

fn flush_token(current: &mut String, tokens: &mut Vec<String>) {
    if !current.is_empty() {
        tokens.push(current.to_ascii_uppercase());
        current.clear();
    }
}
