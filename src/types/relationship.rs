//! Cross-schema relationships.

use serde::{Deserialize, Serialize};

/// How two schemas relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipKind {
    /// Attributes usable as a join key.
    Join,
    /// Values co-vary without being a key.
    Correlation,
    /// Records co-occur in time windows.
    Temporal,
    /// One schema nests under the other (e.g. Span under Transaction).
    Hierarchy,
    /// One attribute is computed from the other.
    Derived,
}

/// An edge between two schemas.
///
/// Edges carry schema *names*, never handles — schemas live in the
/// session's arena and edges stay cycle-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub source_schema: String,
    pub source_attribute: String,
    pub target_schema: String,
    pub target_attribute: String,
    pub kind: RelationshipKind,
    pub confidence: f64,
}

impl Relationship {
    pub fn new(
        source: (&str, &str),
        target: (&str, &str),
        kind: RelationshipKind,
        confidence: f64,
    ) -> Self {
        Self {
            source_schema: source.0.to_string(),
            source_attribute: source.1.to_string(),
            target_schema: target.0.to_string(),
            target_attribute: target.1.to_string(),
            kind,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}
