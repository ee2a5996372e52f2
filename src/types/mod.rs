//! Public types for the Huginn API

mod discovery;
mod quality;
mod relationship;
mod schema;
mod session;
mod tool;

pub use discovery::{DiscoveryHints, DiscoveryKind, DiscoveryResult, DiscoveryScope};
pub use quality::{IssueSeverity, QualityIssue, QualityReport, QualityWeights};
pub use relationship::{Relationship, RelationshipKind};
pub use schema::{
    Attribute, AttributeType, ProfileDepth, Schema, SchemaFilter, SchemaList, SemanticType,
    VolumeProfile,
};
pub use session::{QueryRecord, Session};
pub use tool::{ParamSchema, ParamSpec, ParamType, Prerequisite, ToolSpec};
