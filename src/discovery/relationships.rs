//! Cross-schema relationship discovery.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;

use super::probes::Prober;
use crate::types::{Relationship, RelationshipKind, Schema, SemanticType};
use crate::Result;

/// Join keys that are strong by convention.
const WELL_KNOWN_KEYS: &[&str] = &[
    "entityGuid",
    "entity.guid",
    "traceId",
    "trace.id",
    "appName",
    "service.name",
    "host",
    "hostname",
];

/// Find pairwise edges between the given schemas.
///
/// Three mechanisms, in ascending cost: attribute-name equality, value-set
/// overlap on sampled data, and temporal co-occurrence. Edges per pair are
/// capped; the strongest survive.
pub(crate) async fn find(
    prober: &Prober<'_>,
    cancel: &CancellationToken,
    schemas: &[Schema],
    max_edges_per_pair: usize,
) -> Result<Vec<Relationship>> {
    let mut edges = Vec::new();

    for (i, left) in schemas.iter().enumerate() {
        for right in schemas.iter().skip(i + 1) {
            let mut pair_edges = Vec::new();

            // Name equality over join-candidate attributes.
            for attr in &left.attributes {
                let Some(matching) = right.attribute(&attr.name) else {
                    continue;
                };
                let joinish = WELL_KNOWN_KEYS.contains(&attr.name.as_str())
                    || attr.semantic == SemanticType::Identifier
                    || matching.semantic == SemanticType::Identifier;
                if !joinish {
                    continue;
                }
                let mut confidence = if WELL_KNOWN_KEYS.contains(&attr.name.as_str()) {
                    0.8
                } else {
                    0.5
                };

                // Refine with value-set overlap where sampling is possible.
                if let Some(overlap) = value_overlap(prober, cancel, left, right, &attr.name).await?
                {
                    confidence = if overlap > 0.0 {
                        (0.4 + 0.5 * overlap).max(confidence)
                    } else {
                        confidence * 0.5
                    };
                }

                pair_edges.push(Relationship::new(
                    (&left.name, &attr.name),
                    (&right.name, &attr.name),
                    RelationshipKind::Join,
                    confidence,
                ));
            }

            // Hierarchy: a parent pointer on one side, an id on the other.
            for (parent_field, id_field) in [("parent.id", "id"), ("parentId", "id")] {
                if left.attribute(parent_field).is_some() && right.attribute(id_field).is_some() {
                    pair_edges.push(Relationship::new(
                        (&left.name, parent_field),
                        (&right.name, id_field),
                        RelationshipKind::Hierarchy,
                        0.6,
                    ));
                }
                if right.attribute(parent_field).is_some() && left.attribute(id_field).is_some() {
                    pair_edges.push(Relationship::new(
                        (&right.name, parent_field),
                        (&left.name, id_field),
                        RelationshipKind::Hierarchy,
                        0.6,
                    ));
                }
            }

            // Derived: same stem with a unit/bucket suffix.
            for attr in &left.attributes {
                for suffix in [".ms", ".seconds", ".bucket"] {
                    let derived = format!("{}{suffix}", attr.name);
                    if right.attribute(&derived).is_some() {
                        pair_edges.push(Relationship::new(
                            (&left.name, &attr.name),
                            (&right.name, &derived),
                            RelationshipKind::Derived,
                            0.4,
                        ));
                    }
                }
            }

            // Temporal co-occurrence: both carry records in the window.
            if left.record_count > 0
                && right.record_count > 0
                && left.attribute("timestamp").is_some()
                && right.attribute("timestamp").is_some()
            {
                pair_edges.push(Relationship::new(
                    (&left.name, "timestamp"),
                    (&right.name, "timestamp"),
                    RelationshipKind::Temporal,
                    0.5,
                ));
            }

            pair_edges.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            pair_edges.truncate(max_edges_per_pair);
            edges.extend(pair_edges);
        }
    }

    Ok(edges)
}

/// Jaccard overlap of the top values of `field` on both sides, or `None`
/// when either side cannot be sampled.
async fn value_overlap(
    prober: &Prober<'_>,
    cancel: &CancellationToken,
    left: &Schema,
    right: &Schema,
    field: &str,
) -> Result<Option<f64>> {
    let Ok(left_values) = prober.facet_values(cancel, &left.name, field, 25).await else {
        return Ok(None);
    };
    let Ok(right_values) = prober.facet_values(cancel, &right.name, field, 25).await else {
        return Ok(None);
    };
    if left_values.is_empty() || right_values.is_empty() {
        return Ok(None);
    }
    let left_set: BTreeSet<_> = left_values.into_iter().map(|(v, _)| v).collect();
    let right_set: BTreeSet<_> = right_values.into_iter().map(|(v, _)| v).collect();
    let intersection = left_set.intersection(&right_set).count() as f64;
    let union = left_set.union(&right_set).count() as f64;
    Ok(Some(if union == 0.0 { 0.0 } else { intersection / union }))
}
