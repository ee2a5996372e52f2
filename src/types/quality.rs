//! Data-quality assessment types.

use serde::{Deserialize, Serialize};

/// Weights for the five quality dimensions.
///
/// The exact weighting is a policy choice, so it lives in configuration.
/// Defaults: completeness 0.30, validity 0.25, timeliness 0.20,
/// consistency 0.15, uniqueness 0.10. Weights are normalised before use,
/// so they need not sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityWeights {
    pub completeness: f64,
    pub consistency: f64,
    pub timeliness: f64,
    pub uniqueness: f64,
    pub validity: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            completeness: 0.30,
            consistency: 0.15,
            timeliness: 0.20,
            uniqueness: 0.10,
            validity: 0.25,
        }
    }
}

impl QualityWeights {
    fn sum(&self) -> f64 {
        self.completeness + self.consistency + self.timeliness + self.uniqueness + self.validity
    }
}

/// Severity of a quality issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

/// One detected quality problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: IssueSeverity,
    pub description: String,
    /// Attributes the issue affects; empty for schema-level issues.
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Five-dimension quality report for one event type.
///
/// Each dimension is scored in [0, 1]; `overall` is the weighted average
/// under the weights the report was scored with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub completeness: f64,
    pub consistency: f64,
    pub timeliness: f64,
    pub uniqueness: f64,
    pub validity: f64,
    pub overall: f64,
    #[serde(default)]
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    /// Assemble a report, clamping dimensions and computing the weighted
    /// overall score.
    pub fn score(
        completeness: f64,
        consistency: f64,
        timeliness: f64,
        uniqueness: f64,
        validity: f64,
        weights: &QualityWeights,
        issues: Vec<QualityIssue>,
    ) -> Self {
        let completeness = completeness.clamp(0.0, 1.0);
        let consistency = consistency.clamp(0.0, 1.0);
        let timeliness = timeliness.clamp(0.0, 1.0);
        let uniqueness = uniqueness.clamp(0.0, 1.0);
        let validity = validity.clamp(0.0, 1.0);

        let sum = weights.sum();
        let overall = if sum <= f64::EPSILON {
            (completeness + consistency + timeliness + uniqueness + validity) / 5.0
        } else {
            (completeness * weights.completeness
                + consistency * weights.consistency
                + timeliness * weights.timeliness
                + uniqueness * weights.uniqueness
                + validity * weights.validity)
                / sum
        };

        Self {
            completeness,
            consistency,
            timeliness,
            uniqueness,
            validity,
            overall,
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_is_weighted_average() {
        let w = QualityWeights::default();
        let r = QualityReport::score(1.0, 1.0, 1.0, 1.0, 1.0, &w, vec![]);
        assert!((r.overall - 1.0).abs() < 1e-9);

        let r = QualityReport::score(1.0, 0.0, 0.0, 0.0, 0.0, &w, vec![]);
        assert!((r.overall - 0.30).abs() < 1e-9);
    }

    #[test]
    fn non_normalised_weights_are_normalised() {
        let w = QualityWeights {
            completeness: 3.0,
            consistency: 1.5,
            timeliness: 2.0,
            uniqueness: 1.0,
            validity: 2.5,
        };
        let r = QualityReport::score(0.5, 0.5, 0.5, 0.5, 0.5, &w, vec![]);
        assert!((r.overall - 0.5).abs() < 1e-9);
    }

    #[test]
    fn dimensions_are_clamped() {
        let r = QualityReport::score(
            2.0,
            -1.0,
            0.5,
            0.5,
            0.5,
            &QualityWeights::default(),
            vec![],
        );
        assert_eq!(r.completeness, 1.0);
        assert_eq!(r.consistency, 0.0);
    }
}
