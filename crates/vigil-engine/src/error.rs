//! Engine error types.

use std::fmt;
use thiserror::Error;

pub type CatalogResult<T> = Result<T, CatalogError>;
pub type EngineResult<T> = Result<T, EngineError>;

/// One problem found while validating a rule document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    /// Offending rule id, or the document section (`calibration_profiles.<name>`).
    pub rule_id: String,
    pub field: String,
    pub message: String,
}

impl RuleViolation {
    pub fn new(rule_id: impl Into<String>, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            write!(f, "{}: {}", self.rule_id, self.message)
        } else {
            write!(f, "{}.{}: {}", self.rule_id, self.field, self.message)
        }
    }
}

fn join_violations(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Rule validation failed ({} problem(s)): {}", .0.len(), join_violations(.0))]
    Validation(Vec<RuleViolation>),

    #[error("Failed to read rule source: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed rule document: {0}")]
    Json(#[from] serde_json::Error),
}

impl CatalogError {
    pub fn validation(violations: Vec<RuleViolation>) -> Self {
        Self::Validation(violations)
    }

    /// Violations carried by a validation failure.
    pub fn violations(&self) -> &[RuleViolation] {
        match self {
            CatalogError::Validation(v) => v,
            _ => &[],
        }
    }

    /// Distinct rule ids named by a validation failure, in report order.
    pub fn offending_rules(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for v in self.violations() {
            if !ids.contains(&v.rule_id.as_str()) {
                ids.push(&v.rule_id);
            }
        }
        ids
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// State that should be impossible; stops only the affected stream.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("Unknown calibration profile: {0}")]
    UnknownProfile(String),
}

impl EngineError {
    pub fn internal_invariant(msg: impl Into<String>) -> Self {
        Self::InternalInvariant(msg.into())
    }

    /// Fatal errors stop the stream that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::InternalInvariant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_names_every_rule() {
        let err = CatalogError::validation(vec![
            RuleViolation::new("fall", "detection_params.min_ratio", "is required"),
            RuleViolation::new("phone", "required_models", "unknown model 'yolo'"),
            RuleViolation::new("fall", "cooldown", "needs a clearing condition"),
        ]);

        let msg = err.to_string();
        assert!(msg.contains("3 problem(s)"));
        assert!(msg.contains("fall.detection_params.min_ratio: is required"));
        assert!(msg.contains("phone.required_models"));
        assert_eq!(err.offending_rules(), vec!["fall", "phone"]);
    }
}
