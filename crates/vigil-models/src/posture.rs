//! Posture labels produced by the action classifier.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Debounced posture of one tracked person.
///
/// Named postures come from the active calibration profile, so the set of
/// labels is configuration data rather than a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(from = "String", into = "String")]
#[schemars(with = "String")]
pub enum PostureLabel {
    /// No posture qualified (or the person is still settling).
    #[default]
    Unknown,
    /// Required keypoints were occluded for most of the analysis window.
    Indeterminate,
    /// A configured posture such as `lying` or `dozing`.
    Named(String),
}

impl PostureLabel {
    pub const UNKNOWN: &'static str = "unknown";
    pub const INDETERMINATE: &'static str = "indeterminate";

    pub fn named(name: impl Into<String>) -> Self {
        Self::from(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            PostureLabel::Unknown => Self::UNKNOWN,
            PostureLabel::Indeterminate => Self::INDETERMINATE,
            PostureLabel::Named(name) => name,
        }
    }

    /// Returns true for a configured posture.
    pub fn is_named(&self) -> bool {
        matches!(self, PostureLabel::Named(_))
    }
}

impl From<String> for PostureLabel {
    fn from(s: String) -> Self {
        match s.as_str() {
            Self::UNKNOWN => PostureLabel::Unknown,
            Self::INDETERMINATE => PostureLabel::Indeterminate,
            _ => PostureLabel::Named(s),
        }
    }
}

impl From<&str> for PostureLabel {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<PostureLabel> for String {
    fn from(label: PostureLabel) -> Self {
        match label {
            PostureLabel::Named(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for PostureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_labels_parse() {
        assert_eq!(PostureLabel::from("unknown"), PostureLabel::Unknown);
        assert_eq!(PostureLabel::from("indeterminate"), PostureLabel::Indeterminate);
        assert_eq!(PostureLabel::from("lying"), PostureLabel::Named("lying".to_string()));
    }

    #[test]
    fn test_label_serializes_as_plain_string() {
        let json = serde_json::to_string(&PostureLabel::named("dozing")).unwrap();
        assert_eq!(json, "\"dozing\"");
        let back: PostureLabel = serde_json::from_str("\"unknown\"").unwrap();
        assert_eq!(back, PostureLabel::Unknown);
    }
}
