//! Identifier newtypes shared across crates.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create from an existing string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Get the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of one continuously analyzed camera/video source.
    StreamId
);

string_id!(
    /// Identifier of a detection rule, unique within a rule set.
    RuleId
);

string_id!(
    /// Identifier of a perception model registered with the batcher.
    ModelId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_transparently() {
        let id = StreamId::from("cam-01");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"cam-01\"");

        let parsed: RuleId = serde_json::from_str("\"fall\"").unwrap();
        assert_eq!(parsed.as_str(), "fall");
        assert_eq!(ModelId::new("pose").to_string(), "pose");
    }
}
