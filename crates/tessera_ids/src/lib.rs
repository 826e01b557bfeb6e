//! Shared identifier wrappers for Tessera.
//!
//! Every entity the workflow persists gets its own newtype so a session id can
//! never be passed where a change request id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value)
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

define_uuid_id!(ChangeRequestId, "change request ID");
define_uuid_id!(SessionId, "session ID");
define_uuid_id!(MergeOutcomeId, "merge outcome ID");
define_uuid_id!(StagingId, "staging ID");

/// Identifiers owned by collaborators (the dataset catalog, the project
/// registry, the identity provider) are opaque strings. They only need to be
/// non-empty.
macro_rules! define_name_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(IdParseError::new(format!("{} cannot be empty", $label)));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_name_id!(DatasetId, "dataset ID");
define_name_id!(ProjectId, "project ID");
define_name_id!(UserId, "user ID");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_id_roundtrip() {
        let id = ChangeRequestId::new();
        let parsed: ChangeRequestId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_uuid_id_rejects_garbage() {
        let err = SessionId::parse("not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("session ID"));
    }

    #[test]
    fn test_name_id_trims_and_rejects_empty() {
        assert_eq!(UserId::parse("  alice ").unwrap().as_str(), "alice");
        assert!(DatasetId::parse("   ").is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let user = UserId::new("bob");
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"bob\"");
    }
}
