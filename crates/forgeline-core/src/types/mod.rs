//! Core identifier types used throughout Forgeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Tenant identifier validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TenantIdError {
    /// Tenant ID is empty or whitespace.
    #[error("Tenant ID is empty")]
    Empty,

    /// Tenant ID is not a UUID.
    #[error("Tenant ID is not a valid UUID: {0}")]
    Malformed(String),

    /// Tenant ID is the nil UUID.
    #[error("Tenant ID must not be the nil UUID")]
    Nil,
}

/// Identifier of an isolated customer/organization boundary.
///
/// Stored as the raw string supplied by the caller so that malformed
/// values survive long enough to be rejected by isolation checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    /// Create a new tenant ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random tenant ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse the tenant ID as a non-nil UUID.
    ///
    /// # Errors
    ///
    /// Returns error if the ID is empty, not a UUID, or the nil UUID.
    pub fn validate(&self) -> Result<Uuid, TenantIdError> {
        let raw = self.0.trim();
        if raw.is_empty() {
            return Err(TenantIdError::Empty);
        }
        let parsed =
            Uuid::parse_str(raw).map_err(|_| TenantIdError::Malformed(self.0.clone()))?;
        if parsed.is_nil() {
            return Err(TenantIdError::Nil);
        }
        Ok(parsed)
    }
}

/// Generates the string newtype boilerplate shared by the other identifiers.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

string_id!(
    /// Identifier of a work item (ticket).
    TicketId
);

string_id!(
    /// Identifier of a source repository.
    RepositoryId
);

string_id!(
    /// Identifier of a single graph-node invocation.
    ExecutionId
);

string_id!(
    /// Identifier of a persisted checkpoint.
    CheckpointId
);

string_id!(
    /// Identifier of a workflow graph (e.g. `planning`).
    WorkflowId
);

/// Token usage statistics from an LLM call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input/prompt tokens.
    pub input_tokens: u64,
    /// Output/completion tokens.
    pub output_tokens: u64,
    /// Cache read tokens (if applicable).
    pub cache_read_tokens: Option<u64>,
    /// Cache write tokens (if applicable).
    pub cache_write_tokens: Option<u64>,
}

impl TokenUsage {
    /// Get total tokens used.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_validation() {
        assert!(TenantId::generate().validate().is_ok());
        assert_eq!(TenantId::new("").validate(), Err(TenantIdError::Empty));
        assert_eq!(TenantId::new("   ").validate(), Err(TenantIdError::Empty));
        assert!(matches!(
            TenantId::new("acme-corp").validate(),
            Err(TenantIdError::Malformed(_))
        ));
        assert_eq!(
            TenantId::new(Uuid::nil().to_string()).validate(),
            Err(TenantIdError::Nil)
        );
    }

    #[test]
    fn test_ids_display() {
        assert_eq!(TicketId::new("T-42").to_string(), "T-42");
        assert_eq!(WorkflowId::new("planning").as_ref(), "planning");
        assert_ne!(ExecutionId::generate(), ExecutionId::generate());
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 120,
            output_tokens: 30,
            ..Default::default()
        };
        assert_eq!(usage.total(), 150);
    }
}
