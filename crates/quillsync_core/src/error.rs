use serde::Serialize;
use thiserror::Error;

/// Unified error type for collaboration operations
#[derive(Debug, Error)]
pub enum CollabError {
    // Capability errors
    #[error("Unsupported operation '{operation}': {reason}")]
    UnsupportedOperation {
        operation: &'static str,
        reason: String,
    },

    // Structural errors
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Unknown component '{0}': no factory is registered for it")]
    UnknownComponent(String),

    #[error("Sync re-entered while {active} was in progress (attempted {attempted})")]
    Reentrant {
        active: &'static str,
        attempted: &'static str,
    },

    #[error("Sub-document '{guid}' is not available")]
    SubModelUnavailable { guid: String },

    // CRDT transport errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl CollabError {
    /// Shorthand for an [`CollabError::InvariantViolation`].
    pub fn invariant(message: impl Into<String>) -> Self {
        CollabError::InvariantViolation(message.into())
    }

    /// Whether this error aborts the enclosing transaction.
    ///
    /// Capability and config errors are raised before any write happens.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            CollabError::InvariantViolation(_)
                | CollabError::UnknownComponent(_)
                | CollabError::Reentrant { .. }
        )
    }
}

/// Result type alias for collaboration operations
pub type Result<T> = std::result::Result<T, CollabError>;

/// A serializable representation of CollabError for IPC
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&CollabError> for SerializableError {
    fn from(err: &CollabError) -> Self {
        let kind = match err {
            CollabError::UnsupportedOperation { .. } => "UnsupportedOperation",
            CollabError::InvariantViolation(_) => "InvariantViolation",
            CollabError::UnknownComponent(_) => "UnknownComponent",
            CollabError::Reentrant { .. } => "Reentrant",
            CollabError::SubModelUnavailable { .. } => "SubModelUnavailable",
            CollabError::Crdt(_) => "Crdt",
            CollabError::ConfigParse(_) => "ConfigParse",
            CollabError::ConfigSerialize(_) => "ConfigSerialize",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<CollabError> for SerializableError {
    fn from(err: CollabError) -> Self {
        SerializableError::from(&err)
    }
}

impl CollabError {
    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_operation_message_names_the_operation() {
        let err = CollabError::UnsupportedOperation {
            operation: "load_sub_model_for",
            reason: "no loader configured".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("load_sub_model_for"));
        assert!(message.contains("no loader configured"));
    }

    #[test]
    fn test_serializable_kind() {
        let err = CollabError::invariant("slot has no inner text");
        let serialized = err.to_serializable();
        assert_eq!(serialized.kind, "InvariantViolation");
        assert!(serialized.message.contains("slot has no inner text"));
        assert!(err.is_invariant_violation());
    }
}
