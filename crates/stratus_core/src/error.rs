//! Error types for the core module.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while declaring or running a stack.
///
/// Failures fan out to every continuation of a deferred value, so the error
/// is `Clone` and carries foreign errors as strings.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreError {
    #[error("Declaration error: {0}")]
    Declaration(String),

    #[error("Provider error on '{resource}': {message}")]
    Provider { resource: String, message: String },

    #[error("Timeout on '{resource}' after {after:?}")]
    Timeout { resource: String, after: Duration },

    #[error("Deferred value already settled")]
    AlreadySettled,

    #[error("'{resource}' not applied: dependency '{dependency}' failed: {source}")]
    DependencyFailed {
        resource: String,
        dependency: String,
        source: Box<CoreError>,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Value never settled: {0}")]
    Unresolved(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl CoreError {
    /// Build a provider error for a resource.
    pub fn provider(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Whether this failure was inherited from an upstream resource.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::DependencyFailed { .. })
    }

    /// Name of the resource this error was raised for, if any.
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::Provider { resource, .. }
            | Self::Timeout { resource, .. }
            | Self::DependencyFailed { resource, .. } => Some(resource),
            _ => None,
        }
    }

    /// Name of the resource where the failure originated, if known.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::Provider { resource, .. } | Self::Timeout { resource, .. } => Some(resource),
            Self::DependencyFailed { source, dependency, .. } => {
                source.origin().or(Some(dependency.as_str()))
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_follows_dependency_chain() {
        let root = CoreError::provider("vnet", "quota exceeded");
        let mid = CoreError::DependencyFailed {
            resource: "subnet".to_string(),
            dependency: "vnet".to_string(),
            source: Box::new(root),
        };
        let leaf = CoreError::DependencyFailed {
            resource: "cluster".to_string(),
            dependency: "subnet".to_string(),
            source: Box::new(mid),
        };

        assert_eq!(leaf.origin(), Some("vnet"));
        assert!(leaf.is_dependency_failure());
        assert!(leaf.to_string().contains("quota exceeded"));
    }
}
