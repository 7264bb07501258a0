//! Error types for the Rewind operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the object or backend it relates to so that log
//! lines and request status entries can be traced back to their source.

use thiserror::Error;

/// Main error type for Rewind operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a resource spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Backup storage (object store) error
    #[error("storage error [{location}]: {message}")]
    Storage {
        /// Name of the backup storage location
        location: String,
        /// Description of what failed
        message: String,
    },

    /// Plugin capability error (volume snapshotter, delete item action)
    #[error("plugin error [{plugin}]: {message}")]
    Plugin {
        /// Plugin or provider name
        plugin: String,
        /// Description of what failed
        message: String,
    },

    /// Client or credential configuration error
    #[error("configuration error [{context}]: {message}")]
    Config {
        /// Where the configuration was read from (e.g., "srccluster", "kubeconfig")
        context: String,
        /// Description of what's wrong
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized
        kind: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "sweeper")
        context: String,
    },
}

impl Error {
    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a storage error for a specific backup storage location
    pub fn storage_for(location: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            location: location.into(),
            message: msg.into(),
        }
    }

    /// Create a plugin error for a named plugin or provider
    pub fn plugin(plugin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: kind.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, configuration and serialization errors need a spec or
    /// secret fix and are not retried. Kubernetes errors are retried unless
    /// the API server rejected the request with a 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Storage { .. } => true,
            Error::Plugin { .. } => true,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Storage { location, .. } => Some(location),
            Error::Plugin { plugin, .. } => Some(plugin),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Config { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: a missing snapshot location is a terminal validation failure
    #[test]
    fn story_validation_error_names_resource() {
        let err = Error::validation_for("vsl-1", "volume snapshot location vsl-1 not found");
        assert!(err.to_string().contains("validation error for vsl-1"));
        assert_eq!(err.resource(), Some("vsl-1"));
        assert!(!err.is_retryable());
    }

    /// Story: storage and plugin failures during the cascade are retryable
    #[test]
    fn story_cascade_errors_are_retryable() {
        let err = Error::storage_for("primary", "bucket unreachable");
        assert!(err.to_string().contains("[primary]"));
        assert_eq!(err.resource(), Some("primary"));
        assert!(err.is_retryable());

        let err = Error::plugin("aws", "snapshot snap-1 not found");
        assert!(err.to_string().contains("plugin error [aws]"));
        assert!(err.is_retryable());
    }

    /// Story: a malformed credential secret is a configuration error
    #[test]
    fn story_config_errors_need_operator_fix() {
        let err = Error::config("srccluster", "invalid proxy URL");
        assert_eq!(err.context(), Some("srccluster"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kube_error_retryability() {
        let err: Error = api_error(404).into();
        assert!(!err.is_retryable());

        let err: Error = api_error(503).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_contexts() {
        let err = Error::internal_with_context("sweeper", "x");
        assert_eq!(err.context(), Some("sweeper"));
        assert_eq!(err.resource(), None);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_serialization_for_kind() {
        let err = Error::serialization_for_kind("VolumeSnapshot", "missing field");
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind, "VolumeSnapshot"),
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }
}
