//! Error types for the FIS operator
//!
//! Errors carry the resource name and, for provider failures, the AWS
//! service and operation that failed. `is_retryable` decides whether a
//! reconcile error is requeued quickly or left for a spec change.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for FIS operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The resource spec is invalid
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid spec
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.actions[0].target")
        field: Option<String>,
    },

    /// Required configuration (role, cluster identifier, template reference) is missing
    #[error("configuration error for {resource}: {message}")]
    Configuration {
        /// Name of the resource being reconciled
        resource: String,
        /// What is missing or unresolvable
        message: String,
    },

    /// AWS API error
    #[error("provider error [{service}:{operation}]: {message}")]
    Provider {
        /// AWS service (fis, iam, eks)
        service: String,
        /// API operation that failed
        operation: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A dependency exists but has not converged yet
    #[error("{resource} is not ready: {message}")]
    NotReady {
        /// The resource being waited on
        resource: String,
        /// What it is waiting for
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error for a resource
    pub fn configuration(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable provider error
    pub fn provider(
        service: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            service: service.into(),
            operation: operation.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (rejected request, bad input)
    pub fn provider_permanent(
        service: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            service: service.into(),
            operation: operation.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a not-ready error for a dependency
    pub fn not_ready(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, configuration and serialization errors need a spec change.
    /// Not-ready errors resolve on their own once the dependency converges.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is an optimistic-concurrency conflict: re-read and retry
                match source {
                    kube::Error::Api(ae) if ae.code == 409 => true,
                    kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                    _ => true,
                }
            }
            Error::Validation { .. } => false,
            Error::Configuration { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::NotReady { .. } => true,
            Error::Serialization { .. } => false,
        }
    }

    /// True for errors that leave the resource in a terminal failed state until its spec changes
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. } | Error::Configuration { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}
