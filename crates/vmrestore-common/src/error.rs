//! Error types for the VM restore controller
//!
//! Errors are structured with fields to aid debugging in production.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for restore operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A referenced snapshot or content is missing, not ready, or malformed
    #[error("validation error for {restore}: {message}")]
    Validation {
        /// Name of the restore being validated
        restore: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.patches[0]")
        field: Option<String>,
    },

    /// The target machine is locked by a different restore
    #[error("target {target} is locked by restore {holder}")]
    Conflict {
        /// Name of the target machine
        target: String,
        /// Name of the restore currently holding the lock
        holder: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A structural patch could not be parsed or applied
    #[error("patch error at index {index}: {message}")]
    Patch {
        /// Position of the patch in `spec.patches`
        index: usize,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "storage")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without restore context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            restore: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with restore context
    pub fn validation_for(restore: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            restore: restore.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with restore context and field path
    pub fn validation_for_field(
        restore: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            restore: restore.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a lock conflict error
    pub fn conflict(target: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::Conflict {
            target: target.into(),
            holder: holder.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a patch error for the patch at `index`
    pub fn patch(index: usize, msg: impl Into<String>) -> Self {
        Self::Patch {
            index,
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
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
    /// Validation, patch and serialization errors need a user fix.
    /// Kubernetes errors are retried unless they are a 4xx other than
    /// conflict (409) or throttling (429).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Conflict { .. } => true,
            Error::Serialization { .. } => false,
            Error::Patch { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True if this is an optimistic-concurrency conflict from the API server
    pub fn is_api_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True if the API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True if the API server reported the object as already existing
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
