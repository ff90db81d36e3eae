//! Error types for the snapshot controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the object it concerns (a `namespace/name` key for
//! requests, a bare name for contents) alongside the underlying cause.

use k8s_openapi::api::storage::v1::VolumeError;
use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Message prefix marking an error as an internal persistence failure.
///
/// A request whose recorded error carries this prefix, or
/// [`DRIVER_RETRY_MSG`], is still eligible for creation retries; every other
/// recorded error is terminal for creation.
pub const CONTROLLER_UPDATE_FAIL_MSG: &str = "snapshot controller failed to update";

/// Marker recorded with a driver failure that may clear on its own, such as
/// a timed out call or an unavailable backend.
pub const DRIVER_RETRY_MSG: &str = "snapshot driver call did not complete";

/// Main error type for snapshot controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency failure: the stored object moved on
    #[error("conflict updating {kind} {name}: object has been modified")]
    Conflict {
        /// Resource kind (VolumeSnapshot, VolumeSnapshotContent, ...)
        kind: String,
        /// Object key
        name: String,
    },

    /// The object does not exist in the store
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Object key
        name: String,
    },

    /// A create collided with an existing object of the same name
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Object key
        name: String,
    },

    /// Invalid binding, class or template configuration
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Object the validation failed for
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.snapshotClassName")
        field: Option<String>,
    },

    /// Snapshot driver call failed
    #[error("driver error for {object}: {message}")]
    Driver {
        /// Object the driver call was made for
        object: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// The controller could not persist a change it already committed to
    #[error("{} {object} on API server: {message}", CONTROLLER_UPDATE_FAIL_MSG)]
    ControllerUpdate {
        /// Object that could not be updated
        object: String,
        /// Underlying failure
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "operation", "queue", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a conflict error for the given kind and key
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-found error for the given kind and key
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for the given kind and key
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without object context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable driver error
    pub fn driver(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Driver {
            object: object.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable driver error (e.g., the driver rejected the parameters)
    pub fn driver_permanent(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Driver {
            object: object.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an internal persistence failure carrying the retry marker
    pub fn controller_update(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ControllerUpdate {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
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
    /// Validation and serialization errors are not retryable (require a fix
    /// to the objects involved). Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is a version race and always worth another pass
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => true,
            Error::AlreadyExists { .. } => false,
            Error::Validation { .. } => false,
            Error::Driver { retryable, .. } => *retryable,
            Error::ControllerUpdate { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for optimistic concurrency failures from the store
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason != "AlreadyExists",
            _ => false,
        }
    }

    /// True when the store reported the object as missing
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True when a create collided with an existing object
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Get the object key if this error is associated with a specific object
    pub fn object(&self) -> Option<&str> {
        match self {
            Error::Conflict { name, .. }
            | Error::NotFound { name, .. }
            | Error::AlreadyExists { name, .. } => Some(name),
            Error::Validation { object, .. }
            | Error::Driver { object, .. }
            | Error::ControllerUpdate { object, .. } => Some(object),
            Error::Kube { .. } | Error::Serialization { .. } | Error::Internal { .. } => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Whether a recorded status error still allows creation to be retried
pub fn is_retryable_status_error(err: &VolumeError) -> bool {
    err.message
        .as_deref()
        .is_some_and(|m| m.contains(CONTROLLER_UPDATE_FAIL_MSG) || m.contains(DRIVER_RETRY_MSG))
}
