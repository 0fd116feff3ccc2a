//! Kernel error taxonomy.
//!
//! Every denied capability or rejected transition surfaces as a typed
//! [`KernelError`] naming the capability or the from/to states. Opaque
//! app-side causes (factories, instance callbacks, crypto hooks) travel as
//! [`anyhow::Error`] inside the matching variant.

use crate::lifecycle::AppState;
use crate::manifest::Permission;

/// Result alias used across the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors raised by the kernel services.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// A manifest broke a validation rule. The reason names the field or rule.
    #[error("invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// An app with the same id is already catalogued.
    #[error("snapp '{0}' is already registered")]
    DuplicateId(String),

    /// No app with this id is catalogued.
    #[error("snapp '{0}' is not registered")]
    UnknownApp(String),

    /// The requested lifecycle transition is not in the valid-transition table.
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition { from: AppState, to: AppState },

    /// An operation was invoked while the app is in a state it cannot serve.
    #[error("operation '{operation}' not possible in state {state}")]
    PreconditionViolated {
        operation: &'static str,
        state: AppState,
    },

    /// A gated API was called without the matching permission grant.
    #[error("permission denied: {0}")]
    PermissionDenied(Permission),

    /// The app factory failed to produce an instance.
    #[error("snapp factory failed: {0}")]
    FactoryFailure(anyhow::Error),

    /// An instance lifecycle callback failed. The app is now in the error state.
    #[error("{callback} callback failed: {cause}")]
    CallbackFailure {
        callback: &'static str,
        cause: anyhow::Error,
    },

    /// The target app has methods registered, but not this one.
    #[error("no method '{method}' registered for snapp '{app}'")]
    UnknownMethod { app: String, method: String },

    /// No response arrived within the request timeout.
    #[error("request to '{app}.{method}' timed out after {timeout_ms} ms")]
    RequestTimeout {
        app: String,
        method: String,
        timeout_ms: u64,
    },

    /// A registered method handler failed while serving a request.
    #[error("method '{app}.{method}' failed: {cause}")]
    MethodFailure {
        app: String,
        method: String,
        cause: anyhow::Error,
    },

    /// A state store write could not be completed.
    #[error("state write failed for {namespace}/{key}: {cause}")]
    Store {
        namespace: String,
        key: String,
        cause: anyhow::Error,
    },
}
