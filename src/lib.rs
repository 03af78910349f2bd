use thiserror::Error;

/// Expose all controller components used by main
pub mod operator;
pub mod resources;

/// Status conditions shared by every managed resource
pub mod conditions;

/// Per-device mutual exclusion
pub mod locker;
pub use locker::{DeviceLock, LockError, ResourceLocker};

pub mod config;
pub use config::OperatorConfig;

/// Device providers and their capabilities
pub mod provider;

/// Access to the stored custom resources
pub mod store;

// Internal only
mod reconcilers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Field manager used for every write made by the operator
pub const MANAGER: &str = "network-operator";

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The desired state cannot be reached without a change to the resource or its references
    #[error(transparent)]
    Terminal(#[from] TerminalError),

    /// The provider failed in a way that may heal on its own
    #[error("provider error: {0}")]
    Provider(String),

    #[error("Illegal{kind} {name}: {reason}")]
    IllegalResource {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::Terminal(t) => t.reason.to_lowercase(),
            Error::Lock(_) => "lock".into(),
            Error::Provider(_) => "provider".into(),
            Error::KubeError(_) => "kube".into(),
            Error::FinalizerError(_) => "finalizer".into(),
            Error::IllegalResource { kind, .. } => format!("illegal{}", kind.to_lowercase()),
            Error::SerializationError(_) => "serialization".into(),
            Error::InvalidConfig(_) => "config".into(),
        }
    }

    /// Whether retrying without an external change is pointless
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::Terminal(_) => true,
            Error::FinalizerError(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(inner)
                | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner.is_terminal(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Whether this is a device lock held by someone else
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Lock(LockError::AlreadyHeld { .. }) => true,
            Error::FinalizerError(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(inner)
                | kube::runtime::finalizer::Error::CleanupFailed(inner) => {
                    inner.is_lock_contention()
                }
                _ => false,
            },
            _ => false,
        }
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn illegal(kind: impl Into<String>, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IllegalResource {
            kind: kind.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Marker for failures that only a change to the desired state can fix.
///
/// Validation code and providers both produce these; the reason ends up
/// verbatim on the resource's `Configured` condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TerminalError {
    pub reason: String,
    pub message: String,
}

impl TerminalError {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }
}
