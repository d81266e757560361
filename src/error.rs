use std::error::Error;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed error used for opaque causes (transport errors, backend SDK errors).
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Marker carried by every error that upstream redelivery logic may act on.
///
/// Callers detect it with [`is_retriable`], which walks the `source()` chain.
#[derive(Debug)]
pub struct Retriable {
    cause: Option<BoxError>,
}

impl Retriable {
    /// Wrap a transient cause.
    pub fn new(cause: impl Into<BoxError>) -> Self {
        Self {
            cause: Some(cause.into()),
        }
    }

    /// A retriable marker without an underlying cause (explicit RETRY replies).
    pub fn bare() -> Self {
        Self { cause: None }
    }
}

impl fmt::Display for Retriable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "retriable error: {}", cause),
            None => f.write_str("retriable error"),
        }
    }
}

impl Error for Retriable {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Returns `true` if `err` or any error in its source chain is [`Retriable`].
pub fn is_retriable(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<Retriable>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// Error returned when a resiliency policy's per-attempt timeout elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {0:?}")]
pub struct TimeoutElapsed(pub Duration);

/// Errors produced by a backend component (or by the policy wrapped around it).
#[derive(Debug, Error)]
pub enum ComponentError {
    /// The backend rejected the request.
    #[error("rejected by backend: {0}")]
    Rejected(String),
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The component does not implement the operation.
    #[error("operation not supported by component: {0}")]
    Unsupported(&'static str),
    /// The resiliency policy timed out the call.
    #[error(transparent)]
    Timeout(#[from] TimeoutElapsed),
    /// Any other backend error.
    #[error(transparent)]
    Other(BoxError),
}

/// Whether a failed attempt is worth repeating under a retry policy.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for ComponentError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ComponentError::Unavailable(_) | ComponentError::Timeout(_)
        )
    }
}

/// Errors surfaced by the publish path.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// No component is registered under this name.
    #[error("pubsub {pubsub_name} not found")]
    NotFound { pubsub_name: String },
    /// Scoping rules deny the topic for this app.
    #[error("topic {topic} is not allowed for app id {app_id}")]
    NotAllowed { topic: String, app_id: String },
    /// The request failed validation before reaching the backend.
    #[error("invalid publish request: {0}")]
    InvalidRequest(String),
    /// The backend (or its resiliency policy) failed; passed through unmodified.
    #[error(transparent)]
    Component(#[from] ComponentError),
}

impl PubSubError {
    /// Whether the caller may retry the publish later.
    pub fn is_retriable(&self) -> bool {
        match self {
            PubSubError::Component(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// A delivery attempt that resolved to `Retry`.
///
/// Always carries the [`Retriable`] marker as its source so upstream
/// redelivery logic can requeue the message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DeliveryError {
    message: String,
    #[source]
    marker: Retriable,
}

impl DeliveryError {
    /// A retry with an underlying transport cause.
    pub fn retriable(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            marker: Retriable::new(cause),
        }
    }

    /// A retry requested by the application itself.
    pub fn retry_requested(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            marker: Retriable::bare(),
        }
    }

    /// The diagnostic text of this error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Always `true`: every delivery error is a redelivery request.
    pub fn is_retriable(&self) -> bool {
        true
    }
}

impl Transient for DeliveryError {
    fn is_transient(&self) -> bool {
        true
    }
}

impl From<TimeoutElapsed> for DeliveryError {
    fn from(err: TimeoutElapsed) -> Self {
        DeliveryError::retriable("delivery to app timed out", err)
    }
}
