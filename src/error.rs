use std::sync::Arc;

/// Represents a result type for operations in the SDK.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
///
/// Flag evaluation itself never fails with an `Error`: problems with flag data or the context are
/// reported through the evaluation reason (see [`ErrorKind`](crate::eval::ErrorKind)) and the
/// caller's default value is returned.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Client was configured without an SDK key and is not in offline mode.
    #[error("an SDK key is required unless the client is offline")]
    MissingSdkKey,

    /// Context data supplied by the caller is invalid.
    #[error("invalid context: {0}")]
    InvalidContext(String),

    /// Invalid base URL configuration.
    #[error("invalid events URI configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, SDK key is likely invalid")]
    Unauthorized,

    /// Event delivery failed, but the processor can keep sending events.
    #[error("event delivery failed: {0}")]
    EventDelivery(String),

    /// A previous delivery failed in a way that permanently disabled event sending.
    #[error("SDK key is invalid, event sending has been disabled")]
    InvalidSdkKey,

    /// Event processor has been closed.
    #[error("event processor is closed")]
    EventProcessorClosed,

    /// Migration operation tracker could not produce a valid event.
    #[error("invalid migration operation: {0}")]
    InvalidMigrationOp(String),

    /// Big segment store failed to answer a query.
    #[error("big segment store error: {0}")]
    BigSegmentStore(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
