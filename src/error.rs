//! # Error Handling for sidecall
//!
//! This module defines the centralized error handling for the crate. It
//! provides a unified [`Result`] type, the [`Error`] enum surfaced by every
//! public operation, and the transport-agnostic status taxonomy used by the
//! retry engine to classify failures.
//!
//! ## Status codes
//!
//! The crate never couples to a concrete transport's error type. Transports
//! attach an abstract [`StatusCode`] to a failure by returning (or wrapping)
//! an [`RpcStatus`]; classification walks the error's `source()` chain
//! looking for one. A failure that carries no recognized code anywhere in
//! its chain is classified as [`StatusCode::Unknown`].
//!
//! ## The surfaced failure type
//!
//! RPC failures surface as [`ApiError`], which carries the classified status
//! code, a message, and the underlying failure when one exists. Paging and
//! settings misuse surface as [`Error::Validation`].
//!
//! ```rust
//! use sidecall::{ApiError, RpcStatus, StatusCode};
//!
//! let status = RpcStatus::new(StatusCode::Unavailable).with_message("backend drain");
//! let err = ApiError::from_error(Box::new(status));
//! assert_eq!(err.code(), StatusCode::Unavailable);
//! assert_eq!(err.to_string(), "UNAVAILABLE: backend drain");
//! ```

use std::sync::Arc;

use thiserror::Error;

/// Boxed transport-facing error, shared with the tower ecosystem.
pub type BoxError = tower::BoxError;

/// A reference-counted error, used when one failure must be fanned out to
/// several waiters (bundle exception splitting).
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized `Result` type for sidecall operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport-agnostic status code attached to RPC failures.
///
/// Mapping a concrete transport's failures into these codes is the job of an
/// adapter at the primitive-callable boundary; the decorator layers only
/// ever see this enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// The wire-conventional name of this code.
    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A coded failure produced at the transport boundary.
///
/// Adapters wrap their transport's failures in an `RpcStatus` (or chain one
/// as a `source`) so the retry engine can classify them.
#[derive(Debug, Clone)]
pub struct RpcStatus {
    code: StatusCode,
    message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for RpcStatus {}

/// The single surfaced RPC failure.
///
/// Carries the classified [`StatusCode`], a human-readable message derived
/// from the underlying failure, and the underlying failure itself when one
/// exists. Cloneable so a single bundle failure can complete many waiters.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    code: StatusCode,
    message: String,
    #[source]
    source: Option<SharedError>,
}

impl ApiError {
    /// Build an `ApiError` with an explicit code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Classify a transport failure.
    ///
    /// Walks the failure's `source()` chain for an [`RpcStatus`] (or an
    /// already-classified `ApiError`); failures carrying no recognized code
    /// map to [`StatusCode::Unknown`] with the failure's own text.
    pub fn from_error(error: BoxError) -> Self {
        match error.downcast::<ApiError>() {
            Ok(api) => *api,
            Err(error) => {
                let code = find_status_code(error.as_ref()).unwrap_or(StatusCode::Unknown);
                let message = error.to_string();
                Self {
                    code,
                    message,
                    source: Some(Arc::from(error)),
                }
            }
        }
    }

    /// Classify a shared failure (bundle exception fan-out path).
    pub fn from_shared(error: SharedError) -> Self {
        let code = find_status_code(error.as_ref()).unwrap_or(StatusCode::Unknown);
        let message = error.to_string();
        Self {
            code,
            message,
            source: Some(error),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Walk an error chain looking for a recognized status code.
pub(crate) fn find_status_code(error: &(dyn std::error::Error + 'static)) -> Option<StatusCode> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(e) = current {
        if let Some(status) = e.downcast_ref::<RpcStatus>() {
            return Some(status.code());
        }
        if let Some(api) = e.downcast_ref::<ApiError>() {
            return Some(api.code());
        }
        current = e.source();
    }
    None
}

/// The main error enum for sidecall.
#[derive(Debug, Error)]
pub enum Error {
    /// An RPC failed; the classified code and the underlying failure are
    /// carried by the [`ApiError`].
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A precondition of the paging API or a settings builder was violated.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A submission was attempted against a closed bundler factory.
    #[error("bundler factory already closed")]
    BundlerClosed,
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// The status code of the failure, if it is an RPC failure.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            Error::Api(api) => Some(api.code()),
            _ => None,
        }
    }

    /// Recover an `Error` that crossed the boxed transport boundary, wrapping
    /// anything else as a classified [`ApiError`].
    pub(crate) fn from_box(error: BoxError) -> Self {
        match error.downcast::<Error>() {
            Ok(err) => *err,
            Err(error) => Error::Api(ApiError::from_error(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_display_uses_wire_names() {
        assert_eq!(StatusCode::DeadlineExceeded.to_string(), "DEADLINE_EXCEEDED");
        assert_eq!(StatusCode::Unavailable.to_string(), "UNAVAILABLE");
    }

    #[test]
    fn rpc_status_display_includes_message() {
        let status = RpcStatus::new(StatusCode::FailedPrecondition).with_message("known");
        assert_eq!(status.to_string(), "FAILED_PRECONDITION: known");

        let bare = RpcStatus::new(StatusCode::Aborted);
        assert_eq!(bare.to_string(), "ABORTED");
    }

    #[test]
    fn classification_finds_code_in_chain() {
        #[derive(Debug, Error)]
        #[error("outer wrapper")]
        struct Wrapper(#[source] RpcStatus);

        let wrapped: BoxError = Box::new(Wrapper(
            RpcStatus::new(StatusCode::Unavailable).with_message("backend drain"),
        ));
        let api = ApiError::from_error(wrapped);
        assert_eq!(api.code(), StatusCode::Unavailable);
        assert_eq!(api.message(), "outer wrapper");
    }

    #[test]
    fn opaque_errors_classify_as_unknown() {
        let opaque: BoxError = "foobar".into();
        let api = ApiError::from_error(opaque);
        assert_eq!(api.code(), StatusCode::Unknown);
        assert_eq!(api.to_string(), "foobar");
    }

    #[test]
    fn from_box_recovers_crate_errors() {
        let boxed: BoxError = Box::new(Error::BundlerClosed);
        assert!(matches!(Error::from_box(boxed), Error::BundlerClosed));

        let api: BoxError = Box::new(ApiError::new(StatusCode::NotFound, "missing"));
        let err = Error::from_box(api);
        assert_eq!(err.code(), Some(StatusCode::NotFound));
    }

    #[test]
    fn api_error_preserves_cause() {
        let status = RpcStatus::new(StatusCode::Unavailable).with_message("foobar");
        let api = ApiError::from_error(Box::new(status));
        assert!(api.to_string().contains("foobar"));
        let cause = std::error::Error::source(&api).expect("cause retained");
        assert!(cause.to_string().contains("foobar"));
    }
}
