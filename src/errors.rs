//! Error handling for the signature catalog and token core
//!
//! One error enum covers every layer. Variants are grouped the way callers
//! react to them: input problems surface to the caller untouched, crypto and
//! storage problems abort the operation, and token problems are always a
//! plain rejection.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::keys::KeyError;

/// Why a presented token was refused.
///
/// Kept on [`AvError::Token`] for logs and audit. It never appears in the
/// error's `Display` output, so callers cannot learn which check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Malformed,
    BadSignature,
    Expired,
    Revoked,
    UnknownToken,
    WrongType,
    SubjectMismatch,
    UnknownUser,
}

impl TokenRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRejection::Malformed => "malformed",
            TokenRejection::BadSignature => "bad_signature",
            TokenRejection::Expired => "expired",
            TokenRejection::Revoked => "revoked",
            TokenRejection::UnknownToken => "unknown_token",
            TokenRejection::WrongType => "wrong_type",
            TokenRejection::SubjectMismatch => "subject_mismatch",
            TokenRejection::UnknownUser => "unknown_user",
        }
    }
}

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum AvError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource} - {id}")]
    NotFound { resource: String, id: String },

    #[error("Version conflict on {resource} {id}: expected version {expected}")]
    Conflict {
        resource: String,
        id: String,
        expected: u64,
    },

    #[error("Cryptographic operation failed: {message}")]
    Crypto { message: String },

    /// The reason is deliberately left out of the message.
    #[error("Authentication failed")]
    Token { reason: TokenRejection },

    #[error("Database operation failed: {operation} - {source}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Audit operation failed: {operation}")]
    Audit { operation: String },

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result alias used across the crate
pub type AvResult<T> = Result<T, AvError>;

impl AvError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>, id: impl Into<String>, expected: u64) -> Self {
        Self::Conflict {
            resource: resource.into(),
            id: id.into(),
            expected,
        }
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    pub fn token(reason: TokenRejection) -> Self {
        Self::Token { reason }
    }

    pub fn database(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    pub fn audit(operation: impl Into<String>) -> Self {
        Self::Audit {
            operation: operation.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Token rejection reason, if this is a token error.
    pub fn token_reason(&self) -> Option<TokenRejection> {
        match self {
            AvError::Token { reason } => Some(*reason),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AvError::Conflict { .. })
    }
}

impl IntoResponse for AvError {
    fn into_response(self) -> Response {
        let status = match self {
            AvError::Validation { .. } => StatusCode::BAD_REQUEST,
            AvError::Token { .. } => StatusCode::UNAUTHORIZED,
            AvError::NotFound { .. } => StatusCode::NOT_FOUND,
            AvError::Conflict { .. } => StatusCode::CONFLICT,
            AvError::Config { .. }
            | AvError::Crypto { .. }
            | AvError::Database { .. }
            | AvError::Serialization { .. }
            | AvError::Audit { .. }
            | AvError::MutexPoisoned { .. }
            | AvError::Io { .. }
            | AvError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

/// Poison-safe mutex locking
pub trait SafeLock<T: ?Sized> {
    fn safe_lock(&self) -> AvResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> AvResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| AvError::MutexPoisoned {
            resource: std::any::type_name::<T>().to_string(),
        })
    }
}

impl From<sled::Error> for AvError {
    fn from(err: sled::Error) -> Self {
        AvError::database("sled_operation", err)
    }
}

impl From<serde_json::Error> for AvError {
    fn from(err: serde_json::Error) -> Self {
        AvError::serialization("json_operation", err)
    }
}

impl From<std::io::Error> for AvError {
    fn from(err: std::io::Error) -> Self {
        AvError::io("io_operation", err)
    }
}

impl From<KeyError> for AvError {
    fn from(err: KeyError) -> Self {
        AvError::crypto(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AvError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        let reason = match err.kind() {
            ErrorKind::ExpiredSignature => TokenRejection::Expired,
            ErrorKind::InvalidSignature => TokenRejection::BadSignature,
            _ => TokenRejection::Malformed,
        };
        AvError::token(reason)
    }
}

impl From<figment::Error> for AvError {
    fn from(err: figment::Error) -> Self {
        AvError::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_errors_do_not_reveal_reason() {
        let expired = AvError::token(TokenRejection::Expired);
        let revoked = AvError::token(TokenRejection::Revoked);

        assert_eq!(expired.to_string(), revoked.to_string());
        assert_eq!(expired.token_reason(), Some(TokenRejection::Expired));
        assert_eq!(revoked.token_reason(), Some(TokenRejection::Revoked));
    }

    #[test]
    fn status_mapping() {
        let resp = AvError::conflict("signature", "x", 3).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = AvError::token(TokenRejection::WrongType).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = AvError::validation("name", "required").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = AvError::crypto("no key").into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn jwt_error_mapping() {
        use jsonwebtoken::errors::{Error, ErrorKind};

        let err: AvError = Error::from(ErrorKind::ExpiredSignature).into();
        assert_eq!(err.token_reason(), Some(TokenRejection::Expired));

        let err: AvError = Error::from(ErrorKind::InvalidToken).into();
        assert_eq!(err.token_reason(), Some(TokenRejection::Malformed));
    }

    #[test]
    fn io_error_keeps_source() {
        use std::error::Error;

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = AvError::io("reading key", io_err);
        assert!(err.source().is_some());
    }
}
