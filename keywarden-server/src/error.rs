//! Server error types: store taxonomy and wire mapping.
//!
//! The store wraps driver errors into a stable taxonomy without discarding
//! the original (kept on the source chain for logs). The HTTP layer rewrites
//! the chain into a single sanitized message plus a stable wire code before
//! anything crosses the wire; clients never see SQLite error text structure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use keywarden_core::proto::{self, ErrorBody};
use std::error::Error as StdError;
use thiserror::Error;

/// Errors produced by the relational store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("duplicate entry")]
    Duplicate(#[source] rusqlite::Error),

    #[error("constraint violation: {reason}")]
    Constraint {
        reason: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("bad query")]
    BadQuery(#[source] rusqlite::Error),

    #[error("transaction failed: {reason}")]
    TransactionFailed {
        reason: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("internal store error: {0}")]
    Internal(String),

    #[error("undefined store error")]
    Undefined(#[source] rusqlite::Error),
}

impl StoreError {
    pub fn constraint(reason: impl Into<String>) -> Self {
        StoreError::Constraint {
            reason: reason.into(),
            source: None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            rusqlite::Error::SqliteFailure(e, _) => match e.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => StoreError::Duplicate(err),
                _ if e.code == rusqlite::ErrorCode::ConstraintViolation => StoreError::Constraint {
                    reason: e.to_string(),
                    source: Some(err),
                },
                _ => StoreError::Undefined(err),
            },
            rusqlite::Error::SqlInputError { .. } | rusqlite::Error::InvalidColumnName(_) => {
                StoreError::BadQuery(err)
            }
            _ => StoreError::Undefined(err),
        }
    }
}

/// API-level error carrying a stable wire code.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    InvalidArgument(String),
    PermissionDenied(String),
    Internal(String),
    Unknown(String),
}

impl ApiError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => proto::code::NOT_FOUND,
            ApiError::InvalidArgument(_) => proto::code::INVALID_ARGUMENT,
            ApiError::PermissionDenied(_) => proto::code::PERMISSION_DENIED,
            ApiError::Internal(_) => proto::code::INTERNAL,
            ApiError::Unknown(_) => proto::code::UNKNOWN,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) | ApiError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::NotFound(m)
            | ApiError::InvalidArgument(m)
            | ApiError::PermissionDenied(m)
            | ApiError::Internal(m)
            | ApiError::Unknown(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.wire_code().to_string(),
            error: self.message().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let message = innermost_message(&err);
        match err {
            StoreError::NotFound => ApiError::NotFound(message),
            StoreError::Duplicate(_)
            | StoreError::Constraint { .. }
            | StoreError::BadQuery(_) => ApiError::InvalidArgument(message),
            StoreError::TransactionFailed { .. } | StoreError::Internal(_) => {
                ApiError::Internal(message)
            }
            StoreError::Undefined(_) => ApiError::Unknown(message),
        }
    }
}

/// Walk the source chain and return the innermost message.
fn innermost_message(err: &dyn StdError) -> String {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}
