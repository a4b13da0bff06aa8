//! Service error taxonomy and its HTTP mapping.
use std::fmt;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::auth::{delegate::DelegateError, jwt::TokenError, password::PasswordError};

/// Which unique field a registration or profile change collided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictField {
    Email,
    Username,
}

impl fmt::Display for ConflictField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictField::Email => f.write_str("email"),
            ConflictField::Username => f.write_str("username"),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed token")]
    Malformed,
    #[error("expired token")]
    Expired,
    #[error("bad token signature")]
    BadSignature,
    #[error("token does not grant access to this resource")]
    Forbidden,
}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Missing => AuthError::MissingToken,
            TokenError::Expired => AuthError::Expired,
            TokenError::BadSignature => AuthError::BadSignature,
            TokenError::Malformed | TokenError::Sign(_) => AuthError::Malformed,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid credentials")]
    InvalidCredential,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0} is already in use")]
    Conflict(ConflictField),

    #[error("new password must differ from the current password")]
    DuplicatePassword,

    #[error("password service timed out")]
    UpstreamTimeout,

    #[error("password service failed: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Auth(AuthError::MissingToken) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Auth(_) | AppError::InvalidCredential => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::DuplicatePassword => StatusCode::CONFLICT,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VAL_001",
            AppError::Auth(AuthError::MissingToken) => "AUTH_001",
            AppError::Auth(_) => "AUTH_002",
            AppError::InvalidCredential => "AUTH_003",
            AppError::NotFound(_) => "NF_001",
            AppError::Conflict(_) => "CONFLICT_001",
            AppError::DuplicatePassword => "CONFLICT_002",
            AppError::UpstreamTimeout => "UPSTREAM_001",
            AppError::Upstream(_) => "UPSTREAM_002",
            AppError::Storage(_) => "INT_001",
            AppError::Internal(_) => "INT_002",
        }
    }

    /// Message safe to hand to the client. Authorization failures all read the same,
    /// and storage/upstream internals are never echoed.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Auth(AuthError::MissingToken) => "missing bearer token".to_string(),
            AppError::Auth(_) => "forbidden".to_string(),
            AppError::Upstream(_) => "password service unavailable".to_string(),
            AppError::Storage(_) | AppError::Internal(_) => {
                "an internal server error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<DelegateError> for AppError {
    fn from(e: DelegateError) -> Self {
        match e {
            DelegateError::Timeout => AppError::UpstreamTimeout,
            DelegateError::EmptyReply
            | DelegateError::MalformedReply(_)
            | DelegateError::Transport(_) => AppError::Upstream(e.to_string()),
            DelegateError::Hash(inner) => inner.into(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match &rejection {
            JsonRejection::JsonDataError(e) => format!("invalid request body: {}", e.body_text()),
            JsonRejection::JsonSyntaxError(_) => "request body is not valid JSON".to_string(),
            JsonRejection::MissingJsonContentType(_) => {
                "expected Content-Type: application/json".to_string()
            }
            other => format!("unreadable request body: {}", other.body_text()),
        };
        AppError::Validation(message)
    }
}

impl From<PasswordError> for AppError {
    fn from(e: PasswordError) -> Self {
        match e {
            PasswordError::EmptyInput => AppError::Validation("password must not be empty".into()),
            PasswordError::MalformedHash | PasswordError::Hash(_) => {
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.client_message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
