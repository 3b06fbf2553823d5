//! Unified application error model.
//! One enum is shared by the session layer, the permission gate, the realtime synchronizer and
//! the portal entry points, so views can branch on a single taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    /// Bad credentials or no signed-in identity. User-correctable.
    Auth { code: String, message: String },
    /// Role resolution against the user directory failed.
    Directory { code: String, message: String },
    /// Refused by the permission gate before any store call.
    PermissionDenied { code: String, message: String },
    /// A live query broke; the consuming view must stop treating its data as live.
    Subscription { code: String, message: String },
    NotFound { code: String, message: String },
    UserInput { code: String, message: String },
    Conflict { code: String, message: String },
    Unavailable { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Auth { code, .. }
            | AppError::Directory { code, .. }
            | AppError::PermissionDenied { code, .. }
            | AppError::Subscription { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::UserInput { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Unavailable { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Auth { message, .. }
            | AppError::Directory { message, .. }
            | AppError::PermissionDenied { message, .. }
            | AppError::Subscription { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::UserInput { message, .. }
            | AppError::Conflict { message, .. }
            | AppError::Unavailable { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn directory<S: Into<String>>(code: S, msg: S) -> Self { AppError::Directory { code: code.into(), message: msg.into() } }
    pub fn denied<S: Into<String>>(code: S, msg: S) -> Self { AppError::PermissionDenied { code: code.into(), message: msg.into() } }
    pub fn subscription<S: Into<String>>(code: S, msg: S) -> Self { AppError::Subscription { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn conflict<S: Into<String>>(code: S, msg: S) -> Self { AppError::Conflict { code: code.into(), message: msg.into() } }
    pub fn unavailable<S: Into<String>>(code: S, msg: S) -> Self { AppError::Unavailable { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::Auth { .. } => 401,
            AppError::PermissionDenied { .. } => 403,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::Directory { .. } | AppError::Subscription { .. } => 502,
            AppError::Unavailable { .. } => 503,
            AppError::Internal { .. } => 500,
        }
    }

    /// Errors the person at the keyboard can fix without a retry of the backend.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            AppError::Auth { .. } | AppError::UserInput { .. } | AppError::Conflict { .. } | AppError::PermissionDenied { .. }
        )
    }

    pub fn is_permission_denied(&self) -> bool { matches!(self, AppError::PermissionDenied { .. }) }
    pub fn is_not_found(&self) -> bool { matches!(self, AppError::NotFound { .. }) }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal { code: "internal_error".into(), message: err.to_string() }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::UserInput { code: "decode_failed".into(), message: err.to_string() }
    }
}

/// Failures reported by an identity provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("an account already exists for {0}")]
    AccountExists(String),
    #[error("identity provider unreachable")]
    NetworkUnavailable,
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        let message = err.to_string();
        match err {
            IdentityError::InvalidCredentials => AppError::Auth { code: "invalid_credentials".into(), message },
            IdentityError::AccountExists(_) => AppError::Conflict { code: "account_exists".into(), message },
            IdentityError::NetworkUnavailable => AppError::Unavailable { code: "network_unavailable".into(), message },
        }
    }
}
