//! Error types for the HTTP API.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use vexa_core::amount::Credits;
use vexa_core::credentials::{AdminAuthError, CredentialError};
use vexa_core::db::DbError;
use vexa_core::ledger::{AccountId, LedgerError};

/// Errors returned by API handlers.
///
/// Billing failures carry their own status so that clients can always tell
/// whether a call was charged.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No client credential was presented.
    #[error("missing API key")]
    MissingCredential,

    /// The client credential is unknown or revoked.
    #[error("invalid API key")]
    InvalidCredential,

    /// The balance does not cover the call.
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Price of the call.
        required: Credits,
        /// Balance at the time of the call.
        available: Credits,
    },

    /// The calling account is banned.
    #[error("account {0} is banned")]
    Banned(AccountId),

    /// The addressed account does not exist.
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// The request is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The administrative routes are disabled.
    #[error("administrative access is not configured")]
    AdminDisabled,

    /// The administrative secret is missing or wrong.
    #[error("administrative authentication failed: {0}")]
    AdminUnauthorized(AdminAuthError),

    /// The database stayed locked through every retry.
    #[error("storage busy")]
    Busy,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    ///
    /// - Missing/invalid credentials: 401 Unauthorized
    /// - Insufficient balance: 402 Payment Required
    /// - Banned: 403 Forbidden
    /// - Unknown account: 404 Not Found
    /// - Admin surface disabled, storage busy: 503 Service Unavailable
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredential | Self::InvalidCredential | Self::AdminUnauthorized(_) => {
                StatusCode::UNAUTHORIZED
            },
            Self::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::Banned(_) => StatusCode::FORBIDDEN,
            Self::AccountNotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::AdminDisabled | Self::Busy => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Challenge sent with client credential rejections.
const CREDENTIAL_SCHEME: &str = "ApiKey";

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = match &self {
            Self::MissingCredential => "API key is required.".to_string(),
            Self::InvalidCredential => "API key is invalid or has been revoked.".to_string(),
            Self::InsufficientBalance { .. } => {
                "Not enough credits to fulfil the request.".to_string()
            },
            Self::Banned(_) => "Account is banned.".to_string(),
            Self::AccountNotFound(_) => "Account not found.".to_string(),
            Self::BadRequest(reason) => reason.clone(),
            Self::AdminDisabled => "Administrative access is not configured.".to_string(),
            Self::AdminUnauthorized(AdminAuthError::Missing) => {
                "Administrative key is required.".to_string()
            },
            Self::AdminUnauthorized(_) => "Administrative key is invalid.".to_string(),
            Self::Busy => "Service is busy, please retry.".to_string(),
            Self::Internal(reason) => {
                error!(error = %reason, "request failed");
                "Internal server error".to_string()
            },
        };

        let body = match &self {
            Self::InsufficientBalance {
                required,
                available,
            } => json!({ "detail": detail, "required": required, "available": available }),
            _ => json!({ "detail": detail }),
        };

        let mut response = (status, Json(body)).into_response();
        if matches!(self, Self::MissingCredential | Self::InvalidCredential) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(CREDENTIAL_SCHEME));
        }
        response
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        if err.is_contention() {
            Self::Busy
        } else {
            Self::Internal(err.to_string())
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AccountNotFound { id } => Self::AccountNotFound(id),
            LedgerError::InsufficientBalance {
                required,
                available,
            } => Self::InsufficientBalance {
                required,
                available,
            },
            LedgerError::Banned { id } => Self::Banned(id),
            LedgerError::Overflow { id, amount } => {
                Self::BadRequest(format!("balance of account {id} cannot grow by {amount}"))
            },
            LedgerError::NegativeAmount { amount } => {
                Self::BadRequest(format!("amount must not be negative: {amount}"))
            },
            LedgerError::Storage(e) => e.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Missing => Self::MissingCredential,
            CredentialError::Invalid => Self::InvalidCredential,
            CredentialError::Banned { account } => Self::Banned(account),
            CredentialError::InsufficientBalance {
                required,
                available,
            } => Self::InsufficientBalance {
                required,
                available,
            },
            CredentialError::AccountNotFound { account } => Self::AccountNotFound(account),
            CredentialError::Ledger(e) => e.into(),
            CredentialError::Storage(e) => e.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<AdminAuthError> for ApiError {
    fn from(err: AdminAuthError) -> Self {
        match err {
            AdminAuthError::NotConfigured => Self::AdminDisabled,
            AdminAuthError::Missing | AdminAuthError::Invalid => Self::AdminUnauthorized(err),
        }
    }
}
