//! API credentials for the external HTTP interface.
//!
//! Each account may hold one opaque bearer credential. Only a SHA-256 hash
//! and a short hint are persisted, so a database leak does not expose usable
//! credentials and an issued credential cannot be shown again; operators
//! rotate instead.
//!
//! The administrative surface is guarded separately by a single
//! [`AdminSecret`].

mod admin;
mod store;

use thiserror::Error;

pub use admin::{AdminAuthError, AdminSecret};
pub use store::{
    ApiCredential, Authenticated, CREDENTIAL_PREFIX, CredentialStatus, CredentialStore,
};

use crate::amount::Credits;
use crate::db::DbError;
use crate::ledger::{AccountId, LedgerError};

/// Errors from the credential layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// No credential was presented.
    #[error("API key is required")]
    Missing,

    /// The credential is malformed, unknown or revoked.
    #[error("API key is invalid or has been revoked")]
    Invalid,

    /// The owning account is banned.
    #[error("account {account} is banned")]
    Banned {
        /// The banned account.
        account: AccountId,
    },

    /// The balance does not cover the per-call cost.
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Per-call cost.
        required: Credits,
        /// Balance at the time of the call.
        available: Credits,
    },

    /// The account does not exist.
    #[error("account not found: {account}")]
    AccountNotFound {
        /// The missing account.
        account: AccountId,
    },

    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] DbError),
}
