//! Session error types.

use thiserror::Error;

use super::state::Namespace;
use crate::db::DbError;
use crate::ledger::{AccountId, LedgerError};

/// Errors that can occur while reading, writing or dispatching session state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] DbError),

    /// Account lookup failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The account is banned; its flow state has been cleared.
    #[error("account {account} is banned")]
    Banned {
        /// The banned account.
        account: AccountId,
    },

    /// A stored token could not be decoded into a known flow state.
    #[error("invalid session token: {token:?}")]
    InvalidToken {
        /// The raw stored token.
        token: String,
    },

    /// A parameter cannot be embedded in a token.
    #[error("parameter cannot be embedded in a session token: {value:?}")]
    InvalidParameter {
        /// The rejected parameter.
        value: String,
    },

    /// The owning handler failed; the account's state has been cleared.
    #[error("{namespace} flow failed: {source}")]
    Handler {
        /// Namespace of the failing handler.
        namespace: Namespace,
        /// The handler's error.
        #[source]
        source: FlowError,
    },
}

/// Errors returned by flow handlers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FlowError {
    /// Mid-flow data is gone; the user has to start over.
    #[error(transparent)]
    Scratch(#[from] ScratchError),

    /// Ledger operation failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The input could not be used at this step.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Errors from the in-memory scratch store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ScratchError {
    /// The payload is missing or expired (for example after a restart).
    #[error("mid-flow data expired, please start over")]
    Expired,

    /// The store is full and no expired entry could be evicted.
    #[error("scratch store is full ({max_entries} entries)")]
    Full {
        /// Configured capacity.
        max_entries: usize,
    },
}
