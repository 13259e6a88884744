//! Durable per-account flow cursor.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, warn};

use super::error::SessionError;
use super::state::FlowState;
use crate::db::Database;
use crate::ledger::AccountId;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS session_state (
    account_id INTEGER PRIMARY KEY,
    token TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// Stores at most one [`FlowState`] per account.
///
/// Writes are last-write-wins, and entering a flow replaces whatever flow was
/// active. Every call goes through the shared connection, so a handler always
/// reads back the state it just wrote.
#[derive(Debug, Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    /// Creates the store, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn new(db: Database) -> Result<Self, SessionError> {
        db.write(|conn| conn.execute_batch(SCHEMA_SQL))?;
        Ok(Self { db })
    }

    /// Overwrites the account's state. Setting [`FlowState::Idle`] clears it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidParameter`] if the state cannot be
    /// encoded, or a storage error.
    pub fn set_state(&self, account: AccountId, state: &FlowState) -> Result<(), SessionError> {
        let token = state.encode()?;
        if token.is_empty() {
            return self.clear_state(account);
        }
        let now = Utc::now().timestamp();
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO session_state (account_id, token, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(account_id) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at",
                params![account, token, now],
            )
        })?;
        debug!(account_id = %account, token = %token, "session state set");
        Ok(())
    }

    /// Returns the account's state; [`FlowState::Idle`] when none is stored.
    ///
    /// A stored token that no longer decodes (left by an older build or
    /// written by hand) is cleared and reported as idle, returning the account
    /// to the home context.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn get_state(&self, account: AccountId) -> Result<FlowState, SessionError> {
        let Some(token) = self.raw_token(account)? else {
            return Ok(FlowState::Idle);
        };
        match FlowState::decode(&token) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(account_id = %account, error = %e, "discarding undecodable session state");
                self.clear_state(account)?;
                Ok(FlowState::Idle)
            },
        }
    }

    /// Returns the stored token without decoding it.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn raw_token(&self, account: AccountId) -> Result<Option<String>, SessionError> {
        Ok(self.db.read(|conn| {
            conn.query_row(
                "SELECT token FROM session_state WHERE account_id = ?1",
                params![account],
                |row| row.get(0),
            )
            .optional()
        })?)
    }

    /// Clears the account's state. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn clear_state(&self, account: AccountId) -> Result<(), SessionError> {
        self.db.write(|conn| {
            conn.execute(
                "DELETE FROM session_state WHERE account_id = ?1",
                params![account],
            )
        })?;
        Ok(())
    }
}
