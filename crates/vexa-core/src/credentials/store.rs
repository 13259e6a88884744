//! Per-account API credentials backed by `SQLite`.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use rusqlite::{OptionalExtension, params};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use super::CredentialError;
use crate::amount::Credits;
use crate::db::{Database, from_unix};
use crate::ledger::{Account, AccountId, AccountStore, LedgerError};

/// Prefix of every issued credential.
pub const CREDENTIAL_PREFIX: &str = "vx_";

const SECRET_BYTES: usize = 32;

/// Visible characters kept for admin inspection.
const HINT_LEN: usize = 4;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS api_credentials (
    account_id INTEGER PRIMARY KEY,
    key_hash BLOB NOT NULL UNIQUE,
    hint TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_used_at INTEGER
);
";

/// A freshly issued credential. Shown to its owner once; only its hash is
/// stored.
pub struct ApiCredential(SecretString);

impl ApiCredential {
    fn generate() -> Self {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(SecretString::from(format!(
            "{CREDENTIAL_PREFIX}{}",
            hex::encode(bytes)
        )))
    }

    /// Returns the credential text.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Returns the last characters of the credential, safe to display.
    #[must_use]
    pub fn hint(&self) -> String {
        let text = self.expose();
        text[text.len() - HINT_LEN..].to_string()
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiCredential([REDACTED])")
    }
}

/// Admin view of an account's credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    /// Owning account.
    pub account_id: AccountId,
    /// Last characters of the credential.
    pub hint: String,
    /// When the credential was issued.
    pub created_at: DateTime<Utc>,
    /// When the credential last authenticated a call.
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Outcome of a successful paid authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// The authenticated account, as read before the charge.
    pub account: Account,
    /// Credits charged for the call.
    pub charged: Credits,
    /// Balance left after the charge.
    pub remaining: Credits,
}

/// Credential lifecycle: none → issued → (rotated → issued)* → revoked.
///
/// At most one live credential exists per account; issuing replaces it.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    db: Database,
    accounts: AccountStore,
}

impl CredentialStore {
    /// Creates the store on the ledger's database, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn new(accounts: AccountStore) -> Result<Self, CredentialError> {
        let db = accounts.database().clone();
        db.write(|conn| conn.execute_batch(SCHEMA_SQL))?;
        Ok(Self { db, accounts })
    }

    /// Returns the account store used for charging.
    #[must_use]
    pub const fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    /// Issues a new credential for `account`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::AccountNotFound`] if the account does not
    /// exist, or a storage error.
    pub fn issue(&self, account: AccountId) -> Result<ApiCredential, CredentialError> {
        if self.accounts.get(account)?.is_none() {
            return Err(CredentialError::AccountNotFound { account });
        }

        let credential = ApiCredential::generate();
        let hash = hash_credential(credential.expose());
        let hint = credential.hint();
        let now = Utc::now().timestamp();

        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO api_credentials (account_id, key_hash, hint, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, NULL)
                 ON CONFLICT(account_id) DO UPDATE SET
                     key_hash = excluded.key_hash,
                     hint = excluded.hint,
                     created_at = excluded.created_at,
                     last_used_at = NULL",
                params![account, hash.as_slice(), hint, now],
            )
        })?;

        info!(account_id = %account, hint = %hint, "API credential issued");
        Ok(credential)
    }

    /// Resolves a presented credential to its account.
    ///
    /// The presented value is hashed and the lookup is by hash, so the
    /// database comparison never sees the secret; the match is then
    /// re-checked in constant time.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn verify(&self, presented: &str) -> Result<Option<Account>, CredentialError> {
        let presented = presented.trim();
        if !is_well_formed(presented) {
            return Ok(None);
        }
        let hash = hash_credential(presented);

        let row = self.db.read(|conn| {
            conn.query_row(
                "SELECT account_id, key_hash FROM api_credentials WHERE key_hash = ?1",
                params![hash.as_slice()],
                |row| Ok((row.get::<_, AccountId>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()
        })?;

        let Some((account, stored)) = row else {
            return Ok(None);
        };
        if !bool::from(stored.as_slice().ct_eq(hash.as_slice())) {
            return Ok(None);
        }
        Ok(self.accounts.get(account)?)
    }

    /// Authenticates a call and charges `cost` for it.
    ///
    /// Rejections happen before any downstream work and without any charge:
    /// a missing or unknown credential, a banned account, or a balance below
    /// `cost`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Missing`], [`CredentialError::Invalid`],
    /// [`CredentialError::Banned`], [`CredentialError::InsufficientBalance`],
    /// or a storage error.
    pub fn consume_and_authenticate(
        &self,
        presented: Option<&str>,
        cost: Credits,
    ) -> Result<Authenticated, CredentialError> {
        let presented = presented
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(CredentialError::Missing)?;
        let account = self.verify(presented)?.ok_or(CredentialError::Invalid)?;
        if account.banned {
            debug!(account_id = %account.id, "rejecting call from banned account");
            return Err(CredentialError::Banned {
                account: account.id,
            });
        }

        // The account may be banned between the lookup and the debit.
        let remaining = match self.accounts.spend(account.id, cost) {
            Ok(remaining) => remaining,
            Err(LedgerError::InsufficientBalance {
                required,
                available,
            }) => {
                return Err(CredentialError::InsufficientBalance {
                    required,
                    available,
                });
            },
            Err(LedgerError::Banned { id }) => return Err(CredentialError::Banned { account: id }),
            Err(LedgerError::AccountNotFound { .. }) => return Err(CredentialError::Invalid),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now().timestamp();
        self.db.write(|conn| {
            conn.execute(
                "UPDATE api_credentials SET last_used_at = ?2 WHERE account_id = ?1",
                params![account.id, now],
            )
        })?;

        Ok(Authenticated {
            account,
            charged: cost.max(Credits::ZERO),
            remaining,
        })
    }

    /// Revokes the account's credential. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn revoke(&self, account: AccountId) -> Result<bool, CredentialError> {
        let removed = self.db.write(|conn| {
            conn.execute(
                "DELETE FROM api_credentials WHERE account_id = ?1",
                params![account],
            )
        })?;
        if removed > 0 {
            info!(account_id = %account, "API credential revoked");
        }
        Ok(removed > 0)
    }

    /// Returns the credential status for admin inspection.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn status(&self, account: AccountId) -> Result<Option<CredentialStatus>, CredentialError> {
        Ok(self.db.read(|conn| {
            conn.query_row(
                "SELECT hint, created_at, last_used_at FROM api_credentials WHERE account_id = ?1",
                params![account],
                |row| {
                    Ok(CredentialStatus {
                        account_id: account,
                        hint: row.get(0)?,
                        created_at: from_unix(row.get(1)?),
                        last_used_at: row.get::<_, Option<i64>>(2)?.map(from_unix),
                    })
                },
            )
            .optional()
        })?)
    }
}

fn hash_credential(credential: &str) -> [u8; 32] {
    Sha256::digest(credential.as_bytes()).into()
}

fn is_well_formed(credential: &str) -> bool {
    credential
        .strip_prefix(CREDENTIAL_PREFIX)
        .is_some_and(|hex| hex.len() == SECRET_BYTES * 2 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DisplayHints;

    fn setup(balance: Credits) -> (CredentialStore, AccountId) {
        let accounts = AccountStore::new(Database::in_memory().unwrap()).unwrap();
        let id = AccountId::new(31);
        accounts
            .get_or_create(id, &DisplayHints::default(), balance)
            .unwrap();
        (CredentialStore::new(accounts).unwrap(), id)
    }

    #[test]
    fn test_issued_credential_format() {
        let (store, id) = setup(Credits::ZERO);
        let cred = store.issue(id).unwrap();

        assert!(cred.expose().starts_with("vx_"));
        assert_eq!(cred.expose().len(), 3 + 64);
        assert!(is_well_formed(cred.expose()));
        assert_eq!(format!("{cred:?}"), "ApiCredential([REDACTED])");
    }

    #[test]
    fn test_verify_resolves_owner() {
        let (store, id) = setup(Credits::ZERO);
        let cred = store.issue(id).unwrap();

        let account = store.verify(cred.expose()).unwrap().unwrap();
        assert_eq!(account.id, id);
    }

    #[test]
    fn test_rotation_invalidates_previous_credential() {
        let (store, id) = setup(Credits::ZERO);
        let old = store.issue(id).unwrap();
        let new = store.issue(id).unwrap();

        assert!(store.verify(old.expose()).unwrap().is_none());
        assert_eq!(store.verify(new.expose()).unwrap().unwrap().id, id);
    }

    #[test]
    fn test_revoke_is_terminal_until_reissued() {
        let (store, id) = setup(Credits::ZERO);
        let cred = store.issue(id).unwrap();

        assert!(store.revoke(id).unwrap());
        assert!(!store.revoke(id).unwrap());
        assert!(store.verify(cred.expose()).unwrap().is_none());
        assert!(store.status(id).unwrap().is_none());

        let again = store.issue(id).unwrap();
        assert!(store.verify(again.expose()).unwrap().is_some());
    }

    #[test]
    fn test_malformed_and_unknown_credentials() {
        let (store, _) = setup(Credits::ZERO);
        assert!(store.verify("").unwrap().is_none());
        assert!(store.verify("vx_short").unwrap().is_none());
        let unknown = format!("vx_{}", "ab".repeat(32));
        assert!(store.verify(&unknown).unwrap().is_none());
    }

    #[test]
    fn test_issue_for_unknown_account_fails() {
        let (store, _) = setup(Credits::ZERO);
        let err = store.issue(AccountId::new(404)).unwrap_err();
        assert!(matches!(err, CredentialError::AccountNotFound { .. }));
    }

    #[test]
    fn test_consume_charges_fixed_cost() {
        let (store, id) = setup(Credits::whole(2));
        let cred = store.issue(id).unwrap();

        let auth = store
            .consume_and_authenticate(Some(cred.expose()), Credits::whole(1))
            .unwrap();
        assert_eq!(auth.account.id, id);
        assert_eq!(auth.remaining, Credits::whole(1));
        assert!(store.status(id).unwrap().unwrap().last_used_at.is_some());

        store
            .consume_and_authenticate(Some(cred.expose()), Credits::whole(1))
            .unwrap();
        let err = store
            .consume_and_authenticate(Some(cred.expose()), Credits::whole(1))
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::InsufficientBalance { available, .. } if available == Credits::ZERO
        ));
    }

    #[test]
    fn test_consume_rejections_do_not_charge() {
        let (store, id) = setup(Credits::whole(5));
        let cred = store.issue(id).unwrap();

        assert!(matches!(
            store.consume_and_authenticate(None, Credits::whole(1)),
            Err(CredentialError::Missing)
        ));
        assert!(matches!(
            store.consume_and_authenticate(Some("  "), Credits::whole(1)),
            Err(CredentialError::Missing)
        ));
        assert!(matches!(
            store.consume_and_authenticate(Some("vx_nope"), Credits::whole(1)),
            Err(CredentialError::Invalid)
        ));

        store.accounts().set_banned(id, true).unwrap();
        assert!(matches!(
            store.consume_and_authenticate(Some(cred.expose()), Credits::whole(1)),
            Err(CredentialError::Banned { .. })
        ));

        assert_eq!(store.accounts().balance(id).unwrap(), Some(Credits::whole(5)));
    }

    #[test]
    fn test_status_shows_hint_only() {
        let (store, id) = setup(Credits::ZERO);
        let cred = store.issue(id).unwrap();
        let status = store.status(id).unwrap().unwrap();

        assert_eq!(status.hint.len(), 4);
        assert!(cred.expose().ends_with(&status.hint));
        assert_eq!(status.last_used_at, None);
    }
}
