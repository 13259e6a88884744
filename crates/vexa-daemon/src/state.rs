//! Shared handler state.

use vexa_core::amount::Credits;
use vexa_core::config::ApiConfig;
use vexa_core::credentials::{AdminSecret, CredentialError, CredentialStore};
use vexa_core::db::Database;
use vexa_core::ledger::AccountStore;

/// State handed to every request handler.
///
/// Cloning is cheap: the stores share one database handle.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Account ledger.
    pub accounts: AccountStore,
    /// Per-account API credentials.
    pub credentials: CredentialStore,
    /// Cost charged for every authenticated client call.
    pub call_cost: Credits,
    /// Header carrying the client credential.
    pub credential_header: String,
    /// Header carrying the administrative secret.
    pub admin_header: String,
    /// Secret guarding the administrative routes.
    pub admin_secret: AdminSecret,
}

impl AppState {
    /// Builds the state on `db`, creating or migrating the tables it needs.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be prepared.
    pub fn new(
        db: Database,
        config: &ApiConfig,
        admin_secret: AdminSecret,
    ) -> Result<Self, CredentialError> {
        let accounts = AccountStore::new(db)?;
        let credentials = CredentialStore::new(accounts.clone())?;
        Ok(Self {
            accounts,
            credentials,
            call_cost: config.call_cost,
            credential_header: config.credential_header.to_ascii_lowercase(),
            admin_header: config.admin_header.to_ascii_lowercase(),
            admin_secret,
        })
    }
}
