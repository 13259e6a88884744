//! # vexa-core
//!
//! Credit ledger and session-state core for the Vexa assistant.
//!
//! Users of the assistant spend a shared credit balance on paid actions
//! (speech synthesis, image and video generation, chat completion). This crate
//! owns the parts of that system that must stay correct under concurrent
//! access from the bot loop and the external HTTP API:
//!
//! - [`ledger`]: the per-account balance table with an atomic
//!   check-and-decrement debit, referral linkage and account metadata
//! - [`settings`]: process-wide tunable policy with lazily written defaults
//! - [`session`]: the per-account flow cursor as a typed [`session::FlowState`],
//!   flow dispatch, and the expiring scratch store for mid-flow payloads
//! - [`gate`]: the membership-based access gate with typed oracle errors
//! - [`credentials`]: per-account API credentials with constant-time
//!   verification and per-call charging
//! - [`billing`]: optimistic charging with an exactly-once refund guard
//! - [`deferred`]: fire-and-forget timers that re-check state before acting
//!
//! All stores share one [`db::Database`] handle so that a single `SQLite` file
//! backs every component.
//!
//! ## Example
//!
//! ```rust
//! use vexa_core::amount::Credits;
//! use vexa_core::db::Database;
//! use vexa_core::ledger::{AccountId, AccountStore, DisplayHints};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::in_memory()?;
//! let accounts = AccountStore::new(db)?;
//!
//! let id = AccountId::new(42);
//! accounts.get_or_create(id, &DisplayHints::default(), Credits::whole(80))?;
//!
//! assert!(accounts.debit(id, Credits::whole(70))?);
//! assert!(!accounts.debit(id, Credits::whole(70))?);
//! assert_eq!(accounts.balance(id)?, Some(Credits::whole(10)));
//! # Ok(())
//! # }
//! ```

pub mod amount;
pub mod billing;
pub mod config;
pub mod credentials;
pub mod db;
pub mod deferred;
pub mod gate;
pub mod ledger;
pub mod session;
pub mod settings;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::amount::Credits;
    pub use crate::billing::{Biller, BillingError, Charge};
    pub use crate::credentials::{AdminSecret, CredentialError, CredentialStore};
    pub use crate::db::{Database, DbError};
    pub use crate::gate::{AccessDecision, AccessGate, GateMode, MembershipOracle, OracleError};
    pub use crate::ledger::{Account, AccountId, AccountStore, DisplayHints, LedgerError};
    pub use crate::session::{FlowState, Namespace, ScratchStore, SessionError, SessionStore};
    pub use crate::settings::{PolicySettings, SettingKey, SettingsStore};
}
