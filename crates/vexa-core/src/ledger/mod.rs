//! Account ledger.
//!
//! One persisted record per user: identity, display hints, credit balance,
//! referral linkage, ban flag and activity timestamps. All balance changes go
//! through [`AccountStore`], which applies them as single conditional `SQLite`
//! statements so that concurrent spenders sharing the database file cannot
//! overdraw an account.
//!
//! # Example
//!
//! ```rust
//! use vexa_core::amount::Credits;
//! use vexa_core::db::Database;
//! use vexa_core::ledger::{AccountId, AccountStore, DisplayHints};
//!
//! let store = AccountStore::new(Database::in_memory().unwrap()).unwrap();
//! let id = AccountId::new(7);
//! store
//!     .get_or_create(id, &DisplayHints::new("sara", "Sara"), Credits::whole(10))
//!     .unwrap();
//!
//! assert!(store.debit(id, Credits::whole(4)).unwrap());
//! assert!(!store.debit(id, Credits::whole(7)).unwrap());
//! assert_eq!(store.balance(id).unwrap(), Some(Credits::whole(6)));
//! ```

mod account;
mod storage;


pub use account::{Account, AccountId, DEFAULT_LOCALE, DailyReward, DisplayHints};
pub use storage::{AccountStore, LedgerError};
