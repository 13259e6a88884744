//! Account record types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::amount::{AmountError, Credits, parse_int_lenient};

/// Locale assigned to accounts that have not picked one yet.
pub const DEFAULT_LOCALE: &str = "fa";

/// Stable external identity of an account (the messenger's numeric user id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(i64);

impl AccountId {
    /// Wraps a numeric identity.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the numeric identity.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns the referral code other accounts use to link to this one.
    ///
    /// The code is derived from the identity itself, so it is stable across
    /// repeated `get_or_create` calls.
    #[must_use]
    pub fn referral_code(self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = AmountError;

    /// Parses an id typed by a person (Persian/Arabic digits accepted).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_int_lenient(s).map(Self)
    }
}

impl ToSql for AccountId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for AccountId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Self)
    }
}

/// Display metadata refreshed on every sighting of an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayHints {
    /// Messenger handle, without the leading `@`.
    pub username: String,
    /// Human-readable name.
    pub display_name: String,
}

impl DisplayHints {
    /// Creates display hints.
    #[must_use]
    pub fn new(username: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: display_name.into(),
        }
    }
}

/// The persisted identity, balance and metadata for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable external identity.
    pub id: AccountId,
    /// Messenger handle.
    pub username: String,
    /// Human-readable name.
    pub display_name: String,
    /// When the account was first seen.
    pub joined_at: DateTime<Utc>,
    /// Spendable credits; never negative.
    pub balance: Credits,
    /// Code other accounts use to link to this one.
    pub referral_code: String,
    /// The account that referred this one, set at most once.
    pub referred_by: Option<AccountId>,
    /// Banned accounts cannot enter flows or spend credits.
    pub banned: bool,
    /// Most recent activity; never moves backwards.
    pub last_seen: DateTime<Utc>,
    /// Selected display language.
    pub locale: String,
    /// When the daily reward was last claimed (Unix epoch if never).
    pub last_daily_reward_at: DateTime<Utc>,
    /// Default text-to-speech voice, if the user picked one.
    pub selected_voice: Option<String>,
}

impl Account {
    /// Returns `true` if the balance covers `amount`.
    #[must_use]
    pub fn can_afford(&self, amount: Credits) -> bool {
        self.balance >= amount
    }
}

/// Outcome of a daily reward claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyReward {
    /// The reward was credited.
    Granted {
        /// Credits added.
        amount: Credits,
    },
    /// The reward was already claimed within the interval.
    Cooldown {
        /// Seconds until the next claim is allowed.
        remaining_secs: u64,
    },
}
