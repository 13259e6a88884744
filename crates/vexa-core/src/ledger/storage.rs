//! `SQLite`-backed account ledger.
//!
//! Every balance mutation is a single conditional statement. A debit is
//! `UPDATE ... SET balance = balance - ?amount WHERE id = ? AND balance >=
//! ?amount`, judged by the affected-row count, so two callers racing on the
//! same account (the bot loop and the API daemon, possibly in different
//! processes) can never both spend the same credits. Balances are never read
//! into a variable and written back.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;
use tracing::{debug, info};

use super::account::{Account, AccountId, DEFAULT_LOCALE, DailyReward, DisplayHints};
use crate::amount::Credits;
use crate::db::{Database, DbError, ensure_columns, from_unix};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Columns added after the first schema, with the defaults existing rows get.
const ADDED_COLUMNS: &[(&str, &str)] = &[
    ("locale", "TEXT NOT NULL DEFAULT 'fa'"),
    ("last_daily_reward_at", "INTEGER NOT NULL DEFAULT 0"),
    ("selected_voice", "TEXT"),
];

const ACCOUNT_COLUMNS: &str = "id, username, display_name, joined_at, balance, referral_code, \
                               referred_by, banned, last_seen, locale, last_daily_reward_at, \
                               selected_voice";

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Storage failure, including abandoned writes under contention.
    #[error(transparent)]
    Storage(#[from] DbError),

    /// No account exists with the given id.
    #[error("account not found: {id}")]
    AccountNotFound {
        /// The id that was not found.
        id: AccountId,
    },

    /// The balance does not cover the requested debit.
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Amount the operation needed.
        required: Credits,
        /// Balance at the time of the rejected debit.
        available: Credits,
    },

    /// The account is banned and may not spend credits.
    #[error("account {id} is banned")]
    Banned {
        /// The banned account.
        id: AccountId,
    },

    /// The credit would push the balance past the representable maximum.
    #[error("balance overflow crediting {amount} to account {id}")]
    Overflow {
        /// The account being credited.
        id: AccountId,
        /// The rejected amount.
        amount: Credits,
    },

    /// A credit was requested with a negative amount.
    #[error("credit amount must not be negative: {amount}")]
    NegativeAmount {
        /// The rejected amount.
        amount: Credits,
    },
}

impl LedgerError {
    /// Returns `true` for the expected, user-facing insufficient-balance case.
    #[must_use]
    pub const fn is_insufficient_balance(&self) -> bool {
        matches!(self, Self::InsufficientBalance { .. })
    }

    /// Returns `true` if the failure was a lost lock race.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_contention())
    }
}

/// The account ledger backed by `SQLite`.
#[derive(Debug, Clone)]
pub struct AccountStore {
    db: Database,
}

impl AccountStore {
    /// Creates the store, applying the schema and in-place column migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn new(db: Database) -> Result<Self, LedgerError> {
        db.write(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            ensure_columns(conn, "accounts", ADDED_COLUMNS)
        })?;
        Ok(Self { db })
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Returns the account for `id`, creating it on first sight.
    ///
    /// A new account receives `initial_grant` and a referral code derived from
    /// its identity. For an existing account only the display hints and
    /// `last_seen` are refreshed; balance and referral linkage are untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_or_create(
        &self,
        id: AccountId,
        hints: &DisplayHints,
        initial_grant: Credits,
    ) -> Result<Account, LedgerError> {
        let now = Utc::now().timestamp();
        let grant = initial_grant.minor().max(0);

        let (created, account) = self.db.write(|conn| {
            let tx = conn.transaction()?;
            let created = tx.execute(
                "INSERT INTO accounts (id, username, display_name, joined_at, balance, referral_code, last_seen, locale)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?4, ?7)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    id,
                    hints.username,
                    hints.display_name,
                    now,
                    grant,
                    id.referral_code(),
                    DEFAULT_LOCALE,
                ],
            )? == 1;
            if !created {
                tx.execute(
                    "UPDATE accounts
                     SET username = ?2, display_name = ?3, last_seen = MAX(last_seen, ?4)
                     WHERE id = ?1",
                    params![id, hints.username, hints.display_name, now],
                )?;
            }
            let account = select_account(&tx, id)?;
            tx.commit()?;
            Ok((created, account))
        })?;

        if created {
            info!(account_id = %id, grant = %initial_grant, "created account");
        }
        account.ok_or(LedgerError::AccountNotFound { id })
    }

    /// Returns the account for `id`, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.db.read(|conn| select_account(conn, id))?)
    }

    /// Returns the account whose referral code is `code`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_by_referral_code(&self, code: &str) -> Result<Option<Account>, LedgerError> {
        Ok(self
            .db
            .read(|conn| select_account_by_code(conn, code.trim()))?)
    }

    /// Returns the balance for `id`, or `None` if the account does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn balance(&self, id: AccountId) -> Result<Option<Credits>, LedgerError> {
        let minor = self.db.read(|conn| {
            conn.query_row(
                "SELECT balance FROM accounts WHERE id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })?;
        Ok(minor.map(Credits::from_minor))
    }

    /// Atomically debits `amount` if the balance covers it.
    ///
    /// Returns `true` when the debit was applied, or when `amount` is zero or
    /// negative (a no-op). Returns `false` and leaves the balance unchanged
    /// when the balance is too low or the account does not exist; there is no
    /// partial debit.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails, including
    /// [`DbError::Contention`] after the retry budget is spent.
    pub fn debit(&self, id: AccountId, amount: Credits) -> Result<bool, LedgerError> {
        if !amount.is_positive() {
            return Ok(true);
        }

        let changed = self.db.write(|conn| {
            conn.execute(
                "UPDATE accounts SET balance = balance - ?1 WHERE id = ?2 AND balance >= ?1",
                params![amount.minor(), id],
            )
        })?;

        debug!(account_id = %id, amount = %amount, applied = changed == 1, "debit");
        Ok(changed == 1)
    }

    /// Atomically debits `amount`, returning the remaining balance.
    ///
    /// Same semantics as [`Self::debit`], but a rejected debit is reported as
    /// [`LedgerError::InsufficientBalance`] with the required and available
    /// amounts. The banned flag is not consulted; administrative withdrawals
    /// use this path.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientBalance`],
    /// [`LedgerError::AccountNotFound`], or a storage error.
    pub fn try_debit(&self, id: AccountId, amount: Credits) -> Result<Credits, LedgerError> {
        self.debit_returning(id, amount, false)
    }

    /// Debits `amount` for something the account is buying.
    ///
    /// Like [`Self::try_debit`], but the statement also requires the account
    /// not to be banned, so a ban that lands between a check and the debit
    /// still stops the charge. A banned account is refused even for a zero
    /// amount.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Banned`], [`LedgerError::InsufficientBalance`],
    /// [`LedgerError::AccountNotFound`], or a storage error.
    pub fn spend(&self, id: AccountId, amount: Credits) -> Result<Credits, LedgerError> {
        self.debit_returning(id, amount, true)
    }

    fn debit_returning(
        &self,
        id: AccountId,
        amount: Credits,
        active_only: bool,
    ) -> Result<Credits, LedgerError> {
        if amount.is_positive() {
            let remaining = self.db.write(|conn| {
                conn.query_row(
                    "UPDATE accounts SET balance = balance - ?1
                     WHERE id = ?2 AND balance >= ?1 AND (?3 = 0 OR banned = 0)
                     RETURNING balance",
                    params![amount.minor(), id, active_only],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
            })?;

            if let Some(remaining) = remaining {
                debug!(account_id = %id, amount = %amount, "debit applied");
                return Ok(Credits::from_minor(remaining));
            }
        }

        // Reported only; nothing is written based on this read.
        let Some(account) = self.get(id)? else {
            return Err(LedgerError::AccountNotFound { id });
        };
        if active_only && account.banned {
            debug!(account_id = %id, "debit refused for banned account");
            return Err(LedgerError::Banned { id });
        }
        if !amount.is_positive() {
            return Ok(account.balance);
        }
        debug!(account_id = %id, required = %amount, available = %account.balance, "debit rejected");
        Err(LedgerError::InsufficientBalance {
            required: amount,
            available: account.balance,
        })
    }

    /// Unconditionally credits `amount`. Zero is a no-op.
    ///
    /// Used for grants (referral bonus, admin top-up) and for compensating
    /// refunds.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NegativeAmount`] for negative amounts,
    /// [`LedgerError::Overflow`] if the balance would exceed the maximum,
    /// [`LedgerError::AccountNotFound`] if the account does not exist, or a
    /// storage error.
    pub fn credit(&self, id: AccountId, amount: Credits) -> Result<(), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::NegativeAmount { amount });
        }
        if amount == Credits::ZERO {
            return Ok(());
        }

        let changed = self.db.write(|conn| {
            conn.execute(
                "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2 AND balance <= ?3",
                params![amount.minor(), id, headroom(amount)],
            )
        })?;

        if changed == 0 {
            return Err(match self.balance(id)? {
                Some(_) => LedgerError::Overflow { id, amount },
                None => LedgerError::AccountNotFound { id },
            });
        }
        debug!(account_id = %id, amount = %amount, "credit");
        Ok(())
    }

    /// Applies an administrative balance adjustment and returns the new
    /// balance.
    ///
    /// Positive deltas are credits; negative deltas are debits and are
    /// rejected in full if they exceed the balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientBalance`] for an uncovered
    /// withdrawal, [`LedgerError::Overflow`] for a deposit past the maximum
    /// balance, [`LedgerError::AccountNotFound`], or a storage error.
    pub fn adjust_balance(&self, id: AccountId, delta: Credits) -> Result<Credits, LedgerError> {
        let balance = if delta.is_negative() {
            self.try_debit(id, delta.abs())?
        } else {
            self.credit(id, delta)?;
            self.balance(id)?
                .ok_or(LedgerError::AccountNotFound { id })?
        };
        info!(account_id = %id, delta = %delta, balance = %balance, "balance adjusted");
        Ok(balance)
    }

    /// Sets `referred_by` if it is currently unset.
    ///
    /// First referrer wins: returns `true` only when the link was created by
    /// this call. Self-referral and unknown referrers are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn link_referral(&self, id: AccountId, referrer: AccountId) -> Result<bool, LedgerError> {
        let linked = self
            .db
            .write(|conn| link_referral_in(conn, id, referrer))?;
        if linked {
            info!(account_id = %id, referrer = %referrer, "referral linked");
        }
        Ok(linked)
    }

    /// Resolves `code`, links the referral and credits the referrer `bonus`.
    ///
    /// The bonus is paid only when the link is newly created, and link and
    /// bonus commit together. Returns the referrer that was credited.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Overflow`] if the bonus does not fit the
    /// referrer's balance (nothing is linked), or a storage error.
    pub fn apply_referral(
        &self,
        id: AccountId,
        code: &str,
        bonus: Credits,
    ) -> Result<Option<AccountId>, LedgerError> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }
        let bonus = bonus.max(Credits::ZERO);

        let referrer = self.db.write(|conn| {
            let tx = conn.transaction()?;
            let Some(referrer) = select_account_by_code(&tx, code)?.map(|a| a.id) else {
                return Ok(Ok(None));
            };
            if !link_referral_in(&tx, id, referrer)? {
                return Ok(Ok(None));
            }
            let paid = tx.execute(
                "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2 AND balance <= ?3",
                params![bonus.minor(), referrer, headroom(bonus)],
            )?;
            if paid == 0 {
                // Dropping the transaction rolls the link back.
                return Ok(Err(LedgerError::Overflow {
                    id: referrer,
                    amount: bonus,
                }));
            }
            tx.commit()?;
            Ok(Ok(Some(referrer)))
        })??;

        if let Some(referrer) = referrer {
            info!(account_id = %id, referrer = %referrer, bonus = %bonus, "referral bonus paid");
        }
        Ok(referrer)
    }

    /// Sets or clears the banned flag.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AccountNotFound`] or a storage error.
    pub fn set_banned(&self, id: AccountId, banned: bool) -> Result<(), LedgerError> {
        let changed = self.db.write(|conn| {
            conn.execute(
                "UPDATE accounts SET banned = ?2 WHERE id = ?1",
                params![id, banned],
            )
        })?;
        if changed == 0 {
            return Err(LedgerError::AccountNotFound { id });
        }
        info!(account_id = %id, banned, "ban flag updated");
        Ok(())
    }

    /// Sets the display language.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AccountNotFound`] or a storage error.
    pub fn set_locale(&self, id: AccountId, locale: &str) -> Result<(), LedgerError> {
        let changed = self.db.write(|conn| {
            conn.execute(
                "UPDATE accounts SET locale = ?2 WHERE id = ?1",
                params![id, locale],
            )
        })?;
        if changed == 0 {
            return Err(LedgerError::AccountNotFound { id });
        }
        Ok(())
    }

    /// Sets or clears the default voice used for text-to-speech.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AccountNotFound`] or a storage error.
    pub fn set_selected_voice(&self, id: AccountId, voice: Option<&str>) -> Result<(), LedgerError> {
        let voice = voice.map(str::trim).filter(|v| !v.is_empty());
        let changed = self.db.write(|conn| {
            conn.execute(
                "UPDATE accounts SET selected_voice = ?2 WHERE id = ?1",
                params![id, voice],
            )
        })?;
        if changed == 0 {
            return Err(LedgerError::AccountNotFound { id });
        }
        debug!(account_id = %id, voice = ?voice, "selected voice updated");
        Ok(())
    }

    /// Records activity now. `last_seen` never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn touch_last_seen(&self, id: AccountId) -> Result<(), LedgerError> {
        self.touch_last_seen_at(id, Utc::now())
    }

    /// Records activity at `at`. `last_seen` never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn touch_last_seen_at(&self, id: AccountId, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE accounts SET last_seen = MAX(last_seen, ?2) WHERE id = ?1",
                params![id, at.timestamp()],
            )
        })?;
        Ok(())
    }

    /// Credits `amount` if the last claim is at least `interval` before `now`.
    ///
    /// Check and credit are one conditional statement, so concurrent claims
    /// pay out at most once per interval.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AccountNotFound`], [`LedgerError::Overflow`] if
    /// the reward no longer fits the balance, or a storage error.
    pub fn claim_daily_reward(
        &self,
        id: AccountId,
        amount: Credits,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<DailyReward, LedgerError> {
        let amount = amount.max(Credits::ZERO);
        let interval_secs = i64::try_from(interval.as_secs()).unwrap_or(i64::MAX);
        let now_secs = now.timestamp();

        let changed = self.db.write(|conn| {
            conn.execute(
                "UPDATE accounts
                 SET balance = balance + ?2, last_daily_reward_at = ?3
                 WHERE id = ?1 AND ?3 - last_daily_reward_at >= ?4 AND balance <= ?5",
                params![id, amount.minor(), now_secs, interval_secs, headroom(amount)],
            )
        })?;
        if changed == 1 {
            info!(account_id = %id, amount = %amount, "daily reward granted");
            return Ok(DailyReward::Granted { amount });
        }

        let last = self.db.read(|conn| {
            conn.query_row(
                "SELECT last_daily_reward_at FROM accounts WHERE id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })?;
        let last = last.ok_or(LedgerError::AccountNotFound { id })?;
        let remaining = last.saturating_add(interval_secs).saturating_sub(now_secs);
        if remaining <= 0 {
            return Err(LedgerError::Overflow { id, amount });
        }
        Ok(DailyReward::Cooldown {
            remaining_secs: u64::try_from(remaining).unwrap_or(0),
        })
    }

    /// Lists accounts, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<Account>, LedgerError> {
        Ok(self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY joined_at DESC, id DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let accounts = stmt
                .query_map(params![limit, offset], row_to_account)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(accounts)
        })?)
    }

    /// Returns the number of accounts.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> Result<u64, LedgerError> {
        let count = self.db.read(|conn| {
            conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get::<_, i64>(0))
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Largest balance that can still take `amount` without overflowing.
const fn headroom(amount: Credits) -> i64 {
    i64::MAX - amount.minor()
}

fn link_referral_in(
    conn: &Connection,
    id: AccountId,
    referrer: AccountId,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE accounts SET referred_by = ?2
         WHERE id = ?1 AND referred_by IS NULL AND id != ?2
           AND EXISTS (SELECT 1 FROM accounts WHERE id = ?2)",
        params![id, referrer],
    )?;
    Ok(changed == 1)
}

fn select_account(conn: &Connection, id: AccountId) -> rusqlite::Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
        params![id],
        row_to_account,
    )
    .optional()
}

fn select_account_by_code(conn: &Connection, code: &str) -> rusqlite::Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE referral_code = ?1"),
        params![code],
        row_to_account,
    )
    .optional()
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        joined_at: from_unix(row.get(3)?),
        balance: Credits::from_minor(row.get(4)?),
        referral_code: row.get(5)?,
        referred_by: row.get(6)?,
        banned: row.get(7)?,
        last_seen: from_unix(row.get(8)?),
        locale: row.get(9)?,
        last_daily_reward_at: from_unix(row.get(10)?),
        selected_voice: row.get(11)?,
    })
}
