//! Optimistic charging for paid provider calls.
//!
//! A paid action debits the ledger before calling the provider and refunds
//! the exact amount if the call fails or times out. The refund is tied to a
//! [`Charge`] value owned by the handler for that attempt:
//!
//! - [`Charge::settle`] and [`Charge::refund`] consume the guard, so one
//!   attempt can be refunded at most once;
//! - a guard dropped while still pending (the handler was cancelled or
//!   panicked) refunds itself once.
//!
//! No ledger lock is held while the provider runs: the debit and the refund
//! are separate single-statement writes. From async code those writes run on
//! the blocking pool, since a contended write sleeps between retries.
//!
//! Banned accounts are never charged, and a user retrying after a failure
//! starts a new attempt with a new charge.

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::amount::Credits;
use crate::config::BillingConfig;
use crate::ledger::{AccountId, AccountStore, LedgerError};

/// Errors from a charged operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BillingError {
    /// The balance does not cover the price; nothing was charged.
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Price of the action.
        required: Credits,
        /// Balance at the time of the attempt.
        available: Credits,
    },

    /// The account is banned; nothing was charged.
    #[error("account {account} is banned")]
    Banned {
        /// The banned account.
        account: AccountId,
    },

    /// The provider failed.
    #[error("provider call failed (refunded: {refunded})")]
    Provider {
        /// Whether the charge was returned.
        refunded: bool,
        /// The provider's error.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The provider did not answer in time.
    #[error("provider call timed out after {after:?} (refunded: {refunded})")]
    Timeout {
        /// The timeout that elapsed.
        after: Duration,
        /// Whether the charge was returned.
        refunded: bool,
    },

    /// The ledger could not be charged.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The blocking ledger task did not complete.
    #[error("ledger task failed: {0}")]
    Task(#[from] JoinError),
}

impl BillingError {
    /// Returns `true` if the user ended up paying for a failed action.
    ///
    /// Only a provider failure whose refund itself failed leaves a charge in
    /// place.
    #[must_use]
    pub const fn was_charged(&self) -> bool {
        match self {
            Self::Provider { refunded, .. } | Self::Timeout { refunded, .. } => !*refunded,
            Self::InsufficientBalance { .. }
            | Self::Banned { .. }
            | Self::Ledger(_)
            | Self::Task(_) => false,
        }
    }

    /// Returns `true` for the expected insufficient-balance rejection.
    #[must_use]
    pub const fn is_insufficient_balance(&self) -> bool {
        matches!(self, Self::InsufficientBalance { .. })
    }
}

/// Charges accounts for paid actions.
#[derive(Debug, Clone)]
pub struct Biller {
    accounts: AccountStore,
    provider_timeout: Duration,
}

impl Biller {
    /// Creates a biller on `accounts` whose provider calls time out after
    /// `provider_timeout`.
    #[must_use]
    pub const fn new(accounts: AccountStore, provider_timeout: Duration) -> Self {
        Self {
            accounts,
            provider_timeout,
        }
    }

    /// Creates a biller using the `[billing]` configuration section.
    #[must_use]
    pub const fn from_config(accounts: AccountStore, config: &BillingConfig) -> Self {
        Self::new(accounts, config.provider_timeout())
    }

    /// Timeout applied by [`Self::run_charged`].
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        self.provider_timeout
    }

    /// Debits `amount` and returns the guard for this attempt.
    ///
    /// This is a blocking ledger write; async callers should use
    /// [`Self::run_charged`].
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::InsufficientBalance`] when the balance does not
    /// cover `amount`, [`BillingError::Banned`] for a banned account (nothing
    /// is debited in either case), or a ledger error.
    pub fn charge(&self, account: AccountId, amount: Credits) -> Result<Charge, BillingError> {
        let amount = amount.max(Credits::ZERO);
        match self.accounts.spend(account, amount) {
            Ok(remaining) => {
                let attempt = Uuid::new_v4();
                debug!(account_id = %account, attempt = %attempt, amount = %amount, remaining = %remaining, "charged");
                Ok(Charge {
                    refund: Refund {
                        accounts: self.accounts.clone(),
                        account,
                        amount,
                        attempt,
                    },
                    pending: true,
                })
            },
            Err(LedgerError::InsufficientBalance {
                required,
                available,
            }) => Err(BillingError::InsufficientBalance {
                required,
                available,
            }),
            Err(LedgerError::Banned { id }) => Err(BillingError::Banned { account: id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Charges `amount`, runs `call` under the configured provider timeout,
    /// and settles on success or refunds once on error or timeout.
    ///
    /// # Errors
    ///
    /// See [`Self::run_charged_within`].
    pub async fn run_charged<F, T, E>(
        &self,
        account: AccountId,
        amount: Credits,
        call: F,
    ) -> Result<T, BillingError>
    where
        F: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        self.run_charged_within(account, amount, self.provider_timeout, call)
            .await
    }

    /// Charges `amount`, runs `call` under `timeout`, and settles on success
    /// or refunds once on error or timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::InsufficientBalance`] or
    /// [`BillingError::Banned`] before `call` is polled,
    /// [`BillingError::Provider`] or [`BillingError::Timeout`] after
    /// refunding, or a ledger error.
    pub async fn run_charged_within<F, T, E>(
        &self,
        account: AccountId,
        amount: Credits,
        timeout: Duration,
        call: F,
    ) -> Result<T, BillingError>
    where
        F: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let biller = self.clone();
        let charge = tokio::task::spawn_blocking(move || biller.charge(account, amount)).await??;

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => {
                charge.settle();
                Ok(value)
            },
            Ok(Err(e)) => {
                warn!(account_id = %account, attempt = %charge.attempt(), error = %e, "provider call failed");
                let refunded = refund_blocking(charge).await;
                Err(BillingError::Provider {
                    refunded,
                    source: Box::new(e),
                })
            },
            Err(_) => {
                warn!(account_id = %account, attempt = %charge.attempt(), ?timeout, "provider call timed out");
                let refunded = refund_blocking(charge).await;
                Err(BillingError::Timeout {
                    after: timeout,
                    refunded,
                })
            },
        }
    }
}

async fn refund_blocking(charge: Charge) -> bool {
    matches!(
        tokio::task::spawn_blocking(move || charge.refund()).await,
        Ok(Ok(()))
    )
}

/// The ledger credit that undoes one charge.
#[derive(Debug)]
struct Refund {
    accounts: AccountStore,
    account: AccountId,
    amount: Credits,
    attempt: Uuid,
}

impl Refund {
    fn apply(&self, what: &'static str) -> Result<(), LedgerError> {
        match self.accounts.credit(self.account, self.amount) {
            Ok(()) => {
                info!(account_id = %self.account, attempt = %self.attempt, amount = %self.amount, "{what}");
                Ok(())
            },
            Err(e) => {
                error!(account_id = %self.account, attempt = %self.attempt, amount = %self.amount, error = %e, "refund failed");
                Err(e)
            },
        }
    }
}

/// A debit awaiting the outcome of its provider call.
#[derive(Debug)]
#[must_use = "a dropped charge is refunded; call settle() once the action succeeds"]
pub struct Charge {
    refund: Refund,
    pending: bool,
}

impl Charge {
    /// The charged account.
    #[must_use]
    pub const fn account(&self) -> AccountId {
        self.refund.account
    }

    /// The charged amount.
    #[must_use]
    pub const fn amount(&self) -> Credits {
        self.refund.amount
    }

    /// Identifier of this attempt, used in logs.
    #[must_use]
    pub const fn attempt(&self) -> Uuid {
        self.refund.attempt
    }

    /// Keeps the charge; the action succeeded.
    pub fn settle(mut self) {
        self.pending = false;
        debug!(account_id = %self.account(), attempt = %self.attempt(), amount = %self.amount(), "charge settled");
    }

    /// Returns the charged amount to the account. This is a blocking ledger
    /// write.
    ///
    /// # Errors
    ///
    /// Returns the ledger error if the credit could not be written; the
    /// failure is logged and the guard does not retry on drop.
    pub fn refund(mut self) -> Result<(), LedgerError> {
        self.pending = false;
        self.refund.apply("refunded")
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }
        self.pending = false;
        warn!(account_id = %self.account(), attempt = %self.attempt(), "charge dropped while pending");

        let refund = Refund {
            accounts: self.refund.accounts.clone(),
            ..self.refund
        };
        // Inside a runtime the credit must not block the executor thread.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || refund.apply("refunded dropped charge"));
            },
            Err(_) => {
                let _ = refund.apply("refunded dropped charge");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::db::Database;
    use crate::ledger::DisplayHints;

    fn setup(balance: Credits) -> (Biller, AccountStore, AccountId) {
        let accounts = AccountStore::new(Database::in_memory().unwrap()).unwrap();
        let id = AccountId::new(8);
        accounts
            .get_or_create(id, &DisplayHints::default(), balance)
            .unwrap();
        let biller = Biller::new(accounts.clone(), Duration::from_secs(5));
        (biller, accounts, id)
    }

    async fn wait_for_balance(accounts: &AccountStore, id: AccountId, expected: Credits) {
        for _ in 0..200 {
            if accounts.balance(id).unwrap() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(accounts.balance(id).unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn test_provider_failure_restores_balance_once() {
        let (biller, accounts, id) = setup(Credits::whole(100));

        let err = biller
            .run_charged(id, Credits::whole(25), async {
                Err::<(), _>(io::Error::other("provider exploded"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Provider { refunded: true, .. }));
        assert!(!err.was_charged());
        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(100)));
    }

    #[tokio::test]
    async fn test_success_keeps_charge() {
        let (biller, accounts, id) = setup(Credits::whole(100));

        let out = biller
            .run_charged(id, Credits::whole(25), async {
                Ok::<_, io::Error>("audio")
            })
            .await
            .unwrap();

        assert_eq!(out, "audio");
        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(75)));
    }

    #[tokio::test]
    async fn test_insufficient_balance_never_calls_provider() {
        let (biller, accounts, id) = setup(Credits::whole(10));
        let mut called = false;

        let err = biller
            .run_charged(id, Credits::whole(70), async {
                called = true;
                Ok::<_, io::Error>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_insufficient_balance());
        assert!(!called);
        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_refunds_once() {
        let (biller, accounts, id) = setup(Credits::whole(30));

        let err = biller
            .run_charged_within(id, Credits::whole(20), Duration::from_secs(120), async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok::<_, io::Error>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BillingError::Timeout {
                refunded: true,
                ..
            }
        ));
        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(30)));
    }

    #[test]
    fn test_dropped_charge_refunds_once() {
        let (biller, accounts, id) = setup(Credits::whole(50));

        let charge = biller.charge(id, Credits::whole(20)).unwrap();
        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(30)));
        drop(charge);

        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(50)));
    }

    #[test]
    fn test_explicit_refund_is_not_repeated_on_drop() {
        let (biller, accounts, id) = setup(Credits::whole(50));

        let charge = biller.charge(id, Credits::whole(20)).unwrap();
        charge.refund().unwrap();

        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(50)));
    }

    #[test]
    fn test_each_retry_is_charged_independently() {
        let (biller, accounts, id) = setup(Credits::whole(50));

        biller.charge(id, Credits::whole(20)).unwrap().refund().unwrap();
        biller.charge(id, Credits::whole(20)).unwrap().settle();

        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(30)));
    }

    #[tokio::test]
    async fn test_cancelled_call_refunds_through_guard() {
        let (biller, accounts, id) = setup(Credits::whole(40));

        let call = biller.run_charged_within(id, Credits::whole(15), Duration::from_secs(60), async {
            std::future::pending::<Result<(), io::Error>>().await
        });
        let outcome = tokio::time::timeout(Duration::from_millis(10), call).await;

        assert!(outcome.is_err());
        // The refund runs on the blocking pool after the future is dropped.
        wait_for_balance(&accounts, id, Credits::whole(40)).await;
    }

    #[tokio::test]
    async fn test_banned_account_is_not_charged() {
        let (biller, accounts, id) = setup(Credits::whole(40));
        accounts.set_banned(id, true).unwrap();
        let mut called = false;

        let err = biller
            .run_charged(id, Credits::whole(15), async {
                called = true;
                Ok::<_, io::Error>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Banned { account } if account == id));
        assert!(!err.was_charged());
        assert!(!called);
        assert!(matches!(
            biller.charge(id, Credits::whole(15)),
            Err(BillingError::Banned { .. })
        ));
        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(40)));
    }

    #[test]
    fn test_biller_uses_configured_provider_timeout() {
        let accounts = AccountStore::new(Database::in_memory().unwrap()).unwrap();
        let config = BillingConfig {
            provider_timeout_secs: 7,
        };

        let biller = Biller::from_config(accounts, &config);

        assert_eq!(biller.provider_timeout(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_charged_times_out_after_configured_timeout() {
        let (_, accounts, id) = setup(Credits::whole(30));
        let biller = Biller::new(accounts.clone(), Duration::from_secs(3));

        let err = biller
            .run_charged(id, Credits::whole(20), async {
                tokio::time::sleep(Duration::from_secs(4)).await;
                Ok::<_, io::Error>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BillingError::Timeout {
                after,
                refunded: true,
            } if after == Duration::from_secs(3)
        ));
        assert_eq!(accounts.balance(id).unwrap(), Some(Credits::whole(30)));
    }
}
