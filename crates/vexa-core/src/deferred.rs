//! Fire-and-forget delayed actions.
//!
//! Timers are not persisted: a restart forgets them. When a timer fires it
//! re-reads the account's flow state and only acts if the account is still
//! in the state the timer was scheduled for, so a user who moved on (or
//! whose state was cleared) is left alone.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ledger::AccountId;
use crate::session::{FlowState, SessionStore};

/// Runs `action` after `delay` if `account` is still in `expected`.
///
/// The returned handle resolves to `true` if the action ran. Dropping the
/// handle does not cancel the timer.
pub fn schedule_if_state<F, Fut>(
    sessions: SessionStore,
    account: AccountId,
    expected: FlowState,
    delay: Duration,
    action: F,
) -> JoinHandle<bool>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        let current = match sessions.get_state(account) {
            Ok(state) => state,
            Err(e) => {
                warn!(account_id = %account, error = %e, "deferred action skipped: state unreadable");
                return false;
            },
        };
        if current != expected {
            debug!(account_id = %account, ?expected, ?current, "deferred action skipped: state changed");
            return false;
        }

        action().await;
        true
    })
}
