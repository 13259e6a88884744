//! Access gate: membership requirement checked before paid or restricted
//! flows.
//!
//! The gate is stateless. It is handed the current [`GateSettings`] and asks
//! an external [`MembershipOracle`] whether the account belongs to the
//! configured target (a messenger channel).
//!
//! # Failure classification
//!
//! Oracle failures are classified once, at the oracle-client boundary, into
//! [`OracleError`] variants:
//!
//! - [`OracleError::PermissionMisconfigured`] and [`OracleError::TargetNotFound`]
//!   mean the gate itself is broken. Access is **allowed** (fail-open) so an
//!   operator mistake does not lock every user out.
//! - [`OracleError::UserNotMember`] and [`OracleError::Transient`] are
//!   **denied** (fail-closed).
//!
//! Every oracle failure is logged at `warn`; none is retried automatically.
//! The user retries through the remedy's recheck action.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ledger::{Account, AccountId};

/// Callback action a user triggers to re-run the check after joining.
pub const RECHECK_ACTION: &str = "fs:recheck";

// =============================================================================
// Policy
// =============================================================================

/// Access-gate policy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    /// Always allowed.
    #[default]
    None,
    /// Only accounts created after the policy was activated are checked.
    /// Which accounts count as new is decided by the caller.
    New,
    /// Every account is checked.
    All,
}

impl GateMode {
    /// Returns the stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::New => "new",
            Self::All => "all",
        }
    }

    /// Returns the next mode in the admin toggle cycle
    /// (`none` → `new` → `all` → `none`).
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::None => Self::New,
            Self::New => Self::All,
            Self::All => Self::None,
        }
    }
}

impl fmt::Display for GateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown gate mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown access-gate mode: {0:?}")]
pub struct ParseGateModeError(String);

impl FromStr for GateMode {
    type Err = ParseGateModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "new" => Ok(Self::New),
            "all" => Ok(Self::All),
            _ => Err(ParseGateModeError(s.to_string())),
        }
    }
}

/// Gate policy read from the settings table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSettings {
    /// Policy mode.
    pub mode: GateMode,
    /// Membership target reference (for example `@vexa_channel`). Empty means
    /// no target is configured.
    pub channel: String,
    /// Optional link shown alongside the join remedy.
    pub instagram_url: String,
    /// When mode `new` was activated.
    pub activated_at: DateTime<Utc>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            mode: GateMode::None,
            channel: String::new(),
            instagram_url: String::new(),
            activated_at: DateTime::<Utc>::default(),
        }
    }
}

impl GateSettings {
    /// Returns `true` if `account` is subject to the membership check.
    ///
    /// Under mode `new` only accounts that joined at or after activation are
    /// checked.
    #[must_use]
    pub fn requires_check(&self, account: &Account) -> bool {
        match self.mode {
            GateMode::None => false,
            GateMode::All => true,
            GateMode::New => account.joined_at >= self.activated_at,
        }
    }

    /// Returns the public join link for the configured channel, if any.
    #[must_use]
    pub fn join_url(&self) -> Option<String> {
        let channel = self.channel.trim();
        if channel.is_empty() {
            return None;
        }
        if channel.starts_with("https://") || channel.starts_with("http://") {
            return Some(channel.to_string());
        }
        Some(format!("https://t.me/{}", channel.trim_start_matches('@')))
    }
}

// =============================================================================
// Oracle
// =============================================================================

/// Membership status reported by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Owner of the target.
    Creator,
    /// Administrator of the target.
    Administrator,
    /// Regular member.
    Member,
    /// Member with restrictions; not counted.
    Restricted,
    /// Left the target.
    Left,
    /// Removed from the target.
    Kicked,
}

impl MemberStatus {
    /// Returns `true` for statuses that satisfy the gate.
    #[must_use]
    pub const fn is_member(self) -> bool {
        matches!(self, Self::Creator | Self::Administrator | Self::Member)
    }
}

/// Typed classification of oracle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum OracleError {
    /// The oracle lacks permission to inspect the target.
    #[error("oracle lacks permission for target: {0}")]
    PermissionMisconfigured(String),

    /// The configured target does not exist.
    #[error("gate target not found: {0}")]
    TargetNotFound(String),

    /// The user is not known to the target.
    #[error("user is not a member of the target")]
    UserNotMember,

    /// Network failure, rate limit or any other unclassified failure.
    #[error("membership lookup failed: {0}")]
    Transient(String),
}

impl OracleError {
    /// Returns `true` if the error means the gate is misconfigured, in which
    /// case access is allowed.
    #[must_use]
    pub const fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Self::PermissionMisconfigured(_) | Self::TargetNotFound(_)
        )
    }
}

/// External service answering membership queries.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    /// Returns the membership status of `account` in `target`.
    ///
    /// # Errors
    ///
    /// Implementations must map their transport errors onto [`OracleError`].
    async fn membership(
        &self,
        target: &str,
        account: AccountId,
    ) -> Result<MemberStatus, OracleError>;
}

// =============================================================================
// Decision
// =============================================================================

/// Why access was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The user is not a member of the target.
    NotMember,
    /// Membership could not be determined.
    Unverified,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMember => f.write_str("membership required"),
            Self::Unverified => f.write_str("membership could not be verified"),
        }
    }
}

/// How a denied user can satisfy the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remedy {
    /// Link to join the target channel.
    pub join_url: Option<String>,
    /// Additional link to follow.
    pub instagram_url: Option<String>,
    /// Action that re-runs the check.
    pub recheck_action: &'static str,
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// The user may proceed.
    Allowed,
    /// The user must satisfy the remedy first.
    Denied {
        /// Why access was denied.
        reason: DenyReason,
        /// How to satisfy the gate.
        remedy: Remedy,
    },
}

impl AccessDecision {
    /// Returns `true` if access is allowed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Returns the human-readable denial reason, or an empty string.
    #[must_use]
    pub fn reason_text(&self) -> String {
        match self {
            Self::Allowed => String::new(),
            Self::Denied { reason, .. } => reason.to_string(),
        }
    }

    /// Returns the remedy, if denied.
    #[must_use]
    pub const fn remedy(&self) -> Option<&Remedy> {
        match self {
            Self::Allowed => None,
            Self::Denied { remedy, .. } => Some(remedy),
        }
    }
}

// =============================================================================
// Gate
// =============================================================================

/// The access gate.
#[derive(Clone)]
pub struct AccessGate {
    oracle: Arc<dyn MembershipOracle>,
}

impl fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGate").finish_non_exhaustive()
    }
}

impl AccessGate {
    /// Creates a gate backed by `oracle`.
    #[must_use]
    pub fn new(oracle: Arc<dyn MembershipOracle>) -> Self {
        Self { oracle }
    }

    /// Checks whether `account` may proceed under `settings`.
    ///
    /// Mode `new` is checked like `all` here; callers decide which accounts
    /// are new (see [`Self::check_account`]). With no target configured the
    /// check passes.
    pub async fn check_access(&self, account: AccountId, settings: &GateSettings) -> AccessDecision {
        if settings.mode == GateMode::None {
            return AccessDecision::Allowed;
        }
        let target = settings.channel.trim();
        if target.is_empty() {
            return AccessDecision::Allowed;
        }

        match self.oracle.membership(target, account).await {
            Ok(status) if status.is_member() => {
                debug!(account_id = %account, ?status, "membership confirmed");
                AccessDecision::Allowed
            },
            Ok(status) => {
                debug!(account_id = %account, ?status, "membership missing");
                Self::denied(DenyReason::NotMember, settings)
            },
            Err(e) if e.is_misconfiguration() => {
                warn!(account_id = %account, target, error = %e, "access gate misconfigured, allowing");
                AccessDecision::Allowed
            },
            Err(e @ OracleError::UserNotMember) => {
                warn!(account_id = %account, target, error = %e, "membership lookup denied");
                Self::denied(DenyReason::NotMember, settings)
            },
            Err(e) => {
                warn!(account_id = %account, target, error = %e, "membership lookup failed, denying");
                Self::denied(DenyReason::Unverified, settings)
            },
        }
    }

    /// Applies the per-account mode decision, then [`Self::check_access`].
    pub async fn check_account(&self, account: &Account, settings: &GateSettings) -> AccessDecision {
        if !settings.requires_check(account) {
            return AccessDecision::Allowed;
        }
        self.check_access(account.id, settings).await
    }

    fn denied(reason: DenyReason, settings: &GateSettings) -> AccessDecision {
        let instagram = settings.instagram_url.trim();
        AccessDecision::Denied {
            reason,
            remedy: Remedy {
                join_url: settings.join_url(),
                instagram_url: (!instagram.is_empty()).then(|| instagram.to_string()),
                recheck_action: RECHECK_ACTION,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;

    use super::*;
    use crate::amount::Credits;

    /// Oracle returning a fixed answer and recording the queried targets.
    struct FixedOracle {
        answer: Result<MemberStatus, OracleError>,
        calls: Mutex<Vec<String>>,
    }

    impl FixedOracle {
        fn gate(answer: Result<MemberStatus, OracleError>) -> (AccessGate, Arc<Self>) {
            let oracle = Arc::new(Self {
                answer,
                calls: Mutex::new(Vec::new()),
            });
            (AccessGate::new(oracle.clone()), oracle)
        }
    }

    #[async_trait]
    impl MembershipOracle for FixedOracle {
        async fn membership(
            &self,
            target: &str,
            _account: AccountId,
        ) -> Result<MemberStatus, OracleError> {
            self.calls.lock().unwrap().push(target.to_string());
            self.answer.clone()
        }
    }

    fn settings(mode: GateMode) -> GateSettings {
        GateSettings {
            mode,
            channel: "@vexa_news".to_string(),
            instagram_url: "https://instagram.com/vexa".to_string(),
            activated_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn account(joined_year: i32) -> Account {
        let joined = Utc.with_ymd_and_hms(joined_year, 6, 1, 0, 0, 0).unwrap();
        Account {
            id: AccountId::new(5),
            username: "u".to_string(),
            display_name: "U".to_string(),
            joined_at: joined,
            balance: Credits::ZERO,
            referral_code: "5".to_string(),
            referred_by: None,
            banned: false,
            last_seen: joined,
            locale: "fa".to_string(),
            last_daily_reward_at: DateTime::<Utc>::default(),
            selected_voice: None,
        }
    }

    #[tokio::test]
    async fn test_mode_none_never_queries_oracle() {
        let (gate, oracle) = FixedOracle::gate(Err(OracleError::UserNotMember));
        let decision = gate
            .check_access(AccountId::new(1), &settings(GateMode::None))
            .await;
        assert!(decision.is_allowed());
        assert!(oracle.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_target_not_found_fails_open() {
        let (gate, _) = FixedOracle::gate(Err(OracleError::TargetNotFound("@gone".into())));
        let decision = gate
            .check_access(AccountId::new(1), &settings(GateMode::All))
            .await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_permission_misconfigured_fails_open() {
        let (gate, _) =
            FixedOracle::gate(Err(OracleError::PermissionMisconfigured("not admin".into())));
        let decision = gate
            .check_access(AccountId::new(1), &settings(GateMode::All))
            .await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_user_not_member_fails_closed_with_remedy() {
        let (gate, oracle) = FixedOracle::gate(Err(OracleError::UserNotMember));
        let decision = gate
            .check_access(AccountId::new(1), &settings(GateMode::All))
            .await;

        assert!(!decision.is_allowed());
        assert_eq!(decision.reason_text(), "membership required");
        let remedy = decision.remedy().unwrap();
        assert_eq!(remedy.join_url.as_deref(), Some("https://t.me/vexa_news"));
        assert_eq!(
            remedy.instagram_url.as_deref(),
            Some("https://instagram.com/vexa")
        );
        assert_eq!(remedy.recheck_action, RECHECK_ACTION);
        assert_eq!(oracle.calls.lock().unwrap().as_slice(), ["@vexa_news"]);
    }

    #[tokio::test]
    async fn test_transient_failure_fails_closed() {
        let (gate, _) = FixedOracle::gate(Err(OracleError::Transient("timeout".into())));
        let decision = gate
            .check_access(AccountId::new(1), &settings(GateMode::All))
            .await;
        assert!(matches!(
            decision,
            AccessDecision::Denied {
                reason: DenyReason::Unverified,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_member_statuses() {
        for (status, allowed) in [
            (MemberStatus::Creator, true),
            (MemberStatus::Administrator, true),
            (MemberStatus::Member, true),
            (MemberStatus::Restricted, false),
            (MemberStatus::Left, false),
            (MemberStatus::Kicked, false),
        ] {
            let (gate, _) = FixedOracle::gate(Ok(status));
            let decision = gate
                .check_access(AccountId::new(1), &settings(GateMode::All))
                .await;
            assert_eq!(decision.is_allowed(), allowed, "{status:?}");
        }
    }

    #[tokio::test]
    async fn test_empty_target_is_allowed() {
        let (gate, oracle) = FixedOracle::gate(Ok(MemberStatus::Left));
        let mut s = settings(GateMode::All);
        s.channel = "  ".to_string();
        assert!(gate.check_access(AccountId::new(1), &s).await.is_allowed());
        assert!(oracle.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mode_new_only_checks_accounts_after_activation() {
        let (gate, _) = FixedOracle::gate(Ok(MemberStatus::Left));
        let s = settings(GateMode::New);

        assert!(gate.check_account(&account(2025), &s).await.is_allowed());
        assert!(!gate.check_account(&account(2026), &s).await.is_allowed());
    }

    #[test]
    fn test_mode_parsing_and_cycle() {
        assert_eq!(" ALL ".parse::<GateMode>().unwrap(), GateMode::All);
        assert!("sometimes".parse::<GateMode>().is_err());
        assert_eq!(GateMode::None.next(), GateMode::New);
        assert_eq!(GateMode::New.next(), GateMode::All);
        assert_eq!(GateMode::All.next(), GateMode::None);
    }

    #[test]
    fn test_join_url_forms() {
        let mut s = settings(GateMode::All);
        s.channel = "https://t.me/+invite".to_string();
        assert_eq!(s.join_url().as_deref(), Some("https://t.me/+invite"));
        s.channel = "plain".to_string();
        assert_eq!(s.join_url().as_deref(), Some("https://t.me/plain"));
        s.channel = String::new();
        assert_eq!(s.join_url(), None);
    }
}
