//! Process-wide tunable policy.
//!
//! A flat key/value table shared by every process using the database. Values
//! are stored as strings and parsed at read time; a missing key is written
//! with its default on first read, and an unparsable value falls back to the
//! default with a warning instead of failing the caller.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::amount::{Credits, parse_int_lenient};
use crate::db::{Database, DbError, from_unix};
use crate::gate::{GateMode, GateSettings};

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Errors from the settings store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SettingsError {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] DbError),

    /// The key is not a known setting.
    #[error("unknown setting: {0}")]
    UnknownKey(String),

    /// The value cannot be parsed for this setting.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// The setting being written.
        key: SettingKey,
        /// The rejected value.
        value: String,
    },
}

/// Known setting keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    /// Credits paid to a referrer when a new account links to it.
    ReferralBonus,
    /// Credits granted to a new account.
    InitialGrant,
    /// Access-gate mode (`none`, `new`, `all`).
    GateMode,
    /// Access-gate target channel.
    GateChannel,
    /// Secondary link shown with the gate remedy.
    GateInstagramUrl,
    /// Unix seconds at which gate mode `new` was activated.
    GateActivatedAt,
    /// Credits charged per character of synthesized speech.
    CostPerChar,
}

impl SettingKey {
    /// Every known key.
    pub const ALL: [Self; 7] = [
        Self::ReferralBonus,
        Self::InitialGrant,
        Self::GateMode,
        Self::GateChannel,
        Self::GateInstagramUrl,
        Self::GateActivatedAt,
        Self::CostPerChar,
    ];

    /// Returns the stored key name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReferralBonus => "BONUS_REFERRAL",
            Self::InitialGrant => "FREE_CREDIT",
            Self::GateMode => "FORCE_SUB_MODE",
            Self::GateChannel => "TG_CHANNEL",
            Self::GateInstagramUrl => "IG_URL",
            Self::GateActivatedAt => "FORCE_SUB_ACTIVATED_AT",
            Self::CostPerChar => "COST_PER_CHAR",
        }
    }

    /// Returns the default written on first read.
    #[must_use]
    pub const fn default_value(self) -> &'static str {
        match self {
            Self::ReferralBonus => "30",
            Self::InitialGrant => "80",
            Self::GateMode => "none",
            Self::GateChannel | Self::GateInstagramUrl => "",
            Self::GateActivatedAt => "0",
            Self::CostPerChar => "1",
        }
    }

    /// Returns `true` if `value` parses for this key.
    fn accepts(self, value: &str) -> bool {
        match self {
            Self::ReferralBonus | Self::InitialGrant => {
                Credits::parse_lenient(value).is_ok_and(|c| !c.is_negative())
            },
            Self::GateMode => value.parse::<GateMode>().is_ok(),
            Self::GateChannel | Self::GateInstagramUrl => true,
            Self::GateActivatedAt => parse_int_lenient(value).is_ok(),
            Self::CostPerChar => parse_rate(value).is_some(),
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| SettingsError::UnknownKey(s.to_string()))
    }
}

/// Snapshot of every policy value this crate consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySettings {
    /// Bonus paid to referrers.
    pub referral_bonus: Credits,
    /// Grant for new accounts.
    pub initial_grant: Credits,
    /// Per-character speech price.
    pub cost_per_char: Decimal,
    /// Access-gate policy.
    pub gate: GateSettings,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            referral_bonus: Credits::whole(30),
            initial_grant: Credits::whole(80),
            cost_per_char: Decimal::ONE,
            gate: GateSettings::default(),
        }
    }
}

/// The settings table.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    db: Database,
}

impl SettingsStore {
    /// Creates the store, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn new(db: Database) -> Result<Self, SettingsError> {
        db.write(|conn| conn.execute_batch(SCHEMA_SQL))?;
        Ok(Self { db })
    }

    /// Returns the raw stored value, without defaulting.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, key: SettingKey) -> Result<Option<String>, SettingsError> {
        Ok(self.db.read(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()
        })?)
    }

    /// Returns the value, writing the default first if the key is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_or_init(&self, key: SettingKey) -> Result<String, SettingsError> {
        Ok(self.db.write(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO NOTHING",
                params![key.as_str(), key.default_value()],
            )?;
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
        })?)
    }

    /// Overwrites a setting after checking that it parses.
    ///
    /// Setting the gate mode to `new` also records the activation time.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidValue`] for unparsable values, or a
    /// storage error.
    pub fn set(&self, key: SettingKey, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        if !key.accepts(value) {
            return Err(SettingsError::InvalidValue {
                key,
                value: value.to_string(),
            });
        }
        if key == SettingKey::GateMode {
            // Validated above.
            let mode = value.parse::<GateMode>().unwrap_or_default();
            return self.set_gate_mode(mode);
        }

        self.db.write(|conn| upsert(conn, key, value))?;
        info!(key = %key, value, "setting updated");
        Ok(())
    }

    /// Sets the gate mode; switching to `new` records the activation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn set_gate_mode(&self, mode: GateMode) -> Result<(), SettingsError> {
        let now = Utc::now().timestamp().to_string();
        self.db.write(|conn| {
            let tx = conn.transaction()?;
            upsert(&tx, SettingKey::GateMode, mode.as_str())?;
            if mode == GateMode::New {
                upsert(&tx, SettingKey::GateActivatedAt, &now)?;
            }
            tx.commit()
        })?;
        info!(mode = %mode, "access-gate mode updated");
        Ok(())
    }

    /// Advances the gate mode through `none` → `new` → `all` and returns the
    /// new mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn cycle_gate_mode(&self) -> Result<GateMode, SettingsError> {
        let next = self.gate_settings()?.mode.next();
        self.set_gate_mode(next)?;
        Ok(next)
    }

    /// Reads a credit amount setting.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn credits(&self, key: SettingKey) -> Result<Credits, SettingsError> {
        let raw = self.get_or_init(key)?;
        Ok(parse_or_default(key, &raw, |v| {
            Credits::parse_lenient(v).ok().filter(|c| !c.is_negative())
        }))
    }

    /// Reads the access-gate settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn gate_settings(&self) -> Result<GateSettings, SettingsError> {
        let mode = self.get_or_init(SettingKey::GateMode)?;
        let activated = self.get_or_init(SettingKey::GateActivatedAt)?;
        Ok(GateSettings {
            mode: parse_or_default(SettingKey::GateMode, &mode, |v| v.parse().ok()),
            channel: self.get_or_init(SettingKey::GateChannel)?.trim().to_string(),
            instagram_url: self
                .get_or_init(SettingKey::GateInstagramUrl)?
                .trim()
                .to_string(),
            activated_at: from_unix(parse_or_default(
                SettingKey::GateActivatedAt,
                &activated,
                |v| parse_int_lenient(v).ok(),
            )),
        })
    }

    /// Reads every policy value in one call.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn policy(&self) -> Result<PolicySettings, SettingsError> {
        let rate = self.get_or_init(SettingKey::CostPerChar)?;
        Ok(PolicySettings {
            referral_bonus: self.credits(SettingKey::ReferralBonus)?,
            initial_grant: self.credits(SettingKey::InitialGrant)?,
            cost_per_char: parse_or_default(SettingKey::CostPerChar, &rate, parse_rate),
            gate: self.gate_settings()?,
        })
    }
}

fn upsert(conn: &rusqlite::Connection, key: SettingKey, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key.as_str(), value],
    )?;
    Ok(())
}

fn parse_rate(value: &str) -> Option<Decimal> {
    let normalized = crate::amount::normalize_digits(value);
    Decimal::from_str(&normalized)
        .ok()
        .filter(|d| !d.is_sign_negative())
}

/// Parses `raw`, falling back to the key's default (and logging) when the
/// stored value is unusable.
fn parse_or_default<T>(key: SettingKey, raw: &str, parse: impl Fn(&str) -> Option<T>) -> T
where
    T: Default,
{
    if let Some(value) = parse(raw) {
        return value;
    }
    warn!(key = %key, value = raw, "unparsable setting, using default");
    parse(key.default_value()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SettingsStore {
        SettingsStore::new(Database::in_memory().unwrap()).unwrap()
    }

    #[test]
    fn test_defaults_are_written_lazily() {
        let store = store();
        assert_eq!(store.get(SettingKey::ReferralBonus).unwrap(), None);

        assert_eq!(store.get_or_init(SettingKey::ReferralBonus).unwrap(), "30");
        assert_eq!(
            store.get(SettingKey::ReferralBonus).unwrap().as_deref(),
            Some("30")
        );
    }

    #[test]
    fn test_policy_defaults() {
        let policy = store().policy().unwrap();
        assert_eq!(policy, PolicySettings::default());
        assert_eq!(policy.initial_grant, Credits::whole(80));
        assert_eq!(policy.gate.mode, GateMode::None);
    }

    #[test]
    fn test_set_overwrites_and_validates() {
        let store = store();
        store.set(SettingKey::InitialGrant, "۱۰۰").unwrap();
        assert_eq!(
            store.credits(SettingKey::InitialGrant).unwrap(),
            Credits::whole(100)
        );

        let err = store.set(SettingKey::InitialGrant, "lots").unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { .. }));
        let err = store.set(SettingKey::GateMode, "maybe").unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { .. }));
    }

    #[test]
    fn test_unparsable_stored_value_falls_back() {
        let store = store();
        store
            .db
            .write(|conn| upsert(conn, SettingKey::ReferralBonus, "thirty"))
            .unwrap();
        assert_eq!(
            store.credits(SettingKey::ReferralBonus).unwrap(),
            Credits::whole(30)
        );
    }

    #[test]
    fn test_mode_new_records_activation_time() {
        let store = store();
        let before = Utc::now().timestamp();

        store.set(SettingKey::GateMode, "new").unwrap();
        let gate = store.gate_settings().unwrap();

        assert_eq!(gate.mode, GateMode::New);
        assert!(gate.activated_at.timestamp() >= before);
    }

    #[test]
    fn test_cycle_gate_mode() {
        let store = store();
        assert_eq!(store.cycle_gate_mode().unwrap(), GateMode::New);
        assert_eq!(store.cycle_gate_mode().unwrap(), GateMode::All);
        assert_eq!(store.cycle_gate_mode().unwrap(), GateMode::None);
    }

    #[test]
    fn test_gate_target_is_trimmed() {
        let store = store();
        store.set(SettingKey::GateChannel, "  @vexa_news ").unwrap();
        assert_eq!(store.gate_settings().unwrap().channel, "@vexa_news");
    }

    #[test]
    fn test_key_names() {
        assert_eq!(
            "force_sub_mode".parse::<SettingKey>().unwrap(),
            SettingKey::GateMode
        );
        assert!("NOPE".parse::<SettingKey>().is_err());
        assert_eq!(
            store().policy().unwrap().cost_per_char,
            Decimal::ONE
        );
    }
}
