//! Service configuration read from the environment

use chrono::{FixedOffset, Offset, Utc};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_AGENCY_TARGET: &str = "agency_admin";
const DEFAULT_FOLLOW_UP_MINUTES: i64 = 20;
const DEFAULT_SWEEP_SECONDS: u64 = 30;
/// KST
const DEFAULT_UTC_OFFSET_MINUTES: i32 = 9 * 60;
const DEFAULT_HISTORY_LIMIT: usize = 10;
const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("{name} is out of range: {value}")]
    OutOfRange { name: &'static str, value: String },
}

/// Escalation tiers and the level-2 follow-up schedule
#[derive(Debug, Clone)]
pub struct EscalationConfig {
    pub agency_target: String,
    pub follow_up_window: chrono::Duration,
    pub sweep_interval: Duration,
    /// Follow-ups claimed per sweep
    pub sweep_batch: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            agency_target: DEFAULT_AGENCY_TARGET.to_string(),
            follow_up_window: chrono::Duration::minutes(DEFAULT_FOLLOW_UP_MINUTES),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_SECONDS),
            sweep_batch: 32,
        }
    }
}

/// Push delivery settings
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Webhook to POST notifications to; log-only delivery when unset
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the service needs besides LLM credentials
#[derive(Debug, Clone)]
pub struct CareConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub escalation: EscalationConfig,
    pub notify: NotifyConfig,
    /// Offset used to decide the user's calendar day
    pub utc_offset: FixedOffset,
    /// Turns of history sent with each interpretation
    pub history_limit: usize,
    /// Guardian used when a chat request carries none
    pub default_guardian: Option<String>,
}

impl Default for CareConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: DEFAULT_PORT,
            escalation: EscalationConfig::default(),
            notify: NotifyConfig::default(),
            utc_offset: kst(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            default_guardian: None,
        }
    }
}

impl CareConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let follow_up_minutes: i64 =
            parse_var(&var, "GYEOT_FOLLOW_UP_MINUTES")?.unwrap_or(DEFAULT_FOLLOW_UP_MINUTES);
        if follow_up_minutes <= 0 {
            return Err(ConfigError::OutOfRange {
                name: "GYEOT_FOLLOW_UP_MINUTES",
                value: follow_up_minutes.to_string(),
            });
        }

        let sweep_seconds: u64 =
            parse_var(&var, "GYEOT_SWEEP_SECONDS")?.unwrap_or(DEFAULT_SWEEP_SECONDS);
        if sweep_seconds == 0 {
            return Err(ConfigError::OutOfRange {
                name: "GYEOT_SWEEP_SECONDS",
                value: sweep_seconds.to_string(),
            });
        }

        let offset_minutes: i32 =
            parse_var(&var, "GYEOT_UTC_OFFSET_MINUTES")?.unwrap_or(DEFAULT_UTC_OFFSET_MINUTES);
        let utc_offset =
            FixedOffset::east_opt(offset_minutes * 60).ok_or(ConfigError::OutOfRange {
                name: "GYEOT_UTC_OFFSET_MINUTES",
                value: offset_minutes.to_string(),
            })?;

        Ok(Self {
            db_path: var("GYEOT_DB_PATH").map_or(defaults.db_path, PathBuf::from),
            port: parse_var(&var, "GYEOT_PORT")?.unwrap_or(DEFAULT_PORT),
            escalation: EscalationConfig {
                agency_target: var("GYEOT_AGENCY_TARGET")
                    .unwrap_or_else(|| DEFAULT_AGENCY_TARGET.to_string()),
                follow_up_window: chrono::Duration::minutes(follow_up_minutes),
                sweep_interval: Duration::from_secs(sweep_seconds),
                ..defaults.escalation
            },
            notify: NotifyConfig {
                endpoint: var("GYEOT_PUSH_ENDPOINT"),
                api_key: var("GYEOT_PUSH_API_KEY"),
                ..defaults.notify
            },
            utc_offset,
            history_limit: parse_var(&var, "GYEOT_HISTORY_LIMIT")?
                .unwrap_or(DEFAULT_HISTORY_LIMIT),
            default_guardian: var("GYEOT_DEFAULT_GUARDIAN"),
        })
    }
}

fn parse_var<T, F>(var: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value })
        })
        .transpose()
}

fn kst() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_UTC_OFFSET_MINUTES * 60).unwrap_or_else(|| Utc.fix())
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map_or_else(|_| PathBuf::from("."), PathBuf::from)
        .join(".gyeot")
        .join("gyeot.db")
}
