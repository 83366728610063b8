//! Runtime configuration
//!
//! Each setting is resolved from an environment variable first, then the
//! `app_settings` table, then a built-in default.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::clock::{AcceleratedClock, Clock, SystemClock};
use crate::db::Database;
use crate::error::Result;
use crate::matching::FuzzyConfig;

// Settings keys for database storage
pub const SETTING_TIME_ACCELERATION: &str = "time_acceleration";
pub const SETTING_TIME_BASE: &str = "time_base";
pub const SETTING_RETRY_POLICY: &str = "sync_retry_policy";
pub const SETTING_CALENDAR_PAST_DAYS: &str = "calendar_past_days";
pub const SETTING_CALENDAR_FUTURE_DAYS: &str = "calendar_future_days";
pub const SETTING_PAST_EVENT_BATCH: &str = "past_event_batch";
pub const SETTING_FUZZY_MIN_SIMILARITY: &str = "fuzzy_min_similarity";
pub const SETTING_FUZZY_CONFIDENCE: &str = "fuzzy_confidence";
pub const SETTING_SUGGEST_CONFIDENCE: &str = "suggest_confidence";

// Environment variable names
const ENV_DB: &str = "CONTACTSYNC_DB";
const ENV_LOG: &str = "CONTACTSYNC_LOG";
const ENV_TIME_ACCELERATION: &str = "TIME_ACCELERATION";
const ENV_TIME_BASE: &str = "TIME_BASE";
const ENV_RETRY_POLICY: &str = "SYNC_RETRY_POLICY";
const ENV_CALENDAR_PAST_DAYS: &str = "CALENDAR_PAST_DAYS";
const ENV_CALENDAR_FUTURE_DAYS: &str = "CALENDAR_FUTURE_DAYS";

const DEFAULT_LOG_FILTER: &str = "info";

/// Retry delays indexed by the number of consecutive failures so far.
const BACKOFF_INTERVALS: [i64; 4] = [1, 5, 30, 60];

/// About a simulated day per real second.
const MAX_TIME_ACCELERATION: f64 = 100_000.0;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// How `next_sync_at` is chosen after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Same interval as a successful run.
    #[default]
    Fixed,
    /// 1m, 5m, 30m, then hourly.
    Backoff,
}

impl RetryPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "backoff" => Some(Self::Backoff),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Backoff => "backoff",
        }
    }

    /// Delay before retrying a run that just failed. `prior_errors` is the
    /// state's error count before this failure.
    pub fn retry_after(&self, interval: Duration, prior_errors: i64) -> Duration {
        match self {
            Self::Fixed => interval,
            Self::Backoff => {
                let idx = prior_errors.clamp(0, BACKOFF_INTERVALS.len() as i64 - 1) as usize;
                Duration::minutes(BACKOFF_INTERVALS[idx])
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Clock speed multiplier. 1.0 means real time.
    pub time_acceleration: f64,
    /// Simulated start instant for an accelerated clock.
    pub time_base: Option<DateTime<Utc>>,
    pub retry_policy: RetryPolicy,
    pub calendar_past_days: i64,
    pub calendar_future_days: i64,
    pub past_event_batch: u32,
    /// Automatic linking during sync.
    pub fuzzy: FuzzyConfig,
    /// Suggestions for import candidates.
    pub suggestions: FuzzyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            time_acceleration: 1.0,
            time_base: None,
            retry_policy: RetryPolicy::Fixed,
            calendar_past_days: 365,
            calendar_future_days: 30,
            past_event_batch: 100,
            fuzzy: FuzzyConfig::CALENDAR,
            suggestions: FuzzyConfig::IMPORT,
        }
    }
}

impl Config {
    /// Load from environment variables and database settings.
    /// Environment variables take precedence over database settings.
    pub fn load(db: &Database) -> Result<Self> {
        Self::load_with(db, |key| env::var(key).ok())
    }

    fn load_with(db: &Database, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |env_key: Option<&str>, setting: &str| -> Result<Option<String>> {
            match env_key.and_then(&env) {
                Some(value) => Ok(Some(value)),
                None => db.get_setting(setting),
            }
        };
        let defaults = Self::default();

        let time_acceleration = match lookup(Some(ENV_TIME_ACCELERATION), SETTING_TIME_ACCELERATION)? {
            Some(v) => parse_acceleration(SETTING_TIME_ACCELERATION, &v)?,
            None => defaults.time_acceleration,
        };

        let time_base = match lookup(Some(ENV_TIME_BASE), SETTING_TIME_BASE)? {
            Some(v) => Some(parse_unix_seconds(SETTING_TIME_BASE, &v)?),
            None => None,
        };

        let retry_policy = match lookup(Some(ENV_RETRY_POLICY), SETTING_RETRY_POLICY)? {
            Some(v) => RetryPolicy::parse(&v).ok_or(ConfigError::Invalid {
                key: SETTING_RETRY_POLICY,
                value: v.clone(),
                reason: "expected fixed or backoff",
            })?,
            None => defaults.retry_policy,
        };

        let calendar_past_days =
            match lookup(Some(ENV_CALENDAR_PAST_DAYS), SETTING_CALENDAR_PAST_DAYS)? {
                Some(v) => parse_days(SETTING_CALENDAR_PAST_DAYS, &v)?,
                None => defaults.calendar_past_days,
            };

        let calendar_future_days =
            match lookup(Some(ENV_CALENDAR_FUTURE_DAYS), SETTING_CALENDAR_FUTURE_DAYS)? {
                Some(v) => parse_days(SETTING_CALENDAR_FUTURE_DAYS, &v)?,
                None => defaults.calendar_future_days,
            };

        let past_event_batch = match lookup(None, SETTING_PAST_EVENT_BATCH)? {
            Some(v) => v
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid {
                    key: SETTING_PAST_EVENT_BATCH,
                    value: v.clone(),
                    reason: "expected a positive integer",
                })?,
            None => defaults.past_event_batch,
        };

        let mut fuzzy = defaults.fuzzy;
        let mut suggestions = defaults.suggestions;
        if let Some(v) = lookup(None, SETTING_FUZZY_MIN_SIMILARITY)? {
            let min = parse_ratio(SETTING_FUZZY_MIN_SIMILARITY, &v)?;
            fuzzy.min_similarity = min;
            suggestions.min_similarity = min;
        }
        if let Some(v) = lookup(None, SETTING_FUZZY_CONFIDENCE)? {
            fuzzy.confidence_threshold = parse_ratio(SETTING_FUZZY_CONFIDENCE, &v)?;
        }
        if let Some(v) = lookup(None, SETTING_SUGGEST_CONFIDENCE)? {
            suggestions.confidence_threshold = parse_ratio(SETTING_SUGGEST_CONFIDENCE, &v)?;
        }

        Ok(Self {
            time_acceleration,
            time_base,
            retry_policy,
            calendar_past_days,
            calendar_future_days,
            past_event_batch,
            fuzzy,
            suggestions,
        })
    }

    /// Database location: `CONTACTSYNC_DB` or the platform config directory.
    pub fn database_path() -> Result<PathBuf> {
        match env::var(ENV_DB) {
            Ok(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
            _ => Database::default_path(),
        }
    }

    /// `tracing` filter directive, read before anything else is set up.
    pub fn log_filter() -> String {
        env::var(ENV_LOG).unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
    }

    /// Accelerated clock when acceleration is above 1, wall clock otherwise.
    pub fn clock(&self) -> Arc<dyn Clock> {
        if self.time_acceleration > 1.0 {
            let base = self.time_base.unwrap_or_else(Utc::now);
            Arc::new(AcceleratedClock::new(base, self.time_acceleration))
        } else {
            Arc::new(SystemClock)
        }
    }

    pub fn calendar_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            now - Duration::days(self.calendar_past_days),
            now + Duration::days(self.calendar_future_days),
        )
    }
}

fn parse_acceleration(key: &'static str, value: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0 && *v <= MAX_TIME_ACCELERATION)
        .ok_or(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a number between 0 and 100000",
        })
}

fn parse_ratio(key: &'static str, value: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| (0.0..=1.0).contains(v))
        .ok_or(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a number between 0 and 1",
        })
}

fn parse_days(key: &'static str, value: &str) -> Result<i64, ConfigError> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|d| *d >= 0)
        .ok_or(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a non-negative number of days",
        })
}

fn parse_unix_seconds(key: &'static str, value: &str) -> Result<DateTime<Utc>, ConfigError> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected unix seconds",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let db = Database::open_memory().unwrap();
        let config = Config::load_with(&db, no_env).unwrap();
        assert_eq!(config.retry_policy, RetryPolicy::Fixed);
        assert_eq!(config.calendar_past_days, 365);
        assert_eq!(config.calendar_future_days, 30);
        assert_eq!(config.past_event_batch, 100);
        assert_eq!(config.fuzzy, FuzzyConfig::CALENDAR);
        assert_eq!(config.suggestions, FuzzyConfig::IMPORT);
    }

    #[test]
    fn test_env_overrides_settings() {
        let db = Database::open_memory().unwrap();
        db.set_setting(SETTING_RETRY_POLICY, "fixed").unwrap();
        db.set_setting(SETTING_CALENDAR_PAST_DAYS, "90").unwrap();
        db.set_setting(SETTING_FUZZY_CONFIDENCE, "0.8").unwrap();

        let env: HashMap<&str, &str> = [(ENV_RETRY_POLICY, "backoff")].into_iter().collect();
        let config = Config::load_with(&db, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.retry_policy, RetryPolicy::Backoff);
        assert_eq!(config.calendar_past_days, 90);
        assert_eq!(config.fuzzy.confidence_threshold, 0.8);
        assert_eq!(config.suggestions.confidence_threshold, 0.5);
    }

    #[test]
    fn test_invalid_value_names_key() {
        let db = Database::open_memory().unwrap();
        db.set_setting(SETTING_RETRY_POLICY, "sometimes").unwrap();

        match Config::load_with(&db, no_env) {
            Err(Error::Config(ConfigError::Invalid { key, value, .. })) => {
                assert_eq!(key, SETTING_RETRY_POLICY);
                assert_eq!(value, "sometimes");
            }
            other => panic!("expected config error, got {:?}", other),
        }

        db.set_setting(SETTING_RETRY_POLICY, "fixed").unwrap();
        db.set_setting(SETTING_FUZZY_CONFIDENCE, "1.5").unwrap();
        assert!(Config::load_with(&db, no_env).is_err());
    }

    #[test]
    fn test_time_acceleration_bounds() {
        let db = Database::open_memory().unwrap();

        db.set_setting(SETTING_TIME_ACCELERATION, "100000").unwrap();
        assert_eq!(Config::load_with(&db, no_env).unwrap().time_acceleration, 100_000.0);

        for bad in ["1e300", "0", "-2", "inf"] {
            db.set_setting(SETTING_TIME_ACCELERATION, bad).unwrap();
            match Config::load_with(&db, no_env) {
                Err(Error::Config(ConfigError::Invalid { key, .. })) => {
                    assert_eq!(key, SETTING_TIME_ACCELERATION)
                }
                other => panic!("expected config error for {}, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_retry_policy_delays() {
        let interval = Duration::hours(24);
        assert_eq!(RetryPolicy::Fixed.retry_after(interval, 7), interval);
        assert_eq!(RetryPolicy::Backoff.retry_after(interval, 0), Duration::minutes(1));
        assert_eq!(RetryPolicy::Backoff.retry_after(interval, 2), Duration::minutes(30));
        assert_eq!(RetryPolicy::Backoff.retry_after(interval, 40), Duration::hours(1));
    }

    #[test]
    fn test_time_base_and_window() {
        let db = Database::open_memory().unwrap();
        db.set_setting(SETTING_TIME_BASE, "1700000000").unwrap();
        db.set_setting(SETTING_TIME_ACCELERATION, "60").unwrap();
        let config = Config::load_with(&db, no_env).unwrap();

        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(config.time_base, Some(base));
        assert_eq!(config.time_acceleration, 60.0);
        assert!(config.clock().now() >= base);

        let (from, to) = config.calendar_window(base);
        assert_eq!(base - from, Duration::days(365));
        assert_eq!(to - base, Duration::days(30));
    }
}
