//! Engine configuration.
//!
//! [`EngineConfig`] carries the knobs the decision pipeline itself needs.
//! [`Settings`] adds deployment concerns (file locations, the external store
//! URL) and can be read from `XPGATE_*` environment variables:
//!
//! - `XPGATE_ENABLE_IDEMPOTENCY` - `true`/`false` (default `true`)
//! - `XPGATE_IDEMPOTENCY_TTL_SECS` - decision cache lifetime (default 86400)
//! - `XPGATE_REJECT_CONFLICTS` - reject replays with a different payload (default `true`)
//! - `XPGATE_CLASSIFY_TIMEOUT_MS` - persona lookup bound (default 250)
//! - `XPGATE_STORE_TIMEOUT_MS` - bound per cache/ledger operation (default 500)
//! - `XPGATE_LEDGER_UTC_OFFSET` - ledger day boundary, e.g. `+05:30` (default `UTC`)
//! - `XPGATE_PERSONA_CACHE_TTL_SECS` - persona lookup cache lifetime (default 3600)
//! - `XPGATE_FAILOVER_RETRY_SECS` - retry interval of a failed store (default 30)
//! - `XPGATE_REDIS_URL` - external store; unset means in-process only
//! - `XPGATE_POLICY_PATH`, `XPGATE_PERSONA_PATH` - input files

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use time::UtcOffset;

const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_millis(250);
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_PERSONA_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_FAILOVER_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {var}: {reason}")]
pub struct ConfigError {
    pub var: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// When off, every call computes a fresh decision.
    pub idempotency_enabled: bool,
    pub idempotency_ttl: Duration,
    /// Reject a transaction id seen before with a different fingerprint.
    pub reject_conflicting_replays: bool,
    pub classify_timeout: Duration,
    pub store_timeout: Duration,
    /// Offset whose calendar day the spend ledger counts in.
    pub ledger_utc_offset: UtcOffset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idempotency_enabled: true,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            reject_conflicting_replays: true,
            classify_timeout: DEFAULT_CLASSIFY_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            ledger_utc_offset: UtcOffset::UTC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub engine: EngineConfig,
    pub persona_cache_ttl: Duration,
    pub failover_retry_interval: Duration,
    pub redis_url: Option<String>,
    pub policy_path: Option<PathBuf>,
    pub persona_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            persona_cache_ttl: DEFAULT_PERSONA_CACHE_TTL,
            failover_retry_interval: DEFAULT_FAILOVER_RETRY,
            redis_url: None,
            policy_path: None,
            persona_path: None,
        }
    }
}

impl Settings {
    /// Reads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first malformed variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads settings through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first malformed variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("XPGATE_ENABLE_IDEMPOTENCY") {
            settings.engine.idempotency_enabled = parse_bool("XPGATE_ENABLE_IDEMPOTENCY", &v)?;
        }
        if let Some(v) = get("XPGATE_IDEMPOTENCY_TTL_SECS") {
            settings.engine.idempotency_ttl =
                Duration::from_secs(parse_u64("XPGATE_IDEMPOTENCY_TTL_SECS", &v)?);
        }
        if let Some(v) = get("XPGATE_REJECT_CONFLICTS") {
            settings.engine.reject_conflicting_replays = parse_bool("XPGATE_REJECT_CONFLICTS", &v)?;
        }
        if let Some(v) = get("XPGATE_CLASSIFY_TIMEOUT_MS") {
            settings.engine.classify_timeout =
                Duration::from_millis(parse_u64("XPGATE_CLASSIFY_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("XPGATE_STORE_TIMEOUT_MS") {
            settings.engine.store_timeout =
                Duration::from_millis(parse_u64("XPGATE_STORE_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("XPGATE_LEDGER_UTC_OFFSET") {
            settings.engine.ledger_utc_offset = parse_utc_offset(&v).map_err(|reason| ConfigError {
                var: "XPGATE_LEDGER_UTC_OFFSET".into(),
                reason,
            })?;
        }
        if let Some(v) = get("XPGATE_PERSONA_CACHE_TTL_SECS") {
            settings.persona_cache_ttl =
                Duration::from_secs(parse_u64("XPGATE_PERSONA_CACHE_TTL_SECS", &v)?);
        }
        if let Some(v) = get("XPGATE_FAILOVER_RETRY_SECS") {
            settings.failover_retry_interval =
                Duration::from_secs(parse_u64("XPGATE_FAILOVER_RETRY_SECS", &v)?);
        }
        settings.redis_url = get("XPGATE_REDIS_URL");
        settings.policy_path = get("XPGATE_POLICY_PATH").map(PathBuf::from);
        settings.persona_path = get("XPGATE_PERSONA_PATH").map(PathBuf::from);

        Ok(settings)
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError {
            var: var.into(),
            reason: format!("expected a boolean, got '{value}'"),
        }),
    }
}

fn parse_u64(var: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|e| ConfigError {
        var: var.into(),
        reason: format!("{e}"),
    })
}

/// Parses `UTC`, `Z`, `+05:30`, `-03:00` or `+02`.
///
/// # Errors
///
/// Describes why the value is not an offset.
pub fn parse_utc_offset(value: &str) -> Result<UtcOffset, String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("utc") || value == "Z" {
        return Ok(UtcOffset::UTC);
    }
    let (sign, rest) = if let Some(rest) = value.strip_prefix('+') {
        (1i8, rest)
    } else if let Some(rest) = value.strip_prefix('-') {
        (-1i8, rest)
    } else {
        return Err(format!("offset '{value}' must start with + or -"));
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i8 = hours
        .parse()
        .map_err(|_| format!("bad hour in offset '{value}'"))?;
    let minutes: i8 = minutes
        .parse()
        .map_err(|_| format!("bad minute in offset '{value}'"))?;
    UtcOffset::from_hms(sign * hours, sign * minutes, 0).map_err(|e| e.to_string())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_without_variables() {
        let settings = Settings::from_lookup(|_| None).expect("defaults");
        assert_eq!(settings, Settings::default());
        assert!(settings.engine.idempotency_enabled);
        assert_eq!(
            settings.engine.idempotency_ttl,
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn variables_override_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            ("XPGATE_ENABLE_IDEMPOTENCY", "false"),
            ("XPGATE_IDEMPOTENCY_TTL_SECS", "60"),
            ("XPGATE_STORE_TIMEOUT_MS", "75"),
            ("XPGATE_LEDGER_UTC_OFFSET", "+05:30"),
            ("XPGATE_REDIS_URL", "redis://127.0.0.1:6379/0"),
            ("XPGATE_POLICY_PATH", " "),
        ]))
        .expect("settings");

        assert!(!settings.engine.idempotency_enabled);
        assert_eq!(settings.engine.idempotency_ttl, Duration::from_secs(60));
        assert_eq!(settings.engine.store_timeout, Duration::from_millis(75));
        assert_eq!(
            settings.engine.ledger_utc_offset,
            UtcOffset::from_hms(5, 30, 0).unwrap()
        );
        assert_eq!(
            settings.redis_url.as_deref(),
            Some("redis://127.0.0.1:6379/0")
        );
        assert_eq!(settings.policy_path, None);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = Settings::from_lookup(lookup(&[("XPGATE_CLASSIFY_TIMEOUT_MS", "soon")]))
            .expect_err("must fail");
        assert_eq!(err.var, "XPGATE_CLASSIFY_TIMEOUT_MS");

        let err = Settings::from_lookup(lookup(&[("XPGATE_ENABLE_IDEMPOTENCY", "maybe")]))
            .expect_err("must fail");
        assert_eq!(err.var, "XPGATE_ENABLE_IDEMPOTENCY");
    }

    #[test]
    fn utc_offsets() {
        assert_eq!(parse_utc_offset("UTC").unwrap(), UtcOffset::UTC);
        assert_eq!(
            parse_utc_offset("-03:00").unwrap(),
            UtcOffset::from_hms(-3, 0, 0).unwrap()
        );
        assert_eq!(
            parse_utc_offset("+02").unwrap(),
            UtcOffset::from_hms(2, 0, 0).unwrap()
        );
        assert!(parse_utc_offset("05:30").is_err());
        assert!(parse_utc_offset("+99:00").is_err());
    }
}
