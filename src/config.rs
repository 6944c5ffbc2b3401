//! Configuration types, built from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Maximum redelivery window of the push transport. Ledger records must outlive it.
pub const TRANSPORT_RETENTION_DAYS: u32 = 7;

/// How long an uncommitted ledger claim blocks other invocations before it
/// counts as abandoned.
pub const CLAIM_LEASE_MINUTES: i64 = 10;

/// Default ledger record lifetime.
const DEFAULT_LEDGER_RETENTION_DAYS: u32 = 8;

pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const DEFAULT_CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
pub const DEFAULT_DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Base URLs of the remote Google APIs.
#[derive(Debug, Clone)]
pub struct ApiEndpoints {
    pub gmail: String,
    pub calendar: String,
    pub drive: String,
    pub drive_upload: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            gmail: DEFAULT_GMAIL_API_BASE.to_string(),
            calendar: DEFAULT_CALENDAR_API_BASE.to_string(),
            drive: DEFAULT_DRIVE_API_BASE.to_string(),
            drive_upload: DEFAULT_DRIVE_UPLOAD_BASE.to_string(),
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the push endpoint listens on.
    pub bind_addr: SocketAddr,
    /// Path of the libSQL database holding checkpoints and the ledger.
    pub db_path: PathBuf,
    /// OAuth bearer token for the Google APIs. Acquired out of band.
    pub access_token: SecretString,
    /// Calendar whose reminders are reconciled.
    pub calendar_name: String,
    /// Storage folder id that archive paths are resolved under.
    pub drive_root: String,
    /// Lifetime of a processed-message record.
    pub ledger_retention: Duration,
    /// How often expired ledger records are purged.
    pub ledger_purge_interval: Duration,
    /// Optional JSON rule table replacing the built-in one.
    pub rules_path: Option<PathBuf>,
    /// Pub/Sub topic for mailbox watch renewal. Renewal is disabled when unset.
    pub pubsub_topic: Option<String>,
    pub watch_renew_interval: Duration,
    pub endpoints: ApiEndpoints,
    /// Directory for rolling log files, in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = get("RECONCILER_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "RECONCILER_BIND_ADDR".into(),
                message: e.to_string(),
            })?;

        let access_token = get("GOOGLE_ACCESS_TOKEN")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("GOOGLE_ACCESS_TOKEN".into()))?;

        let retention_days = parse_number(&get, "LEDGER_RETENTION_DAYS", DEFAULT_LEDGER_RETENTION_DAYS)?;
        if retention_days < TRANSPORT_RETENTION_DAYS {
            return Err(ConfigError::InvalidValue {
                key: "LEDGER_RETENTION_DAYS".into(),
                message: format!(
                    "{retention_days} is shorter than the {TRANSPORT_RETENTION_DAYS}-day redelivery window"
                ),
            });
        }

        let purge_secs: u64 = parse_number(&get, "LEDGER_PURGE_INTERVAL_SECS", 3600)?;
        let renew_secs: u64 = parse_number(&get, "WATCH_RENEW_INTERVAL_SECS", 86_400)?;

        let defaults = ApiEndpoints::default();
        let endpoints = ApiEndpoints {
            gmail: get("GMAIL_API_BASE").unwrap_or(defaults.gmail),
            calendar: get("CALENDAR_API_BASE").unwrap_or(defaults.calendar),
            drive: get("DRIVE_API_BASE").unwrap_or(defaults.drive),
            drive_upload: get("DRIVE_UPLOAD_BASE").unwrap_or(defaults.drive_upload),
        };

        Ok(Self {
            bind_addr,
            db_path: get("RECONCILER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/reconciler.db")),
            access_token,
            calendar_name: get("RECONCILER_CALENDAR").unwrap_or_else(|| "Bills".to_string()),
            drive_root: get("RECONCILER_DRIVE_ROOT").unwrap_or_else(|| "root".to_string()),
            ledger_retention: Duration::from_secs(u64::from(retention_days) * 86_400),
            ledger_purge_interval: Duration::from_secs(purge_secs),
            rules_path: get("RECONCILER_RULES_PATH").map(PathBuf::from),
            pubsub_topic: get("GMAIL_PUBSUB_TOPIC"),
            watch_renew_interval: Duration::from_secs(renew_secs),
            endpoints,
            log_dir: get("LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_number<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_with_only_token() {
        let config = AppConfig::from_lookup(lookup(&[("GOOGLE_ACCESS_TOKEN", "ya29.test")])).unwrap();
        assert_eq!(config.access_token.expose_secret(), "ya29.test");
        assert_eq!(config.calendar_name, "Bills");
        assert_eq!(config.drive_root, "root");
        assert_eq!(config.ledger_retention, Duration::from_secs(8 * 86_400));
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.pubsub_topic.is_none());
        assert_eq!(config.endpoints.gmail, DEFAULT_GMAIL_API_BASE);
    }

    #[test]
    fn missing_token_is_an_error() {
        let err = AppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "GOOGLE_ACCESS_TOKEN"));
    }

    #[test]
    fn blank_token_counts_as_missing() {
        let err = AppConfig::from_lookup(lookup(&[("GOOGLE_ACCESS_TOKEN", "   ")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn retention_shorter_than_redelivery_window_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("GOOGLE_ACCESS_TOKEN", "t"),
            ("LEDGER_RETENTION_DAYS", "3"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LEDGER_RETENTION_DAYS"));
    }

    #[test]
    fn non_numeric_interval_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("GOOGLE_ACCESS_TOKEN", "t"),
            ("LEDGER_PURGE_INTERVAL_SECS", "hourly"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn overrides_are_applied() {
        let config = AppConfig::from_lookup(lookup(&[
            ("GOOGLE_ACCESS_TOKEN", "t"),
            ("RECONCILER_BIND_ADDR", "127.0.0.1:9000"),
            ("RECONCILER_CALENDAR", "Reminders"),
            ("GMAIL_PUBSUB_TOPIC", "projects/p/topics/gmail"),
            ("GMAIL_API_BASE", "http://localhost:1234"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.calendar_name, "Reminders");
        assert_eq!(config.pubsub_topic.as_deref(), Some("projects/p/topics/gmail"));
        assert_eq!(config.endpoints.gmail, "http://localhost:1234");
        assert_eq!(config.endpoints.drive, DEFAULT_DRIVE_API_BASE);
    }
}
