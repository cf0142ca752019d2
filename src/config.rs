use std::{env, fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use crate::error::{Error, Result};
use crate::verify::KeyRing;

const DEV_JWT_SECRET: &str = "atlas-entry-dev-secret";
/// Upper bound for ATLAS_MAX_CLOCK_SKEW_MINUTES (one day).
pub const MAX_CLOCK_SKEW_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format {other}")),
        }
    }
}

/// Station settings, read from `ATLAS_*` environment variables (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,
    pub bind_addr: SocketAddr,
    pub backend_url: Option<String>,
    pub backend_token: Option<String>,
    pub backend_timeout: Duration,
    pub max_clock_skew_minutes: i64,
    pub jwt_secret: String,
    /// SYNCED events older than this are pruned after each sync
    pub event_retention_days: u32,
    pub token_ttl_secs: u64,
    /// `kid=base64url-key` pairs, comma separated
    pub qr_keys: String,
    pub default_kid: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_dir: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(Error::Config(format!(".env: {e}")));
            }
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = optional("ATLAS_JWT_SECRET").unwrap_or_else(|| DEV_JWT_SECRET.to_string());

        let max_clock_skew_minutes: i64 = parse_or(&lookup, "ATLAS_MAX_CLOCK_SKEW_MINUTES", "5")?;
        if !(0..=MAX_CLOCK_SKEW_MINUTES).contains(&max_clock_skew_minutes) {
            return Err(Error::Config(format!(
                "ATLAS_MAX_CLOCK_SKEW_MINUTES must be between 0 and {MAX_CLOCK_SKEW_MINUTES}, got {max_clock_skew_minutes}"
            )));
        }

        Ok(Self {
            data_dir: optional("ATLAS_DATA_DIR").unwrap_or_else(|| "atlas_entry_data".to_string()),
            bind_addr: parse_or(&lookup, "ATLAS_BIND_ADDR", "0.0.0.0:11111")?,
            backend_url: optional("ATLAS_BACKEND_URL").map(|u| u.trim_end_matches('/').to_string()),
            backend_token: optional("ATLAS_BACKEND_TOKEN"),
            backend_timeout: Duration::from_secs(parse_or(&lookup, "ATLAS_BACKEND_TIMEOUT_SECS", "10")?),
            max_clock_skew_minutes,
            jwt_secret,
            event_retention_days: parse_or(&lookup, "ATLAS_EVENT_RETENTION_DAYS", "30")?,
            token_ttl_secs: parse_or(&lookup, "ATLAS_TOKEN_TTL_SECS", "3600")?,
            qr_keys: optional("ATLAS_QR_KEYS").unwrap_or_default(),
            default_kid: optional("ATLAS_DEFAULT_KID"),
            log_level: optional("ATLAS_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format: parse_or(&lookup, "ATLAS_LOG_FORMAT", "json")?,
            log_dir: optional("ATLAS_LOG_DIR"),
        })
    }

    /// True when ATLAS_JWT_SECRET was not set and the built-in secret is in use.
    pub fn uses_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    /// Verification keys for offline validation.
    pub fn key_ring(&self) -> Result<KeyRing> {
        let mut entries = vec![];
        for entry in self.qr_keys.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (kid, key) = entry
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("ATLAS_QR_KEYS entry {entry:?} is not kid=key")))?;
            entries.push((kid.trim(), key.trim()));
        }
        let ring = KeyRing::from_encoded(entries)?;
        Ok(match &self.default_kid {
            Some(kid) => ring.with_default_kid(kid.clone()),
            None => ring,
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {key} value {raw:?}: {e}")))
}
