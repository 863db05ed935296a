use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use chime_api::LockoutPolicy;
use chime_gateway::SessionSettings;

pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";

/// Runtime settings, read from `CHIME_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub db_readers: usize,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub lockout_window_secs: i64,
    pub lockout_threshold: u32,
    pub heartbeat_secs: u64,
    pub idle_timeout_secs: u64,
    pub replay_page_size: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            host: lookup("CHIME_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "CHIME_PORT", 8765)?,
            db_path: lookup("CHIME_DB_PATH")
                .unwrap_or_else(|| "chime.db".into())
                .into(),
            db_readers: parsed(&lookup, "CHIME_DB_READERS", chime_db::DEFAULT_READER_POOL_SIZE)?,
            jwt_secret: lookup("CHIME_JWT_SECRET").unwrap_or_else(|| DEV_JWT_SECRET.into()),
            token_ttl_hours: parsed(&lookup, "CHIME_TOKEN_TTL_HOURS", 24)?,
            lockout_window_secs: parsed(&lookup, "CHIME_LOCKOUT_WINDOW_SECS", 300)?,
            lockout_threshold: parsed(&lookup, "CHIME_LOCKOUT_THRESHOLD", 5)?,
            heartbeat_secs: parsed(&lookup, "CHIME_HEARTBEAT_SECS", 15)?,
            idle_timeout_secs: parsed(&lookup, "CHIME_IDLE_TIMEOUT_SECS", 90)?,
            replay_page_size: parsed(&lookup, "CHIME_REPLAY_PAGE_SIZE", 100)?,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .with_context(|| format!("invalid listen address {}", addr))
    }

    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy {
            window_secs: self.lockout_window_secs,
            threshold: self.lockout_threshold,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            replay_page_size: self.replay_page_size,
        }
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value '{}' for {}: {}", raw, key, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 8765);
        assert_eq!(config.db_path, PathBuf::from("chime.db"));
        assert_eq!(config.db_readers, 4);
        assert_eq!(config.lockout_policy().threshold, 5);
        assert_eq!(config.lockout_policy().window_secs, 300);
        assert_eq!(config.session_settings().replay_page_size, 100);
        assert!(config.uses_dev_secret());
        assert_eq!(config.addr().unwrap().port(), 8765);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("CHIME_PORT", "9000"),
            ("CHIME_HEARTBEAT_SECS", "5"),
            ("CHIME_JWT_SECRET", "prod"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.session_settings().heartbeat_interval, Duration::from_secs(5));
        assert!(!config.uses_dev_secret());
    }

    #[test]
    fn unparseable_numbers_are_errors() {
        let err = config(&[("CHIME_LOCKOUT_THRESHOLD", "lots")]).unwrap_err();
        assert!(err.to_string().contains("CHIME_LOCKOUT_THRESHOLD"));
    }
}
