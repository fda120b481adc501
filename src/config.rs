use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};

/// Server settings, read from the environment (a `.env` file is honoured).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub client_secret_path: PathBuf,
    pub oauth_redirect_url: String,
    pub session_minutes: i64,
    pub secure_cookies: bool,
    pub outbox_capacity: usize,
    pub heartbeat: Duration,
    pub idle_timeout: Duration,
    pub history_limit: i64,
    pub max_message_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: "sqlite://buddyboard.db?mode=rwc".to_owned(),
            client_secret_path: PathBuf::from("client_secret.json"),
            oauth_redirect_url: "http://localhost:8080/api/google/callback".to_owned(),
            session_minutes: 60,
            secure_cookies: false,
            outbox_capacity: 256,
            heartbeat: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            history_limit: 200,
            max_message_len: 2000,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            bind_addr: var_or("BIND_ADDR", defaults.bind_addr)?,
            database_url: dotenv::var("DATABASE_URL").unwrap_or(defaults.database_url),
            client_secret_path: dotenv::var("GOOGLE_CLIENT_SECRET")
                .map(PathBuf::from)
                .unwrap_or(defaults.client_secret_path),
            oauth_redirect_url: dotenv::var("OAUTH_REDIRECT_URL").unwrap_or(defaults.oauth_redirect_url),
            session_minutes: var_or("SESSION_MINUTES", defaults.session_minutes)?,
            secure_cookies: var_or("SECURE_COOKIES", defaults.secure_cookies)?,
            outbox_capacity: var_or("OUTBOX_CAPACITY", defaults.outbox_capacity)?,
            heartbeat: Duration::from_secs(var_or("HEARTBEAT_SECS", defaults.heartbeat.as_secs())?),
            idle_timeout: Duration::from_secs(var_or("IDLE_TIMEOUT_SECS", defaults.idle_timeout.as_secs())?),
            history_limit: var_or("HISTORY_LIMIT", defaults.history_limit)?,
            max_message_len: var_or("MAX_MESSAGE_LEN", defaults.max_message_len)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.history_limit < 1 {
            bail!("HISTORY_LIMIT must be at least 1, got {}", self.history_limit);
        }
        if self.heartbeat.is_zero() {
            bail!("HEARTBEAT_SECS must be greater than 0");
        }
        if self.idle_timeout.is_zero() {
            bail!("IDLE_TIMEOUT_SECS must be greater than 0");
        }
        if self.outbox_capacity == 0 {
            bail!("OUTBOX_CAPACITY must be greater than 0");
        }
        if self.max_message_len == 0 {
            bail!("MAX_MESSAGE_LEN must be greater than 0");
        }
        if self.session_minutes < 1 {
            bail!("SESSION_MINUTES must be at least 1, got {}", self.session_minutes);
        }
        Ok(())
    }
}

fn var_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenv::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
