use std::sync::Arc;

use crate::{
    error::{AppError, Result},
    notification::{notification_models::DEFAULT_FETCH_LIMIT, NotificationBackend},
    websocket::SessionManager,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Arc<dyn NotificationBackend>,
    pub sessions: SessionManager,
}

impl AppState {
    pub fn new(config: Arc<Config>, backend: Arc<dyn NotificationBackend>) -> Self {
        Self {
            config,
            backend,
            sessions: SessionManager::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub fetch_limit: usize,
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 5,
            fetch_limit: DEFAULT_FETCH_LIMIT,
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unset keys fall back
    /// to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let fetch_limit = parse_or(&lookup, "NOTIFICATION_FETCH_LIMIT", defaults.fetch_limit)?;
        if fetch_limit == 0 {
            return Err(AppError::Config(
                "NOTIFICATION_FETCH_LIMIT must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            fetch_limit,
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| AppError::Config(format!("{} must be a number: {}", key, e))),
        None => Ok(default),
    }
}
