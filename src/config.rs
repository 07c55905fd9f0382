//! Process configuration, read once from the environment at startup.
//!
//! Every variable is optional; see [`Config::from_env`] for names and defaults.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue { key: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { key, message } => {
                write!(f, "invalid value for {key}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Path of the SQLite database file.
    pub dsn: String,
    pub max_open_conns: u32,
    /// Most connections allowed to sit idle; a connection returned while
    /// this many are idle is closed instead.
    pub max_idle_conns: u32,
    /// Any idle connection is closed after this long. Zero keeps them open.
    pub max_idle_time: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            dsn: "todos.db".to_string(),
            max_open_conns: 25,
            max_idle_conns: 25,
            max_idle_time: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub env: String,
    pub db: DbConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 4000,
            env: "development".to_string(),
            db: DbConfig::default(),
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TODO_PORT` | `4000` |
    /// | `TODO_ENV` | `development` |
    /// | `TODO_DB_DSN` | `todos.db` |
    /// | `TODO_DB_MAX_OPEN_CONNS` | `25` |
    /// | `TODO_DB_MAX_IDLE_CONNS` | `25` |
    /// | `TODO_DB_MAX_IDLE_TIME` | `15m` |
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let db = DbConfig {
            dsn: lookup("TODO_DB_DSN").unwrap_or(defaults.db.dsn),
            max_open_conns: parsed(&lookup, "TODO_DB_MAX_OPEN_CONNS", defaults.db.max_open_conns)?,
            max_idle_conns: parsed(&lookup, "TODO_DB_MAX_IDLE_CONNS", defaults.db.max_idle_conns)?,
            max_idle_time: match lookup("TODO_DB_MAX_IDLE_TIME") {
                Some(value) => parse_duration(&value).ok_or_else(|| ConfigError::InvalidValue {
                    key: "TODO_DB_MAX_IDLE_TIME".to_string(),
                    message: format!("{value:?} is not a duration like 30s, 15m or 1h"),
                })?,
                None => defaults.db.max_idle_time,
            },
        };

        if db.max_open_conns == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TODO_DB_MAX_OPEN_CONNS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Config {
            port: parsed(&lookup, "TODO_PORT", defaults.port)?,
            env: lookup("TODO_ENV").unwrap_or(defaults.env),
            db,
        })
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: err.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parses `<n>s`, `<n>m` or `<n>h`.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let unit = value.chars().last()?;
    let amount: u64 = value[..value.len() - unit.len_utf8()].parse().ok()?;
    let seconds = match unit {
        's' => amount,
        'm' => amount.checked_mul(60)?,
        'h' => amount.checked_mul(60 * 60)?,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(load(&[]).unwrap(), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = load(&[
            ("TODO_PORT", "8080"),
            ("TODO_ENV", "production"),
            ("TODO_DB_DSN", "/var/lib/todo/todos.db"),
            ("TODO_DB_MAX_OPEN_CONNS", "10"),
            ("TODO_DB_MAX_IDLE_CONNS", "5"),
            ("TODO_DB_MAX_IDLE_TIME", "90s"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.env, "production");
        assert_eq!(config.db.dsn, "/var/lib/todo/todos.db");
        assert_eq!(config.db.max_open_conns, 10);
        assert_eq!(config.db.max_idle_conns, 5);
        assert_eq!(config.db.max_idle_time, Duration::from_secs(90));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            load(&[("TODO_PORT", "http")]),
            Err(ConfigError::InvalidValue { key, .. }) if key == "TODO_PORT"
        ));
        assert!(load(&[("TODO_DB_MAX_IDLE_TIME", "15 minutes")]).is_err());
        assert!(load(&[("TODO_DB_MAX_OPEN_CONNS", "0")]).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("5d"), None);
    }
}
