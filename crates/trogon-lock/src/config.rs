use std::time::Duration;

use crate::env::ReadEnv;
use crate::error::LockError;

const ENV_REDIS_URL: &str = "REDIS_URL";
const ENV_REDIS_USERNAME: &str = "REDIS_USERNAME";
const ENV_REDIS_PASSWORD: &str = "REDIS_PASSWORD";
const ENV_KEY_PREFIX: &str = "LOCK_KEY_PREFIX";
const ENV_TTL_MS: &str = "LOCK_TTL_MS";
const ENV_POLL_INTERVAL_MS: &str = "LOCK_POLL_INTERVAL_MS";
const ENV_MAX_WAIT_MS: &str = "LOCK_MAX_WAIT_MS";

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_KEY_PREFIX: &str = "lock:";

pub const DEFAULT_TTL: Duration = Duration::from_millis(10_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(15_000);

/// Where the shared cache lives and how lock keys are namespaced in it.
#[derive(Clone)]
pub struct StoreConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub key_prefix: String,
}

impl StoreConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_credentials(mut self, username: Option<String>, password: String) -> Self {
        self.username = username;
        self.password = Some(password);
        self
    }

    pub fn auth_description(&self) -> &'static str {
        match (&self.username, &self.password) {
            (Some(_), Some(_)) => "user/password",
            (None, Some(_)) => "password",
            _ => "none",
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

/// Fallback timings used whenever a caller does not pass its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockDefaults {
    pub ttl: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for LockDefaults {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub store: StoreConfig,
    pub defaults: LockDefaults,
}

impl LockConfig {
    /// Build config from environment variables.
    ///
    /// - `REDIS_URL` (default `redis://127.0.0.1:6379`)
    /// - `REDIS_USERNAME` / `REDIS_PASSWORD`: override credentials in the URL
    /// - `LOCK_KEY_PREFIX` (default `lock:`)
    /// - `LOCK_TTL_MS`, `LOCK_POLL_INTERVAL_MS`, `LOCK_MAX_WAIT_MS`
    ///
    /// Malformed values fail here rather than on the first lock attempt.
    pub fn from_env<E: ReadEnv>(env: &E) -> Result<Self, LockError> {
        let url = non_empty(env, ENV_REDIS_URL).unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
        let mut store = StoreConfig::from_url(url);

        if let Ok(prefix) = env.var(ENV_KEY_PREFIX) {
            store.key_prefix = prefix;
        }
        let username = non_empty(env, ENV_REDIS_USERNAME);
        match (username, non_empty(env, ENV_REDIS_PASSWORD)) {
            (username, Some(password)) => store = store.with_credentials(username, password),
            (Some(_), None) => {
                return Err(LockError::Configuration(format!(
                    "{ENV_REDIS_USERNAME} is set but {ENV_REDIS_PASSWORD} is missing"
                )));
            }
            (None, None) => {}
        }

        let defaults = LockDefaults {
            ttl: millis_from_env(env, ENV_TTL_MS, DEFAULT_TTL)?,
            poll_interval: millis_from_env(env, ENV_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL)?,
            max_wait: millis_from_env(env, ENV_MAX_WAIT_MS, DEFAULT_MAX_WAIT)?,
        };

        Ok(Self { store, defaults })
    }
}

fn non_empty<E: ReadEnv>(env: &E, key: &str) -> Option<String> {
    env.var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn millis_from_env<E: ReadEnv>(
    env: &E,
    key: &str,
    default: Duration,
) -> Result<Duration, LockError> {
    let Some(raw) = non_empty(env, key) else {
        return Ok(default);
    };
    match raw.parse::<u64>() {
        Ok(0) | Err(_) => Err(LockError::Configuration(format!(
            "{key} must be a positive integer number of milliseconds, got '{raw}'"
        ))),
        Ok(ms) => Ok(Duration::from_millis(ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::InMemoryEnv;

    #[test]
    fn from_env_uses_defaults() {
        let config = LockConfig::from_env(&InMemoryEnv::new()).unwrap();

        assert_eq!(config.store.url, "redis://127.0.0.1:6379");
        assert_eq!(config.store.key_prefix, "lock:");
        assert_eq!(config.store.auth_description(), "none");
        assert_eq!(config.defaults.ttl, Duration::from_millis(10_000));
        assert_eq!(config.defaults.poll_interval, Duration::from_millis(50));
        assert_eq!(config.defaults.max_wait, Duration::from_millis(15_000));
    }

    #[test]
    fn from_env_reads_overrides() {
        let env: InMemoryEnv = [
            ("REDIS_URL", "redis://cache.internal:6380/2"),
            ("LOCK_KEY_PREFIX", "billing:lock:"),
            ("LOCK_TTL_MS", "2500"),
            ("LOCK_POLL_INTERVAL_MS", "20"),
            ("LOCK_MAX_WAIT_MS", "1000"),
        ]
        .into_iter()
        .collect();

        let config = LockConfig::from_env(&env).unwrap();

        assert_eq!(config.store.url, "redis://cache.internal:6380/2");
        assert_eq!(config.store.key_prefix, "billing:lock:");
        assert_eq!(config.defaults.ttl, Duration::from_millis(2500));
        assert_eq!(config.defaults.poll_interval, Duration::from_millis(20));
        assert_eq!(config.defaults.max_wait, Duration::from_millis(1000));
    }

    #[test]
    fn empty_prefix_is_allowed() {
        let env: InMemoryEnv = [("LOCK_KEY_PREFIX", "")].into_iter().collect();
        assert_eq!(LockConfig::from_env(&env).unwrap().store.key_prefix, "");
    }

    #[test]
    fn non_numeric_ttl_is_a_configuration_error() {
        let env: InMemoryEnv = [("LOCK_TTL_MS", "ten seconds")].into_iter().collect();
        let err = LockConfig::from_env(&env).unwrap_err();
        assert!(matches!(err, LockError::Configuration(_)));
        assert!(err.to_string().contains("LOCK_TTL_MS"));
    }

    #[test]
    fn zero_max_wait_is_rejected() {
        let env: InMemoryEnv = [("LOCK_MAX_WAIT_MS", "0")].into_iter().collect();
        let err = LockConfig::from_env(&env).unwrap_err();
        assert!(err.to_string().contains("LOCK_MAX_WAIT_MS"));
    }

    #[test]
    fn password_without_username() {
        let env: InMemoryEnv = [("REDIS_PASSWORD", "s3cret")].into_iter().collect();
        let config = LockConfig::from_env(&env).unwrap();
        assert_eq!(config.store.password.as_deref(), Some("s3cret"));
        assert_eq!(config.store.auth_description(), "password");
    }

    #[test]
    fn username_requires_password() {
        let env: InMemoryEnv = [("REDIS_USERNAME", "scheduler")].into_iter().collect();
        assert!(matches!(
            LockConfig::from_env(&env),
            Err(LockError::Configuration(_))
        ));
    }

    #[test]
    fn debug_output_redacts_password() {
        let store = StoreConfig::from_url("redis://localhost")
            .with_credentials(Some("scheduler".into()), "s3cret".into());
        let rendered = format!("{store:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }
}
