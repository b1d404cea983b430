//! Environment access behind a trait so configuration can be tested without
//! touching the process environment.

use std::env::VarError;

pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, VarError>;
}

/// Delegates to `std::env`.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, VarError> {
        std::env::var(key)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use in_memory::InMemoryEnv;

#[cfg(any(test, feature = "test-support"))]
mod in_memory {
    use std::collections::HashMap;
    use std::env::VarError;
    use std::sync::Mutex;

    use super::ReadEnv;

    /// Map-backed environment. `Send + Sync` so it can cross `.await` points in
    /// multi-threaded tests.
    #[derive(Default)]
    pub struct InMemoryEnv {
        vars: Mutex<HashMap<String, String>>,
    }

    impl InMemoryEnv {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
            self.vars.lock().unwrap().insert(key.into(), value.into());
        }

        pub fn remove(&self, key: &str) {
            self.vars.lock().unwrap().remove(key);
        }
    }

    impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for InMemoryEnv {
        fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
            let env = Self::new();
            for (k, v) in iter {
                env.set(k, v);
            }
            env
        }
    }

    impl ReadEnv for InMemoryEnv {
        fn var(&self, key: &str) -> Result<String, VarError> {
            self.vars
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or(VarError::NotPresent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_matches_std() {
        assert_eq!(SystemEnv.var("PATH").is_ok(), std::env::var("PATH").is_ok());
    }

    #[test]
    fn in_memory_env_set_get_remove() {
        let env = InMemoryEnv::new();
        env.set("REDIS_URL", "redis://cache:6379");
        assert_eq!(env.var("REDIS_URL").unwrap(), "redis://cache:6379");

        env.remove("REDIS_URL");
        assert!(matches!(env.var("REDIS_URL"), Err(VarError::NotPresent)));
    }

    #[test]
    fn in_memory_env_from_pairs() {
        let env: InMemoryEnv = [("LOCK_TTL_MS", "500"), ("LOCK_KEY_PREFIX", "jobs:")]
            .into_iter()
            .collect();
        assert_eq!(env.var("LOCK_TTL_MS").unwrap(), "500");
        assert_eq!(env.var("LOCK_KEY_PREFIX").unwrap(), "jobs:");
    }
}
