//! Process-wide settings, built once in `main`.

use std::time::Duration;

use cvd_instances::{RuntimeLayout, DEFAULT_LAUNCHER_TIMEOUT, DEFAULT_LOCK_TIMEOUT};
use tracing::warn;

pub const LOCK_TIMEOUT_ENV: &str = "CVD_LOCK_TIMEOUT_SECS";
pub const LAUNCHER_TIMEOUT_ENV: &str = "CVD_LAUNCHER_TIMEOUT_SECS";

/// Runtime layout and the timeouts applied at blocking I/O sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvdConfig {
    pub layout: RuntimeLayout,
    /// Bound on waiting for the database file lock.
    pub lock_timeout: Duration,
    /// Bound on waiting for a launcher monitor reply.
    pub launcher_timeout: Duration,
}

impl CvdConfig {
    /// Settings derived from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Settings derived from `lookup`. Unparseable timeouts fall back to the
    /// defaults.
    #[must_use]
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            layout: RuntimeLayout::resolve(&lookup),
            lock_timeout: seconds(&lookup, LOCK_TIMEOUT_ENV).unwrap_or(DEFAULT_LOCK_TIMEOUT),
            launcher_timeout: seconds(&lookup, LAUNCHER_TIMEOUT_ENV).unwrap_or(DEFAULT_LAUNCHER_TIMEOUT),
        }
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(e) => {
            warn!(variable = key, value = %raw, error = %e, "ignoring invalid timeout");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use super::*;

    fn resolve(vars: &[(&str, &str)]) -> CvdConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        CvdConfig::resolve(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = resolve(&[]);
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.launcher_timeout, DEFAULT_LAUNCHER_TIMEOUT);
        assert_eq!(config.layout.root(), Path::new("/tmp/cvd"));
    }

    #[test]
    fn timeouts_are_read_in_seconds() {
        let config = resolve(&[(LOCK_TIMEOUT_ENV, "3"), (LAUNCHER_TIMEOUT_ENV, "x"), ("CVD_RUNTIME_DIR", "/r")]);
        assert_eq!(config.lock_timeout, Duration::from_secs(3));
        assert_eq!(config.launcher_timeout, DEFAULT_LAUNCHER_TIMEOUT);
        assert_eq!(config.layout.database_path(), Path::new("/r/instance_database.json"));
    }
}
