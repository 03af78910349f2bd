//! Operator settings read from the environment.

use std::{env, time::Duration};

use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Delay before retrying a reconcile that found its device locked
    pub lock_requeue: Duration,

    /// Delay before retrying while a referenced resource is not Configured yet
    pub dependency_requeue: Duration,

    /// Periodic re-reconcile of healthy resources
    pub resync: Duration,

    /// First delay after a transient failure, doubled on every further failure
    pub error_backoff_base: Duration,

    /// Upper bound for the failure backoff
    pub error_backoff_max: Duration,

    /// Break device locks held for longer than this
    pub stale_lock_after: Option<Duration>,

    /// Name of the device provider to load
    pub provider: String,

    /// Address of the diagnostics web server
    pub listen_addr: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            lock_requeue: Duration::from_secs(5),
            dependency_requeue: Duration::from_secs(10),
            resync: Duration::from_secs(5 * 60),
            error_backoff_base: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(5 * 60),
            stale_lock_after: None,
            provider: "simulated".into(),
            listen_addr: "0.0.0.0:8080".into(),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let seconds = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| Error::InvalidConfig(format!("{key}={raw}: {e}"))),
            }
        };

        let config = Self {
            lock_requeue: seconds("LOCK_REQUEUE_SECONDS", defaults.lock_requeue)?,
            dependency_requeue: seconds("DEPENDENCY_REQUEUE_SECONDS", defaults.dependency_requeue)?,
            resync: seconds("RESYNC_SECONDS", defaults.resync)?,
            error_backoff_base: seconds("ERROR_BACKOFF_BASE_SECONDS", defaults.error_backoff_base)?,
            error_backoff_max: seconds("ERROR_BACKOFF_MAX_SECONDS", defaults.error_backoff_max)?,
            stale_lock_after: match lookup("STALE_LOCK_SECONDS") {
                None => None,
                Some(_) => match seconds("STALE_LOCK_SECONDS", Duration::ZERO)? {
                    after if after.is_zero() => {
                        return Err(Error::InvalidConfig(
                            "STALE_LOCK_SECONDS must be greater than 0".into(),
                        ))
                    }
                    after => Some(after),
                },
            },
            provider: lookup("PROVIDER").unwrap_or(defaults.provider),
            listen_addr: lookup("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
        };

        if config.error_backoff_base > config.error_backoff_max {
            return Err(Error::InvalidConfig(
                "ERROR_BACKOFF_BASE_SECONDS exceeds ERROR_BACKOFF_MAX_SECONDS".into(),
            ));
        }

        Ok(config)
    }
}
