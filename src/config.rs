//! Operator configuration
//!
//! Every setting is a flag with an environment variable fallback so the
//! operator can be configured from a Deployment manifest.

use std::time::Duration;

use clap::Parser;

use crate::adapters::DerivedCredentials;
use crate::backoff::Backoff;
use crate::controllers::DispatcherConfig;
use crate::error::{Error, Result};

#[derive(Clone, Debug, Parser)]
#[command(name = "database-operator", version, about)]
pub struct OperatorConfig {
    /// Only watch Database resources in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Port for /metrics, /healthz and /readyz
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Maximum concurrent reconciliations
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = 8)]
    pub workers: usize,

    /// Initial retry delay for degraded intents, in milliseconds
    #[arg(long, env = "RETRY_INITIAL_MS", default_value_t = 500)]
    pub retry_initial_ms: u64,

    /// Maximum retry delay for degraded intents, in seconds
    #[arg(long, env = "RETRY_MAX_SECS", default_value_t = 300)]
    pub retry_max_secs: u64,

    /// Maximum delay between watch reconnect attempts, in seconds
    #[arg(long, env = "WATCH_BACKOFF_MAX_SECS", default_value_t = 30)]
    pub watch_backoff_max_secs: u64,

    /// Grace period for in-flight reconciliations on shutdown, in seconds
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Hex encoded seed for credential derivation (random when unset)
    #[arg(long, env = "CREDENTIAL_SEED", hide_env_values = true)]
    pub credential_seed: Option<String>,
}

impl OperatorConfig {
    /// Check value ranges clap cannot express
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.retry_initial_ms == 0 {
            return Err(Error::config("retry initial delay must be positive"));
        }
        if Duration::from_millis(self.retry_initial_ms) > Duration::from_secs(self.retry_max_secs) {
            return Err(Error::config(
                "retry initial delay must not exceed the maximum delay",
            ));
        }
        Ok(())
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers,
            retry: Backoff::new(
                Duration::from_millis(self.retry_initial_ms),
                Duration::from_secs(self.retry_max_secs),
            ),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn watch_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(500),
            Duration::from_secs(self.watch_backoff_max_secs.max(1)),
        )
    }

    /// Credential policy from the configured seed
    pub fn credentials(&self) -> Result<DerivedCredentials> {
        match &self.credential_seed {
            Some(seed) => DerivedCredentials::from_hex(seed),
            None => Ok(DerivedCredentials::random()),
        }
    }
}
