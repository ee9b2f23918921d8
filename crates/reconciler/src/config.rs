//! Configuration for the reconciler.
//!
//! A [`ReconcilerConfig`] can be built in code, parsed from TOML, or layered
//! from `CONVERGE_*` environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `CONVERGE_MAX_CONCURRENCY` | `max_concurrency` |
//! | `CONVERGE_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `CONVERGE_RETRY_BASE_BACKOFF_MS` | `retry.base_backoff_ms` |
//! | `CONVERGE_RETRY_MAX_BACKOFF_MS` | `retry.max_backoff_ms` |
//! | `CONVERGE_RETRY_JITTER` | `retry.jitter` |
//! | `CONVERGE_REQUEST_TIMEOUT_SECS` | `request_timeout_secs` |
//! | `CONVERGE_PRUNE_ENABLED` | `prune.enabled` |
//! | `CONVERGE_PRUNE_KINDS` | `prune.kinds`, as `v1/ConfigMap,apps/v1/Deployment` |
//! | `CONVERGE_ABORT_ON_UNAUTHORIZED` | `abort_on_unauthorized` |
//! | `CONVERGE_ROLLOUT_ON_CONFIG_CHANGE` | `rollout_on_config_change` |

use std::str::FromStr;
use std::time::Duration;

use converge_core::KindRef;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ENV_PREFIX: &str = "CONVERGE_";

/// Retry bounds shared by conflicts and transient errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: true,
        }
    }
}

/// Pruning settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Kinds listed each pass to find managed objects the inventory misses,
    /// for example after a restart.
    #[serde(default)]
    pub kinds: Vec<KindRef>,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kinds: Vec::new(),
        }
    }
}

/// Configuration for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Maximum keys processed in parallel.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Bound applied to every cluster call.
    #[serde(
        rename = "request_timeout_secs",
        with = "duration_secs",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,

    #[serde(default)]
    pub prune: PruneConfig,

    /// Abort the whole pass when the cluster rejects our credentials.
    #[serde(default = "default_true")]
    pub abort_on_unauthorized: bool,

    /// Force-update workloads that mount a ConfigMap or Secret updated in
    /// the same pass.
    #[serde(default = "default_true")]
    pub rollout_on_config_change: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry: RetryConfig::default(),
            request_timeout: default_request_timeout(),
            prune: PruneConfig::default(),
            abort_on_unauthorized: true,
            rollout_on_config_change: true,
        }
    }
}

impl ReconcilerConfig {
    /// Set the worker pool size.
    #[must_use]
    pub const fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the maximum attempts per key.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Set the backoff bounds in milliseconds.
    #[must_use]
    pub const fn backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.retry.base_backoff_ms = base_ms;
        self.retry.max_backoff_ms = max_ms;
        self
    }

    /// Enable or disable backoff jitter.
    #[must_use]
    pub const fn jitter(mut self, enabled: bool) -> Self {
        self.retry.jitter = enabled;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable or disable pruning.
    #[must_use]
    pub const fn prune_enabled(mut self, enabled: bool) -> Self {
        self.prune.enabled = enabled;
        self
    }

    /// Add a kind to list when looking for prune candidates.
    #[must_use]
    pub fn prune_kind(mut self, kind: KindRef) -> Self {
        self.prune.kinds.push(kind);
        self
    }

    /// Choose whether credential rejection aborts the pass.
    #[must_use]
    pub const fn abort_on_unauthorized(mut self, abort: bool) -> Self {
        self.abort_on_unauthorized = abort;
        self
    }

    /// Choose whether updated ConfigMaps and Secrets roll the workloads
    /// mounting them.
    #[must_use]
    pub const fn rollout_on_config_change(mut self, enabled: bool) -> Self {
        self.rollout_on_config_change = enabled;
        self
    }

    /// Parse and validate a TOML document. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on a parse error or failed validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::invalid_config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `CONVERGE_*` environment variables over the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when a variable does not parse or the result
    /// fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().with_overrides(lookup)
    }

    /// Apply `CONVERGE_*` overrides read through `lookup` on top of `self`.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(raw) = var("MAX_CONCURRENCY") {
            self.max_concurrency = parse_var("MAX_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = var("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var("RETRY_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = var("RETRY_BASE_BACKOFF_MS") {
            self.retry.base_backoff_ms = parse_var("RETRY_BASE_BACKOFF_MS", &raw)?;
        }
        if let Some(raw) = var("RETRY_MAX_BACKOFF_MS") {
            self.retry.max_backoff_ms = parse_var("RETRY_MAX_BACKOFF_MS", &raw)?;
        }
        if let Some(raw) = var("RETRY_JITTER") {
            self.retry.jitter = parse_bool("RETRY_JITTER", &raw)?;
        }
        if let Some(raw) = var("REQUEST_TIMEOUT_SECS") {
            self.request_timeout =
                Duration::from_secs(parse_var("REQUEST_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = var("PRUNE_ENABLED") {
            self.prune.enabled = parse_bool("PRUNE_ENABLED", &raw)?;
        }
        if let Some(raw) = var("PRUNE_KINDS") {
            self.prune.kinds = parse_kinds(&raw)?;
        }
        if let Some(raw) = var("ABORT_ON_UNAUTHORIZED") {
            self.abort_on_unauthorized = parse_bool("ABORT_ON_UNAUTHORIZED", &raw)?;
        }
        if let Some(raw) = var("ROLLOUT_ON_CONFIG_CHANGE") {
            self.rollout_on_config_change = parse_bool("ROLLOUT_ON_CONFIG_CHANGE", &raw)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Check the invariants the driver relies on.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first violated bound.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::invalid_config("max_concurrency must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::invalid_config("retry.max_attempts must be positive"));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::invalid_config(format!(
                "retry.base_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.base_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::invalid_config("request_timeout_secs must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T>(suffix: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::invalid_config(format!("{ENV_PREFIX}{suffix}={raw}: {e}")))
}

fn parse_bool(suffix: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::invalid_config(format!(
            "{ENV_PREFIX}{suffix}={raw}: expected a boolean"
        ))),
    }
}

/// Parse `v1/ConfigMap,apps/v1/Deployment`; the kind follows the last `/`.
fn parse_kinds(raw: &str) -> Result<Vec<KindRef>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .rsplit_once('/')
                .filter(|(api_version, kind)| !api_version.is_empty() && !kind.is_empty())
                .map(|(api_version, kind)| KindRef::new(api_version, kind))
                .ok_or_else(|| {
                    Error::invalid_config(format!(
                        "{ENV_PREFIX}PRUNE_KINDS entry '{entry}' is not apiVersion/Kind"
                    ))
                })
        })
        .collect()
}

const fn default_max_concurrency() -> usize {
    10
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_true() -> bool {
    true
}

/// Serialization helper for Duration as seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
