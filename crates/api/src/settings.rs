//! Runtime knobs with code defaults. Only the binary reads the environment.

use std::str::FromStr;
use std::time::Duration;

use korral_kubehub::ConnectOptions;
use korral_ops::{CoordinatorConfig, LogConfig, RetryPolicy};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    /// Total attempts per mutation patch, first one included.
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub log_concurrency: usize,
    /// 0 disables the per-pod cap.
    pub log_max_bytes: usize,
    pub history_capacity: usize,
    pub max_replicas: i32,
    pub allow_mutations: bool,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_ms: 200,
            retry_cap_ms: 2_000,
            log_concurrency: 8,
            log_max_bytes: 64 * 1024,
            history_capacity: 64,
            max_replicas: 100,
            allow_mutations: true,
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Defaults overlaid with `KORRAL_*` variables. Unparsable values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            retry_attempts: parse_or(&lookup, "KORRAL_RETRY_ATTEMPTS", d.retry_attempts).max(1),
            retry_base_ms: parse_or(&lookup, "KORRAL_RETRY_BASE_MS", d.retry_base_ms),
            retry_cap_ms: parse_or(&lookup, "KORRAL_RETRY_CAP_MS", d.retry_cap_ms),
            log_concurrency: parse_or(&lookup, "KORRAL_LOG_CONCURRENCY", d.log_concurrency).max(1),
            log_max_bytes: parse_or(&lookup, "KORRAL_LOG_MAX_BYTES", d.log_max_bytes),
            history_capacity: parse_or(&lookup, "KORRAL_HISTORY_CAP", d.history_capacity),
            max_replicas: parse_or(&lookup, "KORRAL_MAX_REPLICAS", d.max_replicas).max(0),
            allow_mutations: lookup("KORRAL_READ_ONLY").map(|v| !truthy(&v)).unwrap_or(d.allow_mutations),
            connect_timeout_secs: parse_or(&lookup, "KORRAL_CONNECT_TIMEOUT_SECS", d.connect_timeout_secs),
            read_timeout_secs: parse_or(&lookup, "KORRAL_READ_TIMEOUT_SECS", d.read_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_cap_ms.max(self.retry_base_ms)),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig { retry: self.retry_policy(), history_capacity: self.history_capacity }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig { max_concurrency: self.log_concurrency, max_bytes_per_pod: self.log_max_bytes }
    }

    pub fn connect_options(&self, kubeconfig: Option<std::path::PathBuf>, context: Option<String>) -> ConnectOptions {
        ConnectOptions {
            kubeconfig,
            context,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }
}

fn parse_or<T: FromStr + Copy>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable setting");
                default
            }
        },
        None => default,
    }
}

fn truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
