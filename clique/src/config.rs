//! Runtime configuration for clique bootstrap.
//!
//! All values have sensible defaults. Override via environment variables or
//! by constructing a custom `CollectivesConfig`.

use std::time::Duration;

/// Settings consumed at process startup.
#[derive(Debug, Clone)]
pub struct CollectivesConfig {
    /// Resolve non-local groups through one process-wide callback.
    pub global: bool,

    /// Bound on the whole exchange (publish/fetch plus agreement).
    pub exchange_timeout: Duration,

    /// Bound on the originator's publish call alone.
    pub publish_timeout: Duration,
}

impl Default for CollectivesConfig {
    fn default() -> Self {
        Self {
            global: false,
            exchange_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl CollectivesConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `NCCL_COMM_ID`: when set, NCCL bootstraps through a fixed address
    ///   shared by the whole job, so global config is active.
    /// - `CLIQUE_GLOBAL_CONFIG` (`1`/`true`/`0`/`false`): overrides the above.
    /// - `CLIQUE_EXCHANGE_TIMEOUT_SECS`
    /// - `CLIQUE_PUBLISH_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if lookup("NCCL_COMM_ID").is_some() {
            cfg.global = true;
        }
        if let Some(v) = lookup("CLIQUE_GLOBAL_CONFIG") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" => cfg.global = true,
                "0" | "false" => cfg.global = false,
                other => tracing::warn!(value = other, "ignoring CLIQUE_GLOBAL_CONFIG"),
            }
        }
        if let Some(v) = lookup("CLIQUE_EXCHANGE_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.exchange_timeout = Duration::from_secs(s);
            }
        }
        if let Some(v) = lookup("CLIQUE_PUBLISH_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.publish_timeout = Duration::from_secs(s);
            }
        }

        cfg
    }

    pub fn with_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}
