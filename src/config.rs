//! Clone configuration and normative limits.

use serde::{Deserialize, Serialize};

use crate::core::triple::Context;
use crate::error::EngineError;

/// Configuration of one clone of one domain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Local clone identity; unique per domain, stable across restarts.
    #[serde(rename = "@id")]
    pub id: String,

    /// Domain name. Must equal the stored domain if the dataset is
    /// non-empty.
    #[serde(rename = "@domain")]
    pub domain: String,

    /// JSON-LD context defaults; derived from the domain if absent.
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,

    /// True iff this clone bootstraps a new domain.
    #[serde(default)]
    pub genesis: bool,

    /// Upper bound on request/reply waits, in milliseconds.
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,

    /// Per-operation encoded size cap in bytes; unbounded if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_operation_size: Option<usize>,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub limits: Limits,
}

fn default_network_timeout_ms() -> u64 {
    5000
}

impl CloneConfig {
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            context: None,
            genesis: false,
            network_timeout_ms: default_network_timeout_ms(),
            max_operation_size: None,
            log_level: LogLevel::default(),
            limits: Limits::default(),
        }
    }

    pub fn genesis(mut self, genesis: bool) -> Self {
        self.genesis = genesis;
        self
    }

    /// The effective JSON-LD context: configured, or derived from the
    /// domain name.
    pub fn effective_context(&self) -> Context {
        self.context
            .clone()
            .unwrap_or_else(|| Context::for_domain(&self.domain))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.is_empty() {
            return Err(EngineError::InvalidConfig {
                field: "@id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.domain.is_empty() {
            return Err(EngineError::InvalidConfig {
                field: "@domain",
                reason: "must not be empty".to_string(),
            });
        }
        let valid_domain = self
            .domain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
        if !valid_domain {
            return Err(EngineError::InvalidConfig {
                field: "@domain",
                reason: format!("`{}` is not a valid domain name", self.domain),
            });
        }
        if self.network_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig {
                field: "networkTimeout",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Normative safety limits. Values are explicit about their units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Reorder buffer cap: operations held waiting for causal
    /// predecessors.
    pub max_buffered_operations: usize,
    pub max_buffered_bytes: usize,

    /// Encoded payloads above this size leave UTF-8 JSON for the
    /// compressed binary stages.
    pub compress_threshold_bytes: usize,

    /// Rev-up retry schedule.
    pub revup_max_retries: u32,
    pub revup_backoff_base_ms: u64,
    pub revup_backoff_ceiling_ms: u64,

    /// Status/update stream subscriber caps.
    pub max_subscribers: usize,
    pub subscriber_queue_events: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_buffered_operations: 10_000,
            max_buffered_bytes: 16 * 1024 * 1024,
            compress_threshold_bytes: 1024,
            revup_max_retries: 8,
            revup_backoff_base_ms: 100,
            revup_backoff_ceiling_ms: 30_000,
            max_subscribers: 64,
            subscriber_queue_events: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_normative() {
        let limits = Limits::default();
        assert_eq!(limits.max_buffered_operations, 10_000);
        assert_eq!(limits.max_buffered_bytes, 16 * 1024 * 1024);
        assert_eq!(limits.compress_threshold_bytes, 1024);
        assert_eq!(limits.revup_max_retries, 8);
        assert_eq!(limits.revup_backoff_base_ms, 100);
        assert_eq!(limits.revup_backoff_ceiling_ms, 30_000);
        assert_eq!(limits.max_subscribers, 64);
        assert_eq!(limits.subscriber_queue_events, 1024);
    }

    #[test]
    fn config_parses_jsonld_keys() {
        let raw = serde_json::json!({
            "@id": "alice",
            "@domain": "test.example.org",
            "genesis": true,
        });
        let config: CloneConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.id, "alice");
        assert!(config.genesis);
        assert_eq!(config.network_timeout_ms, 5000);
        assert!(config.max_operation_size.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_fields() {
        assert!(CloneConfig::new("", "d.example").validate().is_err());
        assert!(CloneConfig::new("a", "").validate().is_err());
        assert!(CloneConfig::new("a", "Has Caps").validate().is_err());
        let mut config = CloneConfig::new("a", "d.example");
        config.network_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_context_follows_the_domain() {
        let config = CloneConfig::new("a", "d.example");
        let ctx = config.effective_context();
        assert_eq!(ctx.base.unwrap().as_str(), "http://d.example/");
        assert_eq!(ctx.vocab.unwrap().as_str(), "http://d.example/#");
    }
}
