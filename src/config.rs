use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;

use crate::error::{EngineError, EngineResult};

/// Domain names look like reversed hostnames, e.g. `test.example.org`.
static DOMAIN_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+([\-.][a-z0-9]+)*\.[a-z]{2,}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// JSON-LD context defaults applied to subject documents read from and
/// written to the clone. Both are derived from the domain unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub base: String,
    pub vocab: String,
}

impl ContextConfig {
    pub fn for_domain(domain: &str) -> Self {
        Self {
            base: format!("http://{}/", domain),
            vocab: format!("http://{}/#", domain),
        }
    }
}

/// Configuration for a single clone of a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Local clone identity; unique per domain, stable across restarts
    /// if the dataset is persistent.
    pub id: String,
    /// Domain name; must equal the stored domain if the dataset is non-empty.
    pub domain: String,
    /// JSON-LD context defaults.
    pub context: ContextConfig,
    /// True iff this clone bootstraps a new domain.
    pub genesis: bool,
    /// Upper bound on request/reply waits, in milliseconds.
    pub network_timeout_ms: u64,
    /// Per-operation encoded size cap in bytes; `None` means unlimited.
    pub max_operation_size: Option<usize>,
    /// Cap on the causal reorder buffer; overflow forces a new snapshot.
    pub max_buffered: usize,
    pub log_level: LogLevel,
    /// Constraint descriptors, resolved against the constraint registry.
    #[serde(default)]
    pub constraints: Vec<serde_json::Value>,
}

impl CloneConfig {
    pub fn new(id: impl Into<String>, domain: impl Into<String>, genesis: bool) -> Self {
        let domain = domain.into();
        Self {
            id: id.into(),
            context: ContextConfig::for_domain(&domain),
            domain,
            genesis,
            network_timeout_ms: 5000,
            max_operation_size: None,
            max_buffered: 100,
            log_level: LogLevel::Info,
            constraints: Vec::new(),
        }
    }

    pub fn from_env() -> EngineResult<Self> {
        let id = env::var("CLONE_ID")
            .map_err(|_| EngineError::Configuration("CLONE_ID is required".to_string()))?;
        let domain = env::var("CLONE_DOMAIN")
            .map_err(|_| EngineError::Configuration("CLONE_DOMAIN is required".to_string()))?;
        let genesis = env::var("CLONE_GENESIS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let mut config = Self::new(id, domain, genesis);
        if let Ok(timeout) = env::var("NETWORK_TIMEOUT_MS") {
            config.network_timeout_ms = timeout.parse().unwrap_or(5000);
        }
        if let Ok(max) = env::var("MAX_OPERATION_SIZE") {
            config.max_operation_size = max.parse().ok();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.id.is_empty() {
            return Err(EngineError::Configuration(
                "clone id must not be empty".to_string(),
            ));
        }
        if !DOMAIN_NAME.is_match(&self.domain) {
            return Err(EngineError::Configuration(format!(
                "'{}' is not a valid domain name",
                self.domain
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_domain_names() {
        for domain in ["test.example.org", "a.io", "sub-part.domain.com"] {
            let config = CloneConfig::new("clone1", domain, true);
            assert!(config.validate().is_ok(), "{} should validate", domain);
        }
    }

    #[test]
    fn invalid_domain_names() {
        for domain in ["", "nodots", "UPPER.example.org", ".leading.org"] {
            let config = CloneConfig::new("clone1", domain, true);
            assert!(config.validate().is_err(), "{} should fail", domain);
        }
    }

    #[test]
    fn context_derived_from_domain() {
        let config = CloneConfig::new("clone1", "test.example.org", true);
        assert_eq!(config.context.base, "http://test.example.org/");
        assert_eq!(config.context.vocab, "http://test.example.org/#");
    }

    #[test]
    fn defaults() {
        let config = CloneConfig::new("clone1", "test.example.org", false);
        assert_eq!(config.network_timeout_ms, 5000);
        assert!(config.max_operation_size.is_none());
        assert!(!config.genesis);
    }
}
