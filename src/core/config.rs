use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, ScopeError};

/// Configuration for scope behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScopeConfig {
    /// Label used in log output
    pub label: String,
    /// Keep failed resolutions in the store (a later resolve returns the same error)
    pub cache_failures: bool,
    /// Default nesting depth instrumented by `Pipeline::wrap_services`
    pub service_depth: usize,
    /// Install a `TracingInstrument` on the scope at construction
    pub trace_resolutions: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            label: "scope".to_string(),
            cache_failures: true,
            service_depth: 3,
            trace_resolutions: false,
        }
    }
}

impl ScopeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(ScopeError::configuration("label cannot be empty"));
        }
        if self.service_depth == 0 {
            return Err(ScopeError::configuration("service_depth must be at least 1"));
        }
        Ok(())
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_cache_failures(mut self, cache_failures: bool) -> Self {
        self.cache_failures = cache_failures;
        self
    }

    pub fn with_tracing(mut self) -> Self {
        self.trace_resolutions = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ScopeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_depth() {
        let config = ScopeConfig {
            service_depth: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ScopeError::Configuration { .. })
        ));
    }

    #[test]
    fn test_partial_json() {
        let config: ScopeConfig =
            serde_json::from_str(r#"{"label": "request", "cache_failures": false}"#).unwrap();
        assert_eq!(config.label, "request");
        assert!(!config.cache_failures);
        assert_eq!(config.service_depth, 3);
    }
}
