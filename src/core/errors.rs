use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

use crate::executor::ExecutorId;

/// Shared, clonable error source.
///
/// Resolutions are memoized and handed to every waiting caller, so errors have
/// to be `Clone`. The original error object stays reachable through
/// [`ScopeError::source_error`] and the standard `source()` chain.
pub type SharedSource = Arc<dyn StdError + Send + Sync>;

fn target_name(executor: &Option<ExecutorId>) -> String {
    match executor {
        Some(id) => id.to_string(),
        None => "stored value".to_string(),
    }
}

/// Unified error type for resolution, families, instrumentation and streams
#[derive(Debug, Clone, Error)]
pub enum ScopeError {
    /// A provider returned an error
    #[error("Provider of {executor} failed: {message}")]
    Provider {
        executor: ExecutorId,
        message: String,
        #[source]
        source: SharedSource,
    },

    /// A dependency failed before the dependent work could run
    #[error("Dependency resolution failed: {source}")]
    Dependency {
        #[source]
        source: Box<ScopeError>,
    },

    /// The runner passed to `safe_run` failed after its dependency resolved
    #[error("Runner failed: {message}")]
    Runner {
        message: String,
        #[source]
        source: SharedSource,
    },

    /// Provider arity disagrees with the declared input
    #[error("Arity mismatch: {message}")]
    Arity { message: String },

    /// A unary provider received no value for its input
    #[error("{executor} expects an input value but its dependency resolved to nothing")]
    MissingInput { executor: ExecutorId },

    /// Executor shape does not support the requested operation
    #[error("Shape error: {message}")]
    Shape { message: String },

    /// A family key builder produced an empty key
    #[error("Family key normalized to an empty string")]
    EmptyKey,

    /// A stored value is not of the requested type
    #[error("Type mismatch for {}: expected {expected}", target_name(.executor))]
    TypeMismatch {
        executor: Option<ExecutorId>,
        expected: &'static str,
    },

    /// The executor resolved to no value
    #[error("{executor} resolved to no value")]
    Absent { executor: ExecutorId },

    /// A provider or callback panicked
    #[error("Panicked: {message}")]
    Panicked { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Key or value serialization failed
    #[error("Serialization failed: {message}")]
    Serialization {
        message: String,
        #[source]
        source: SharedSource,
    },

    /// Error signal carried by an observable
    #[error("Stream error: {message}")]
    Stream {
        message: String,
        #[source]
        source: Option<SharedSource>,
    },
}

impl ScopeError {
    /// Create a provider error from an `anyhow` error, keeping its chain
    pub fn provider(executor: ExecutorId, err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        let boxed: Box<dyn StdError + Send + Sync> = err.into();
        Self::Provider {
            executor,
            message,
            source: Arc::from(boxed),
        }
    }

    /// Wrap an error raised while resolving a dependency
    pub fn dependency(err: ScopeError) -> Self {
        Self::Dependency {
            source: Box::new(err),
        }
    }

    /// Create a runner error from an `anyhow` error
    pub fn runner(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        let boxed: Box<dyn StdError + Send + Sync> = err.into();
        Self::Runner {
            message,
            source: Arc::from(boxed),
        }
    }

    pub fn arity<S: Into<String>>(message: S) -> Self {
        Self::Arity {
            message: message.into(),
        }
    }

    pub fn shape<S: Into<String>>(message: S) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }

    pub fn type_mismatch<T: ?Sized>(executor: Option<ExecutorId>) -> Self {
        Self::TypeMismatch {
            executor,
            expected: std::any::type_name::<T>(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a stream error with a plain message
    pub fn stream<S: Into<String>>(message: S) -> Self {
        Self::Stream {
            message: message.into(),
            source: None,
        }
    }

    /// Create a stream error from an `anyhow` error
    pub fn stream_from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        let boxed: Box<dyn StdError + Send + Sync> = err.into();
        Self::Stream {
            message,
            source: Some(Arc::from(boxed)),
        }
    }

    /// Build a panic error from a `catch_unwind` payload
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked { message }
    }

    /// The original error raised by user code, if this error carries one.
    ///
    /// Walks through `Dependency` wrappers.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Provider { source, .. } | Self::Runner { source, .. } => Some(source.as_ref()),
            Self::Stream { source, .. } => source.as_deref(),
            Self::Dependency { source } => source.source_error(),
            _ => None,
        }
    }

    /// Innermost error once `Dependency` wrappers are removed
    pub fn root(&self) -> &ScopeError {
        match self {
            Self::Dependency { source } => source.root(),
            other => other,
        }
    }

    /// Usage errors are raised immediately and indicate a programming mistake
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::Arity { .. } | Self::Shape { .. } | Self::EmptyKey | Self::Configuration { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Provider { .. } => "provider",
            Self::Dependency { .. } => "dependency",
            Self::Runner { .. } => "runner",
            Self::Arity { .. } => "arity",
            Self::MissingInput { .. } => "missing_input",
            Self::Shape { .. } => "shape",
            Self::EmptyKey => "empty_key",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Absent { .. } => "absent",
            Self::Panicked { .. } => "panicked",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Stream { .. } => "stream",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ScopeError>;

impl From<serde_json::Error> for ScopeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
            source: Arc::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("db down")]
    struct DbDown;

    #[test]
    fn test_provider_error_keeps_original() {
        let err = ScopeError::provider(ExecutorId(7), anyhow::Error::new(DbDown));
        assert_eq!(err.category(), "provider");
        let original = err.source_error().expect("source kept");
        assert!(original.downcast_ref::<DbDown>().is_some());
        assert!(err.to_string().contains("executor#7"));
    }

    #[test]
    fn test_dependency_wrapping() {
        let inner = ScopeError::provider(ExecutorId(1), anyhow::anyhow!("boom"));
        let err = ScopeError::dependency(inner);
        assert_eq!(err.category(), "dependency");
        assert!(matches!(err.root(), ScopeError::Provider { .. }));
        assert!(err.source_error().is_some());
    }

    #[test]
    fn test_usage_errors() {
        assert!(ScopeError::EmptyKey.is_usage_error());
        assert!(ScopeError::arity("x").is_usage_error());
        assert!(!ScopeError::Absent { executor: ExecutorId(1) }.is_usage_error());
    }

    #[test]
    fn test_type_mismatch_names_executor() {
        let err = ScopeError::type_mismatch::<String>(Some(ExecutorId(3)));
        assert_eq!(
            err.to_string(),
            "Type mismatch for executor#3: expected alloc::string::String"
        );
        let err = ScopeError::type_mismatch::<u8>(None);
        assert_eq!(err.to_string(), "Type mismatch for stored value: expected u8");
    }

    #[test]
    fn test_panic_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("bad");
        let err = ScopeError::from_panic(payload);
        assert!(matches!(err, ScopeError::Panicked { ref message } if message == "bad"));
    }
}
