//! Error types for kanava

use thiserror::Error;

// Re-export plugin-boundary errors from kanava-core
pub use kanava_core::{FailureKind, PluginError};

/// Result type alias for kanava operations
pub type Result<T> = std::result::Result<T, KanavaError>;

/// Main error type for kanava
#[derive(Error, Debug)]
pub enum KanavaError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A plugin failed while the pipeline was starting; the pipeline does
    /// not begin serving
    #[error("failed to start {component}: {source}")]
    Startup {
        component: &'static str,
        #[source]
        source: PluginError,
    },

    /// Plugin error outside startup
    #[error("plugin '{plugin}' error: {message}")]
    Plugin { plugin: String, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Metrics registration error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl KanavaError {
    /// Wrap a startup failure of `component`
    pub fn startup(component: &'static str, source: PluginError) -> Self {
        KanavaError::Startup { component, source }
    }

    /// Failure classification of this error
    pub fn kind(&self) -> FailureKind {
        match self {
            KanavaError::Startup { .. } | KanavaError::Config(_) => FailureKind::Fatal,
            KanavaError::Serialization(_) => FailureKind::Malformed,
            _ => FailureKind::Transient,
        }
    }
}

impl From<PluginError> for KanavaError {
    fn from(err: PluginError) -> Self {
        KanavaError::Plugin {
            plugin: "unknown".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<prometheus::Error> for KanavaError {
    fn from(err: prometheus::Error) -> Self {
        KanavaError::Metrics(err.to_string())
    }
}

impl From<serde_json::Error> for KanavaError {
    fn from(err: serde_json::Error) -> Self {
        KanavaError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_error_to_kanava_error() {
        let plugin_err = PluginError::Init("failed to connect".to_string());
        let err: KanavaError = plugin_err.into();
        assert!(matches!(err, KanavaError::Plugin { .. }));
    }

    #[test]
    fn test_startup_error_is_fatal() {
        let err = KanavaError::startup("source", PluginError::Connection("refused".into()));
        assert_eq!(err.kind(), FailureKind::Fatal);
        assert_eq!(
            err.to_string(),
            "failed to start source: connection error: refused"
        );
    }
}
