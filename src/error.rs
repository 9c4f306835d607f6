use thiserror::Error;

#[derive(Error, Debug)]
pub enum KubedoxError {
    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error("Watch failed for {kind}: {reason}")]
    WatchFailed { kind: &'static str, reason: String },

    #[error("waiting till full synchronization")]
    NotSynced,

    #[error("Malformed {kind} object: {reason}")]
    MalformedObject { kind: &'static str, reason: String },

    #[error("Invalid API document from {hostname}: {reason}")]
    InvalidDocument { hostname: String, reason: String },

    #[error("Handler error: {0}")]
    HandlerError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<prometheus::Error> for KubedoxError {
    fn from(e: prometheus::Error) -> Self {
        KubedoxError::MetricsError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KubedoxError>;
