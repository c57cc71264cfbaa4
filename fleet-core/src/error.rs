// fleet-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {

    #[error("Authentication error: {message}")]
    Unauthenticated {
        message: String,
    },

    #[error("Server not ready: {message}")]
    NotReady {
        message: String,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
    },

    #[error("Bad request data: {message}")]
    BadRequestData {
        message: String,
    },

    #[error("Execution error: {message}")]
    Execution {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Snapshot error at '{path}': {message}")]
    Snapshot {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, FleetError>;

// Convenience constructors
impl FleetError {

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated { message: message.into() }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady { message: message.into() }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    pub fn bad_request_data(message: impl Into<String>) -> Self {
        Self::BadRequestData { message: message.into() }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            source: None,
        }
    }

    pub fn execution_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn snapshot(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Snapshot {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn snapshot_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Snapshot {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Short error string safe to return to a remote client.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::Unauthenticated { message }
            | Self::NotReady { message }
            | Self::InvalidRequest { message }
            | Self::BadRequestData { message }
            | Self::Execution { message, .. }
            | Self::Transport { message } => message.clone(),
            Self::ServiceUnavailable => "service unavailable".to_string(),
            Self::Config { message, .. } => message.clone(),
            Self::Snapshot { message, .. } => message.clone(),
        }
    }
}
