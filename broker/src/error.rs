use std::path::PathBuf;
use std::process::ExitCode;

/// Errors that stop the broker server.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Configuration mistakes exit 1, everything else 2.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            BrokerError::Config(_) => ExitCode::from(1),
            BrokerError::Bind { .. } | BrokerError::Io(_) => ExitCode::from(2),
        }
    }
}
