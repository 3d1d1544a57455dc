use std::path::PathBuf;
use std::process::ExitCode;

use crate::protocol::BrokerStatus;

// Emulated "last error" numbers.
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_BAD_EXE_FORMAT: u32 = 193;
pub const WAIT_TIMEOUT: u32 = 258;
pub const ERROR_PARTIAL_COPY: u32 = 299;

/// All errors produced by the guestproc client and runtime.
///
/// Variants are split into two categories:
/// - **Infrastructure errors** (exit code 2): broker unreachable, bad config, I/O failures
/// - **Operational errors** (exit code 1): a process operation that was refused or failed
#[derive(thiserror::Error, Debug)]
pub enum GuestProcError {
    // ── Infrastructure errors (exit code 2) ──────────────────────────

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Broker connection failed: {0}")]
    Broker(#[from] BrokerStatus),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Operational errors (exit code 1) ─────────────────────────────

    #[error("Broker refused process registration: {status}")]
    Registration { status: BrokerStatus },

    #[error("Failed to spawn host process: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("Process exited with code {exit_code} before finishing initialization")]
    InitializationFailed { exit_code: u32 },

    #[error("Process did not finish initialization: {status}")]
    InitializationWait { status: BrokerStatus },

    #[error("Memory access at {addr:#x} failed: {status}")]
    MemoryAccess { addr: u64, status: BrokerStatus },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("Image not found: {name}")]
    ImageNotFound { name: String },

    #[error("Bad executable format: {path}")]
    BadExeFormat { path: PathBuf },
}

impl GuestProcError {
    /// Map each error variant to its process exit code.
    ///
    /// - `2`: infrastructure error (broker, config, I/O)
    /// - `1`: operational failure
    pub fn exit_code(&self) -> ExitCode {
        match self {
            // Infrastructure errors → 2
            Self::Config(_) | Self::Broker(_) | Self::Io(_) | Self::Json(_) => ExitCode::from(2),

            // Operational errors → 1
            Self::Registration { .. }
            | Self::Spawn { .. }
            | Self::InitializationFailed { .. }
            | Self::InitializationWait { .. }
            | Self::MemoryAccess { .. }
            | Self::InvalidParameter(_)
            | Self::ImageNotFound { .. }
            | Self::BadExeFormat { .. } => ExitCode::from(1),
        }
    }

    /// The emulated "last error" number for this failure.
    ///
    /// An initialization failure reports the dead child's exit code.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::InitializationFailed { exit_code } => *exit_code,
            Self::Registration { status }
            | Self::InitializationWait { status }
            | Self::MemoryAccess { status, .. }
            | Self::Broker(status) => status_error_code(*status),
            Self::Spawn { source } | Self::Io(source) => io_error_code(source),
            Self::InvalidParameter(_) | Self::Config(_) | Self::Json(_) => ERROR_INVALID_PARAMETER,
            Self::ImageNotFound { .. } => ERROR_FILE_NOT_FOUND,
            Self::BadExeFormat { .. } => ERROR_BAD_EXE_FORMAT,
        }
    }
}

/// Translate a broker status into an emulated error number.
pub fn status_error_code(status: BrokerStatus) -> u32 {
    match status {
        BrokerStatus::InvalidHandle => ERROR_INVALID_HANDLE,
        BrokerStatus::AccessDenied | BrokerStatus::Disconnected => ERROR_ACCESS_DENIED,
        BrokerStatus::InvalidParameter | BrokerStatus::NotFound | BrokerStatus::Protocol => {
            ERROR_INVALID_PARAMETER
        }
        BrokerStatus::NoMemory => ERROR_NOT_ENOUGH_MEMORY,
        BrokerStatus::Timeout => WAIT_TIMEOUT,
        BrokerStatus::PartialCopy => ERROR_PARTIAL_COPY,
    }
}

fn io_error_code(error: &std::io::Error) -> u32 {
    match error.kind() {
        std::io::ErrorKind::NotFound => ERROR_FILE_NOT_FOUND,
        std::io::ErrorKind::PermissionDenied => ERROR_ACCESS_DENIED,
        std::io::ErrorKind::OutOfMemory => ERROR_NOT_ENOUGH_MEMORY,
        _ => ERROR_INVALID_PARAMETER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialization_failure_reports_child_exit_code() {
        let err = GuestProcError::InitializationFailed { exit_code: 42 };
        assert_eq!(err.error_code(), 42);
        assert_eq!(err.exit_code(), ExitCode::from(1));
    }

    #[test]
    fn spawn_failure_maps_errno() {
        let err = GuestProcError::Spawn {
            source: std::io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert_eq!(err.error_code(), ERROR_FILE_NOT_FOUND);
    }

    #[test]
    fn broker_statuses_translate() {
        assert_eq!(status_error_code(BrokerStatus::Timeout), WAIT_TIMEOUT);
        assert_eq!(status_error_code(BrokerStatus::InvalidHandle), ERROR_INVALID_HANDLE);
        assert_eq!(status_error_code(BrokerStatus::PartialCopy), ERROR_PARTIAL_COPY);
    }
}
