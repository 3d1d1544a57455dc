//! Broker command line.

use std::path::PathBuf;

use clap::Parser;

use guestproc::config::{default_socket_path, SOCKET_ENV};
use guestproc::protocol::{DEFAULT_MAX_TRANSFER, WORD_SIZE};

use crate::error::BrokerError;

/// Serve the guestproc broker protocol on a Unix socket.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "guestproc-broker", version, about)]
pub struct BrokerConfig {
    /// Socket path to listen on.
    #[arg(long, env = SOCKET_ENV, default_value_os_t = default_socket_path())]
    pub socket: PathBuf,

    /// Largest memory payload accepted in one request, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_TRANSFER)]
    pub max_transfer: usize,

    /// Maximum number of live processes.
    #[arg(long, default_value_t = 1024)]
    pub max_processes: usize,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.max_transfer < WORD_SIZE || self.max_transfer % WORD_SIZE != 0 {
            return Err(BrokerError::Config(format!(
                "--max-transfer must be a positive multiple of {WORD_SIZE}, got {}",
                self.max_transfer
            )));
        }
        Ok(())
    }
}
