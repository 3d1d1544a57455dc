//! Runtime configuration.
//!
//! Defaults are compiled in; a TOML file named by `GUESTPROC_CONFIG`
//! overrides them field by field, and `GUESTPROC_SOCKET` overrides the
//! broker socket path last.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GuestProcError;

/// Names the TOML configuration file.
pub const CONFIG_ENV: &str = "GUESTPROC_CONFIG";
/// Overrides the broker socket path.
pub const SOCKET_ENV: &str = "GUESTPROC_SOCKET";
/// Log filter for both binaries.
pub const LOG_ENV: &str = "GUESTPROC_LOG";

/// Default bound on the creation wait, in milliseconds.
pub const DEFAULT_CREATION_TIMEOUT_MS: u32 = 2000;

const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Unix socket the broker listens on.
    pub socket_path: PathBuf,
    /// File name of the runtime binary, used when relaunching it.
    pub binary_name: String,
    /// Environment variable holding an explicit runtime binary path.
    pub loader_variable: String,
    /// Environment variable naming the installation prefix; always carried
    /// over from the host environment into children.
    pub prefix_variable: String,
    /// Directory the runtime binary is installed into.
    pub install_dir: PathBuf,
    pub creation_timeout_ms: u32,
    /// Stack size of the thread guest code runs on.
    pub main_stack_size: usize,
    /// Raise a breakpoint trap before the entry point when a debugger is attached.
    pub trap_on_debugger: bool,
    /// Log every lifecycle notification.
    pub trace_lifecycle: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            binary_name: "guestproc".to_string(),
            loader_variable: "GUESTPROC_LOADER".to_string(),
            prefix_variable: "GUESTPROC_PREFIX".to_string(),
            install_dir: PathBuf::from(option_env!("GUESTPROC_BINDIR").unwrap_or("/usr/local/bin")),
            creation_timeout_ms: DEFAULT_CREATION_TIMEOUT_MS,
            main_stack_size: DEFAULT_STACK_SIZE,
            trap_on_debugger: false,
            trace_lifecycle: false,
        }
    }
}

impl RuntimeConfig {
    /// Load the configuration from the environment.
    pub fn load() -> Result<Self, GuestProcError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(socket) = std::env::var_os(SOCKET_ENV) {
            config.socket_path = PathBuf::from(socket);
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, GuestProcError> {
        let text = fs::read_to_string(path).map_err(|e| {
            GuestProcError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, GuestProcError> {
        toml::from_str(text).map_err(|e| GuestProcError::Config(e.to_string()))
    }
}

/// `$XDG_RUNTIME_DIR/guestproc/broker.sock`, or a per-user directory under
/// the temp dir.
pub fn default_socket_path() -> PathBuf {
    socket_path_in(std::env::var_os("XDG_RUNTIME_DIR"))
}

fn socket_path_in(runtime_dir: Option<OsString>) -> PathBuf {
    match runtime_dir {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("guestproc").join("broker.sock"),
        _ => std::env::temp_dir()
            .join(format!("guestproc-{}", nix::unistd::getuid()))
            .join("broker.sock"),
    }
}
