//! Where to find the runtime binary when relaunching it for a guest image.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::RuntimeConfig;

/// Inputs the resolver strategies read. Captured before fork so the child
/// only walks a precomputed list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveContext {
    pub binary_name: String,
    /// Value of the loader override variable, if set.
    pub override_path: Option<PathBuf>,
    pub install_dir: PathBuf,
    /// Path of the currently running binary.
    pub current_exe: Option<PathBuf>,
    /// Host executable search path.
    pub search_path: Option<OsString>,
}

impl ResolveContext {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            binary_name: config.binary_name.clone(),
            override_path: std::env::var_os(&config.loader_variable)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            install_dir: config.install_dir.clone(),
            current_exe: std::env::current_exe().ok(),
            search_path: std::env::var_os("PATH"),
        }
    }
}

/// One way of locating the runtime binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverStrategy {
    /// Explicit path from the loader override variable.
    OverrideVariable,
    /// The installation directory.
    InstallDirectory,
    /// Next to the currently running binary.
    CurrentBinaryDirectory,
    /// Every entry of the host search path.
    SearchPath,
    /// The current working directory.
    WorkingDirectory,
}

/// Strategies in the order their candidates are tried.
pub const RESOLUTION_ORDER: [ResolverStrategy; 5] = [
    ResolverStrategy::OverrideVariable,
    ResolverStrategy::InstallDirectory,
    ResolverStrategy::CurrentBinaryDirectory,
    ResolverStrategy::SearchPath,
    ResolverStrategy::WorkingDirectory,
];

impl ResolverStrategy {
    pub fn candidates(self, ctx: &ResolveContext) -> Vec<PathBuf> {
        match self {
            Self::OverrideVariable => ctx.override_path.iter().cloned().collect(),
            Self::InstallDirectory => vec![ctx.install_dir.join(&ctx.binary_name)],
            Self::CurrentBinaryDirectory => ctx
                .current_exe
                .as_deref()
                .and_then(Path::parent)
                .map(|dir| dir.join(&ctx.binary_name))
                .into_iter()
                .collect(),
            Self::SearchPath => match &ctx.search_path {
                Some(path) => std::env::split_paths(path)
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map(|dir| dir.join(&ctx.binary_name))
                    .collect(),
                None => Vec::new(),
            },
            Self::WorkingDirectory => vec![Path::new(".").join(&ctx.binary_name)],
        }
    }
}

/// Every exec candidate, in resolution order.
pub fn runtime_candidates(ctx: &ResolveContext) -> Vec<PathBuf> {
    RESOLUTION_ORDER
        .iter()
        .flat_map(|strategy| strategy.candidates(ctx))
        .collect()
}
