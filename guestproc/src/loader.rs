//! Executable image loading.
//!
//! Parsing a guest binary format is not this crate's business; the startup
//! sequence only needs an [`ImageLoader`] that turns a path into an entry
//! point and a subsystem. [`BuiltinLoader`] is the loader shipped with the
//! runtime: it maps image names onto Rust functions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::context::ProcessContext;
use crate::error::GuestProcError;

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ModuleHandle(pub u64);

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subsystem {
    Console,
    Gui,
}

/// Guest entry point; its return value becomes the exit code.
pub type EntryPoint = Arc<dyn Fn(&ProcessContext) -> u32 + Send + Sync>;

#[derive(Clone)]
pub struct LoadedImage {
    pub path: PathBuf,
    pub module: ModuleHandle,
    pub entry_address: u64,
    pub subsystem: Subsystem,
    pub is_dll: bool,
    /// Subsystem version, major in the high word.
    pub version: u32,
    pub entry: EntryPoint,
}

impl fmt::Debug for LoadedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedImage")
            .field("path", &self.path)
            .field("module", &self.module)
            .field("entry_address", &self.entry_address)
            .field("subsystem", &self.subsystem)
            .field("is_dll", &self.is_dll)
            .finish_non_exhaustive()
    }
}

pub trait ImageLoader: Send + Sync {
    /// Locate the image a launch argument names.
    fn find_image(&self, name: &str) -> Option<PathBuf> {
        search_image(name)
    }

    fn load_image(&self, path: &Path) -> Result<LoadedImage, GuestProcError>;

    /// Bind the image's static dependencies. Called with the descriptor lock held.
    fn attach_dependencies(&self, _image: &LoadedImage) -> Result<(), GuestProcError> {
        Ok(())
    }
}

/// Look `name` up as given, then in every `PATH` directory; each time
/// first with `.exe` appended (when `name` has no extension), then bare.
pub fn search_image(name: &str) -> Option<PathBuf> {
    let given = Path::new(name);
    let mut variants = Vec::new();
    if given.extension().is_none() {
        variants.push(format!("{name}.exe"));
    }
    variants.push(name.to_string());

    for variant in &variants {
        let direct = PathBuf::from(variant);
        if direct.is_file() {
            return Some(direct);
        }
        if given.components().count() > 1 {
            continue;
        }
        if let Some(path) = std::env::var_os("PATH") {
            let found = std::env::split_paths(&path)
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(|dir| dir.join(variant))
                .find(|candidate| candidate.is_file());
            if found.is_some() {
                return found;
            }
        }
    }
    None
}

// ── builtin programs ─────────────────────────────────────────────────

const BUILTIN_BASE: u64 = 0x0040_0000;
const BUILTIN_STRIDE: u64 = 0x0001_0000;
const BUILTIN_ENTRY_RVA: u64 = 0x1000;

/// A program implemented in Rust and registered under an image name.
#[derive(Clone, Copy)]
pub struct BuiltinProgram {
    pub subsystem: Subsystem,
    pub is_dll: bool,
    pub version: u32,
    pub entry: fn(&ProcessContext) -> u32,
}

impl BuiltinProgram {
    pub fn console(entry: fn(&ProcessContext) -> u32) -> Self {
        Self {
            subsystem: Subsystem::Console,
            is_dll: false,
            version: 0x0004_0000,
            entry,
        }
    }

    pub fn gui(entry: fn(&ProcessContext) -> u32) -> Self {
        Self {
            subsystem: Subsystem::Gui,
            ..Self::console(entry)
        }
    }
}

#[derive(Clone, Default)]
pub struct BuiltinLoader {
    programs: BTreeMap<String, BuiltinProgram>,
}

impl BuiltinLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader with the shipped programs registered.
    pub fn with_programs() -> Self {
        let mut loader = Self::new();
        for (name, program) in crate::programs::shipped() {
            loader.register(name, program);
        }
        loader
    }

    pub fn register(&mut self, name: &str, program: BuiltinProgram) {
        self.programs.insert(program_key(Path::new(name)), program);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }
}

/// Lower-cased file stem: `C:\apps\Echo.EXE` and `echo` name the same program.
fn program_key(path: &Path) -> String {
    let text = path.to_string_lossy();
    let base = text.rsplit(['/', '\\']).next().unwrap_or(&text);
    let stem = match base.rsplit_once('.') {
        Some((stem, ext))
            if ext.eq_ignore_ascii_case("exe") || ext.eq_ignore_ascii_case("dll") =>
        {
            stem
        }
        _ => base,
    };
    stem.to_ascii_lowercase()
}

impl ImageLoader for BuiltinLoader {
    fn find_image(&self, name: &str) -> Option<PathBuf> {
        self.programs
            .contains_key(&program_key(Path::new(name)))
            .then(|| PathBuf::from(name))
    }

    fn load_image(&self, path: &Path) -> Result<LoadedImage, GuestProcError> {
        let key = program_key(path);
        let (index, program) = self
            .programs
            .iter()
            .enumerate()
            .find(|(_, (name, _))| **name == key)
            .map(|(index, (_, program))| (index, *program))
            .ok_or_else(|| GuestProcError::ImageNotFound {
                name: path.display().to_string(),
            })?;

        let module = ModuleHandle(BUILTIN_BASE + index as u64 * BUILTIN_STRIDE);
        log::debug!("[loader] {} mapped at {module}", path.display());
        let entry = program.entry;
        Ok(LoadedImage {
            path: path.to_path_buf(),
            module,
            entry_address: module.0 + BUILTIN_ENTRY_RVA,
            subsystem: program.subsystem,
            is_dll: program.is_dll,
            version: program.version,
            entry: Arc::new(move |ctx: &ProcessContext| entry(ctx)),
        })
    }
}
