//! Host process spawning.
//!
//! A spawn is a `fork` followed by `execve` in the child. The child reports
//! an exec failure by writing its `errno` into a close-on-exec pipe; the
//! parent reading EOF on that pipe knows the exec succeeded. Everything the
//! child touches is prepared before the fork, so the child only makes raw
//! system calls.

pub mod argv;
pub mod resolve;

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};

use crate::config::RuntimeConfig;
use crate::error::GuestProcError;

pub use argv::{build_argv, build_command_line, build_envp};
pub use resolve::{runtime_candidates, ResolveContext, ResolverStrategy, RESOLUTION_ORDER};

/// Argument the runtime recognizes as "a guest command line follows".
pub const RUNTIME_MARKER: &str = "--";

/// What a spawn executes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpawnTarget {
    /// Relaunch the runtime binary, which then loads the guest image.
    Runtime,
    /// Execute a host binary directly.
    Host(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnRequest {
    pub target: SpawnTarget,
    pub command_line: String,
    /// Emulated environment block, `NAME=value` entries.
    pub environment: Vec<String>,
    /// Entries placed ahead of everything else.
    pub extra_env: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// Starts host processes for the creation orchestrator.
pub trait Spawner: Send + Sync {
    /// Start a host process and return its host pid.
    fn spawn(&self, request: &SpawnRequest) -> Result<u32, GuestProcError>;
}

/// Receives `(host_pid, status)` when a spawned child is reaped.
pub type ExitReporter = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// [`Spawner`] backed by real `fork`/`execve`.
pub struct HostSpawner {
    resolve: ResolveContext,
    prefix_variable: String,
    reporter: Option<ExitReporter>,
}

impl HostSpawner {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_context(ResolveContext::from_config(config), &config.prefix_variable)
    }

    pub fn with_context(resolve: ResolveContext, prefix_variable: &str) -> Self {
        Self {
            resolve,
            prefix_variable: prefix_variable.to_string(),
            reporter: None,
        }
    }

    /// Reap every spawned child on a background thread and hand its exit
    /// status to `reporter`.
    pub fn report_exits(mut self, reporter: ExitReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    fn exec_images(&self, request: &SpawnRequest) -> Result<Vec<ExecImage>, GuestProcError> {
        let args = build_argv(&request.command_line);
        let images = match &request.target {
            SpawnTarget::Runtime => runtime_candidates(&self.resolve)
                .iter()
                .filter_map(|candidate| {
                    let mut argv = vec![
                        candidate.to_string_lossy().into_owned(),
                        RUNTIME_MARKER.to_string(),
                    ];
                    argv.extend(args.iter().cloned());
                    ExecImage::new(candidate, &argv).ok()
                })
                .collect(),
            SpawnTarget::Host(path) => vec![ExecImage::new(path, &args)?],
        };
        if images.is_empty() {
            return Err(GuestProcError::Spawn {
                source: std::io::Error::from_raw_os_error(libc::ENOENT),
            });
        }
        Ok(images)
    }
}

impl Spawner for HostSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32, GuestProcError> {
        let images = self.exec_images(request)?;
        let envp = CStringArray::new(build_envp(
            &request.environment,
            &request.extra_env,
            |name| std::env::var(name).ok(),
            &self.prefix_variable,
        ))?;
        let working_dir = request
            .working_dir
            .as_deref()
            .map(|dir| c_string(dir.as_os_str().as_bytes()))
            .transpose()?;

        log::debug!(
            "[spawn] {:?}: {} candidate(s), cwd {:?}",
            request.target,
            images.len(),
            request.working_dir
        );
        let host_pid = fork_and_exec(&images, &envp, working_dir.as_deref())?;
        log::debug!("[spawn] started host pid {host_pid}");

        if let Some(reporter) = &self.reporter {
            if let Err(e) = spawn_reaper(host_pid, reporter.clone()) {
                log::warn!("[spawn] cannot start reaper for {host_pid}: {e}");
            }
        }
        Ok(host_pid)
    }
}

// ── exec images ──────────────────────────────────────────────────────

/// A NULL-terminated `char *[]` owning its strings.
struct CStringArray {
    _strings: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl CStringArray {
    fn new<I, S>(items: I) -> Result<Self, GuestProcError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let strings = items
            .into_iter()
            .map(|item| c_string(item.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let ptrs = strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Ok(Self {
            _strings: strings,
            ptrs,
        })
    }

    fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

/// One exec attempt: a path and its argument vector.
struct ExecImage {
    path: CString,
    argv: CStringArray,
}

impl ExecImage {
    fn new(path: &Path, argv: &[String]) -> Result<Self, GuestProcError> {
        Ok(Self {
            path: c_string(path.as_os_str().as_bytes())?,
            argv: CStringArray::new(argv)?,
        })
    }
}

fn c_string(bytes: &[u8]) -> Result<CString, GuestProcError> {
    CString::new(bytes).map_err(|e| GuestProcError::Spawn {
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })
}

fn spawn_error(errno: Errno) -> GuestProcError {
    GuestProcError::Spawn {
        source: std::io::Error::from(errno),
    }
}

// ── fork / exec ──────────────────────────────────────────────────────

fn fork_and_exec(
    images: &[ExecImage],
    envp: &CStringArray,
    working_dir: Option<&CStr>,
) -> Result<u32, GuestProcError> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(spawn_error)?;

    // SAFETY: the child only performs async-signal-safe calls on memory
    // prepared before the fork, then execs or exits.
    match unsafe { fork() }.map_err(spawn_error)? {
        ForkResult::Child => {
            drop(read_end);
            // SAFETY: see above.
            unsafe { exec_child(images, envp, working_dir, write_end.as_raw_fd()) }
        }
        ForkResult::Parent { child } => {
            drop(write_end);
            match read_exec_status(read_end) {
                Ok(()) => Ok(child.as_raw() as u32),
                Err(errno) => {
                    let _ = waitpid(child, None);
                    log::debug!("[spawn] exec failed in child {child}: errno {errno}");
                    Err(GuestProcError::Spawn {
                        source: std::io::Error::from_raw_os_error(errno),
                    })
                }
            }
        }
    }
}

/// Runs in the forked child. Tries each image in turn; if none execs,
/// writes the last `errno` to `status_fd` and exits without cleanup.
unsafe fn exec_child(
    images: &[ExecImage],
    envp: &CStringArray,
    working_dir: Option<&CStr>,
    status_fd: RawFd,
) -> ! {
    if let Some(dir) = working_dir {
        // SAFETY: `dir` is a valid NUL-terminated string.
        unsafe { libc::chdir(dir.as_ptr()) };
    }

    let mut errno = libc::ENOENT;
    for image in images {
        // SAFETY: all three arrays are NUL-terminated and outlive the call.
        unsafe { libc::execve(image.path.as_ptr(), image.argv.as_ptr(), envp.as_ptr()) };
        errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::ENOENT);
    }

    let bytes = errno.to_ne_bytes();
    // SAFETY: plain write of a stack buffer to an fd we own, then _exit.
    unsafe {
        libc::write(status_fd, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(127)
    }
}

/// `Ok` on EOF (exec succeeded), `Err(errno)` when the child reported one.
fn read_exec_status(read_end: OwnedFd) -> Result<(), i32> {
    let mut pipe = File::from(read_end);
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match pipe.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
    match filled {
        0 => Ok(()),
        4 => Err(i32::from_ne_bytes(buf)),
        _ => Err(libc::EIO),
    }
}

// ── reaping ──────────────────────────────────────────────────────────

/// Block until child `host_pid` terminates. Returns its exit status, or
/// 128 plus the signal number if it was killed.
pub fn wait_for_exit(host_pid: u32) -> Option<u32> {
    let pid = Pid::from_raw(host_pid as i32);
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Some(code as u32),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Some(128 + signal as u32),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                log::debug!("[spawn] waitpid({host_pid}) failed: {e}");
                return None;
            }
        }
    }
}

fn spawn_reaper(host_pid: u32, reporter: ExitReporter) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("reaper-{host_pid}"))
        .spawn(move || {
            if let Some(status) = wait_for_exit(host_pid) {
                log::debug!("[spawn] host pid {host_pid} exited with {status}");
                reporter(host_pid, status);
            }
        })
}
