//! Process creation.
//!
//! Creating a guest process takes three parties: the broker registers the
//! intent and later hands out identities, the host `fork`/`exec` produces the
//! OS process, and the child reports back once it finished initializing.
//!
//! 1. Register the creation with the broker.
//! 2. Spawn the host process; a failure cancels the registration.
//! 3. Wait (bounded) for the broker to see the child and hand out handles.
//! 4. For guest images, wait for either the child's death or its readiness
//!    signal. Death wins; its exit code becomes the error.
//!
//! Handles acquired along the way are closed on every failure path.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::broker::BrokerSession;
use crate::context::ProcessContext;
use crate::error::GuestProcError;
use crate::protocol::{
    BrokerStatus, CreationFlags, Handle, NewProcessRequest, ProcessId, StartupFlags, StartupParams,
    ThreadId, WaitProcessRequest,
};
use crate::spawn::{SpawnRequest, SpawnTarget, Spawner};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateRequest {
    /// Guest image to run under a relaunched runtime. `None` executes
    /// `filename` as a plain host binary.
    pub image: Option<String>,
    pub filename: PathBuf,
    pub command_line: String,
    /// Environment block for the child; the creator's own when `None`.
    pub environment: Option<Vec<String>>,
    /// Entries that take precedence over every other variable.
    pub extra_env: Vec<String>,
    pub inherit_handles: bool,
    pub process_inherit: bool,
    pub thread_inherit: bool,
    pub flags: CreationFlags,
    /// Standard handles are only taken from here with
    /// [`StartupFlags::USESTDHANDLES`]; otherwise the creator's are passed on.
    pub startup: StartupParams,
    pub current_directory: Option<PathBuf>,
}

/// Result of a successful creation. The caller owns both handles.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ProcessInformation {
    pub process: Handle,
    pub thread: Handle,
    pub pid: ProcessId,
    pub tid: ThreadId,
}

/// Closes every handle it holds when dropped, unless released.
struct HandleGuard<'a> {
    session: &'a BrokerSession,
    handles: Vec<Handle>,
}

impl<'a> HandleGuard<'a> {
    fn new(session: &'a BrokerSession) -> Self {
        Self {
            session,
            handles: Vec::new(),
        }
    }

    fn hold(&mut self, handle: Handle) {
        self.handles.push(handle);
    }

    /// Close one held handle now.
    fn close(&mut self, handle: Handle) {
        self.handles.retain(|h| *h != handle);
        if let Err(status) = self.session.close_handle(handle) {
            log::warn!("[create] close of handle {handle} failed: {status}");
        }
    }

    /// Hand ownership of the remaining handles to the caller.
    fn release(mut self) {
        self.handles.clear();
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(status) = self.session.close_handle(handle) {
                log::warn!("[create] rollback close of handle {handle} failed: {status}");
            }
        }
    }
}

/// Absolute host path of the child's working directory: the requested one
/// if it resolves, otherwise the current one.
pub fn resolve_working_dir(requested: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = requested {
        match std::fs::canonicalize(dir) {
            Ok(path) => return Some(path),
            Err(e) => log::debug!("[create] working dir {} unusable: {e}", dir.display()),
        }
    }
    std::env::current_dir().ok()
}

/// Create a process as described by `request`.
pub fn create_process(
    ctx: &ProcessContext,
    spawner: &dyn Spawner,
    request: &CreateRequest,
) -> Result<ProcessInformation, GuestProcError> {
    let session = ctx.session.as_ref();
    let working_dir = resolve_working_dir(request.current_directory.as_deref());

    let (own_std, own_environment) = {
        let state = ctx.descriptor.lock();
        (state.env.startup.std, state.env.environment.clone())
    };
    let startup_flags = StartupFlags::from_bits_retain(request.startup.flags);
    let std = if startup_flags.contains(StartupFlags::USESTDHANDLES) {
        request.startup.std
    } else {
        own_std
    };

    let creating = ctx.creation_lock();
    session
        .new_process(NewProcessRequest {
            inherit_all: request.inherit_handles,
            create_flags: request.flags.bits(),
            exe_name: request.image.clone(),
            startup: StartupParams {
                std,
                ..request.startup.clone()
            },
        })
        .map_err(|status| GuestProcError::Registration { status })?;

    let target = match request.image {
        Some(_) => SpawnTarget::Runtime,
        None => SpawnTarget::Host(request.filename.clone()),
    };
    let spawn = SpawnRequest {
        target,
        command_line: request.command_line.clone(),
        environment: request.environment.clone().unwrap_or(own_environment),
        extra_env: request.extra_env.clone(),
        working_dir,
    };

    let host_pid = match spawner.spawn(&spawn) {
        Ok(host_pid) => host_pid,
        Err(e) => {
            log::debug!("[create] spawn of {:?} failed: {e}", request.filename);
            cancel_pending(session, ctx.config.creation_timeout_ms);
            return Err(e);
        }
    };

    let created = session
        .wait_process(WaitProcessRequest {
            cancel: false,
            host_pid: Some(host_pid),
            process_inherit: request.process_inherit,
            thread_inherit: request.thread_inherit,
            timeout_ms: ctx.config.creation_timeout_ms,
        })
        .map_err(|status| GuestProcError::InitializationWait { status })?
        .ok_or(GuestProcError::InitializationWait {
            status: BrokerStatus::Protocol,
        })?;
    drop(creating);

    let mut guard = HandleGuard::new(session);
    guard.hold(created.process);
    guard.hold(created.thread);

    if let Some(load_done) = created.load_done {
        guard.hold(load_done);
        let index = session
            .select(&[created.process, load_done], None)
            .map_err(|status| GuestProcError::InitializationWait { status })?;
        if index == 0 {
            let exit_code = session
                .process_info(created.process)
                .map_err(|status| GuestProcError::InitializationWait { status })?
                .exit_code;
            log::debug!(
                "[create] pid {} died during initialization with {exit_code}",
                created.pid
            );
            return Err(GuestProcError::InitializationFailed { exit_code });
        }
        guard.close(load_done);
    }

    guard.release();
    log::debug!(
        "[create] pid {} tid {} running (host pid {host_pid})",
        created.pid,
        created.tid
    );
    Ok(ProcessInformation {
        process: created.process,
        thread: created.thread,
        pid: created.pid,
        tid: created.tid,
    })
}

fn cancel_pending(session: &BrokerSession, timeout_ms: u32) {
    let cancel = WaitProcessRequest {
        cancel: true,
        host_pid: None,
        process_inherit: false,
        thread_inherit: false,
        timeout_ms,
    };
    if let Err(status) = session.wait_process(cancel) {
        log::warn!("[create] cancel of pending creation failed: {status}");
    }
}
