//! Process-wide bootstrap state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::broker::{BrokerSession, UnixSocketTransport};
use crate::config::RuntimeConfig;
use crate::descriptor::{DescriptorState, EnvironmentBlock, ProcessDescriptor};
use crate::error::GuestProcError;
use crate::lifecycle::LifecycleNotifier;
use crate::protocol::{CreationFlags, ProcessId, ThreadId};

/// Host-level identity of the running process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostIdentity {
    pub pid: u32,
    pub ppid: u32,
}

impl HostIdentity {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            ppid: nix::unistd::getppid().as_raw() as u32,
        }
    }
}

/// Everything "the current process" means: the broker session, the
/// descriptor and the configuration. Built once per process before any
/// guest code runs and passed by reference from there on.
pub struct ProcessContext {
    pub session: Arc<BrokerSession>,
    pub descriptor: ProcessDescriptor,
    pub config: RuntimeConfig,
    lifecycle: LifecycleNotifier,
    /// The broker keeps one pending creation per session.
    creation: Mutex<()>,
}

impl ProcessContext {
    /// Connect to the broker named in `config` and register this host
    /// process with it.
    pub fn connect(config: RuntimeConfig) -> Result<Self, GuestProcError> {
        let identity = HostIdentity::current();
        let transport = UnixSocketTransport::connect(&config.socket_path)?;
        let session = BrokerSession::connect(Box::new(transport), identity.pid)?;
        allow_broker_access(session.broker_pid());
        Self::bootstrap(Arc::new(session), config, identity)
    }

    /// Register with the broker over an open session and build the descriptor
    /// from what it returns. A creator waiting on this process is matched by
    /// `identity.ppid`.
    pub fn bootstrap(
        session: Arc<BrokerSession>,
        config: RuntimeConfig,
        identity: HostIdentity,
    ) -> Result<Self, GuestProcError> {
        let startup = session.init_process(identity.ppid)?;
        log::debug!(
            "[context] registered as pid {} tid {} (host pid {}, parent {:?})",
            startup.pid,
            startup.tid,
            identity.pid,
            startup.parent
        );

        let mut state = DescriptorState::new(startup.pid, startup.tid);
        state.parent = startup.parent;
        state.create_flags = CreationFlags::from_bits_retain(startup.create_flags);
        state.exe_name = startup.exe_name;
        state.server_start = startup.server_start;
        state.env = EnvironmentBlock {
            command_line: String::new(),
            environment: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
            startup: startup.startup,
        };

        let lifecycle = if config.trace_lifecycle {
            LifecycleNotifier::with_sink(Arc::new(crate::lifecycle::LoggingSink))
        } else {
            LifecycleNotifier::none()
        };

        Ok(Self {
            session,
            descriptor: ProcessDescriptor::new(state),
            config,
            lifecycle,
            creation: Mutex::new(()),
        })
    }

    /// Replace the lifecycle notifier.
    pub fn with_lifecycle(mut self, lifecycle: LifecycleNotifier) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn lifecycle(&self) -> &LifecycleNotifier {
        &self.lifecycle
    }

    /// Held from registering a creation until the broker hands out its
    /// handles.
    pub(crate) fn creation_lock(&self) -> MutexGuard<'_, ()> {
        self.creation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid(&self) -> ProcessId {
        self.descriptor.pid()
    }

    pub fn tid(&self) -> ThreadId {
        self.descriptor.tid()
    }

    pub fn command_line(&self) -> String {
        self.descriptor.lock().env.command_line.clone()
    }
}

/// Let the broker read and write this process's memory even under a
/// restrictive ptrace scope.
#[cfg(target_os = "linux")]
fn allow_broker_access(broker_pid: u32) {
    // SAFETY: PR_SET_PTRACER takes a pid argument and no pointers.
    let rc = unsafe { libc::prctl(libc::PR_SET_PTRACER, broker_pid as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        log::debug!(
            "[context] PR_SET_PTRACER({broker_pid}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn allow_broker_access(_broker_pid: u32) {}
