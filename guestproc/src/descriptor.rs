//! The in-process record of the current process.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::loader::ModuleHandle;
use crate::protocol::{
    CreationFlags, PriorityClass, ProcessId, StartupParams, ThreadId, STILL_ACTIVE,
};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ProcessFlags: u32 {
        const DEBUGGED = 0x0001;
        /// Legacy 16-bit process.
        const WIN16 = 0x0008;
        /// Main image uses the console subsystem.
        const CONSOLE = 0x0020;
    }
}

/// Default shutdown level assigned to every process.
pub const DEFAULT_SHUTDOWN_LEVEL: u32 = 0x280;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownParameters {
    pub level: u32,
    pub flags: u32,
}

impl Default for ShutdownParameters {
    fn default() -> Self {
        Self {
            level: DEFAULT_SHUTDOWN_LEVEL,
            flags: 0,
        }
    }
}

/// Command line, environment and startup data the process was given.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvironmentBlock {
    pub command_line: String,
    /// `NAME=value` entries.
    pub environment: Vec<String>,
    /// Display flags and standard stream handles.
    pub startup: StartupParams,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorState {
    pub pid: ProcessId,
    /// Main thread.
    pub tid: ThreadId,
    pub parent: Option<ProcessId>,
    pub priority: PriorityClass,
    pub flags: ProcessFlags,
    pub create_flags: CreationFlags,
    pub threads: u32,
    pub running_threads: u32,
    pub env: EnvironmentBlock,
    /// Image name the broker handed over, if the creator named one.
    pub exe_name: Option<String>,
    pub module: Option<ModuleHandle>,
    /// Subsystem version of the main image, major in the high word.
    pub version: u32,
    pub error_mode: u32,
    pub user_data: u32,
    pub shutdown: ShutdownParameters,
    /// Broker start time, milliseconds since the Unix epoch.
    pub server_start: u64,
    exit_code: Option<u32>,
}

impl DescriptorState {
    pub fn new(pid: ProcessId, tid: ThreadId) -> Self {
        Self {
            pid,
            tid,
            parent: None,
            priority: PriorityClass::Normal,
            flags: ProcessFlags::empty(),
            create_flags: CreationFlags::empty(),
            threads: 1,
            running_threads: 1,
            env: EnvironmentBlock::default(),
            exe_name: None,
            module: None,
            version: 0,
            error_mode: 0,
            user_data: 0,
            shutdown: ShutdownParameters::default(),
            server_start: 0,
            exit_code: None,
        }
    }

    /// [`STILL_ACTIVE`] until an exit code is recorded.
    pub fn exit_code(&self) -> u32 {
        self.exit_code.unwrap_or(STILL_ACTIVE)
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Record the exit code. Only the first call has an effect; returns
    /// whether this call was it.
    pub fn set_exit_code(&mut self, code: u32) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        self.exit_code = Some(code);
        true
    }
}

/// Shared handle to the descriptor; every access goes through its lock.
#[derive(Debug)]
pub struct ProcessDescriptor {
    state: Mutex<DescriptorState>,
}

impl ProcessDescriptor {
    pub fn new(state: DescriptorState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Enter the descriptor's critical section.
    pub fn lock(&self) -> MutexGuard<'_, DescriptorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid(&self) -> ProcessId {
        self.lock().pid
    }

    pub fn tid(&self) -> ThreadId {
        self.lock().tid
    }

    pub fn exit_code(&self) -> u32 {
        self.lock().exit_code()
    }

    pub fn set_exit_code(&self, code: u32) -> bool {
        self.lock().set_exit_code(code)
    }
}
