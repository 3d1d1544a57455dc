//! Process information and control for the current process and for
//! processes it holds handles to.

use std::io::Write;

use crate::context::ProcessContext;
use crate::descriptor::{ProcessFlags, ShutdownParameters};
use crate::error::GuestProcError;
use crate::lifecycle::UserSignal;
use crate::protocol::{Handle, PriorityClass, ProcessAccess, ProcessId};

const CW_USEDEFAULT: u32 = 0x8000_0000;
const CW_USEDEFAULT16: u32 = 0x8000;

/// Legacy per-process values addressed by offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessDword {
    AppCompatFlags,
    LoadDoneEvent,
    Instance16,
    WindowsVersion,
    Thread,
    Process,
    StdOutput,
    StdInput,
    ShowWindow,
    Size,
    Position,
    StartupFlags,
    Parent,
    Flags,
    UserData,
}

impl ProcessDword {
    pub fn from_offset(offset: i32) -> Option<Self> {
        Some(match offset {
            -56 => Self::AppCompatFlags,
            -52 => Self::LoadDoneEvent,
            -48 => Self::Instance16,
            -44 => Self::WindowsVersion,
            -40 => Self::Thread,
            -36 => Self::Process,
            -32 => Self::StdOutput,
            -28 => Self::StdInput,
            -24 => Self::ShowWindow,
            -20 => Self::Size,
            -16 => Self::Position,
            -12 => Self::StartupFlags,
            -8 => Self::Parent,
            -4 => Self::Flags,
            0 => Self::UserData,
            _ => return None,
        })
    }
}

/// Pack two 16-bit coordinates, folding the 32-bit default marker into
/// its 16-bit form.
fn pack_coordinates(x: u32, y: u32) -> u32 {
    let fold = |v: u32| if v == CW_USEDEFAULT { CW_USEDEFAULT16 } else { v & 0xFFFF };
    (fold(y) << 16) | fold(x)
}

impl ProcessContext {
    /// `pid` 0 means the current process.
    fn is_current(&self, pid: ProcessId) -> bool {
        pid == 0 || pid == self.pid()
    }

    // ── handles ──────────────────────────────────────────────────────

    pub fn open_process(
        &self,
        pid: ProcessId,
        access: ProcessAccess,
        inherit: bool,
    ) -> Result<Handle, GuestProcError> {
        Ok(self.session.open_process(pid, access.bits(), inherit)?)
    }

    pub fn close_handle(&self, handle: Handle) -> Result<(), GuestProcError> {
        Ok(self.session.close_handle(handle)?)
    }

    /// Process id behind a process handle.
    pub fn process_id_of(&self, handle: Handle) -> Result<ProcessId, GuestProcError> {
        Ok(self.session.process_info(handle)?.pid)
    }

    // ── priority and affinity ────────────────────────────────────────

    pub fn priority_class(&self, process: Handle) -> Result<PriorityClass, GuestProcError> {
        Ok(self.session.process_info(process)?.priority)
    }

    pub fn set_priority_class(
        &self,
        process: Handle,
        class: PriorityClass,
    ) -> Result<(), GuestProcError> {
        self.session.set_process_info(process, Some(class), None)?;
        if process.is_current_process() {
            self.descriptor.lock().priority = class;
        }
        Ok(())
    }

    /// `(process mask, system mask)`.
    pub fn affinity_mask(&self, process: Handle) -> Result<(u32, u32), GuestProcError> {
        let info = self.session.process_info(process)?;
        Ok((info.process_affinity, info.system_affinity))
    }

    pub fn set_affinity_mask(&self, process: Handle, mask: u32) -> Result<(), GuestProcError> {
        Ok(self.session.set_process_info(process, None, Some(mask))?)
    }

    // ── termination ──────────────────────────────────────────────────

    /// [`crate::protocol::STILL_ACTIVE`] while the process runs.
    pub fn exit_code(&self, process: Handle) -> Result<u32, GuestProcError> {
        Ok(self.session.process_info(process)?.exit_code)
    }

    pub fn terminate_process(&self, process: Handle, exit_code: u32) -> Result<(), GuestProcError> {
        Ok(self.session.terminate_process(process, exit_code)?)
    }

    /// Fire the exit notification and report `code` to the broker. Only the
    /// first report counts.
    pub fn report_exit(&self, code: u32) {
        let module = self.descriptor.lock().module.unwrap_or_default();
        self.lifecycle()
            .signal(&self.descriptor, UserSignal::ProcessExit, module);
        if !self.descriptor.set_exit_code(code) {
            return;
        }
        if let Err(status) = self.session.terminate_process(Handle::CURRENT_PROCESS, code) {
            log::warn!("[process] exit code {code} not reported: {status}");
        }
    }

    /// Terminate the current process with `code`.
    pub fn exit_process(&self, code: u32) -> ! {
        self.report_exit(code);
        let _ = std::io::stdout().flush();
        std::process::exit(code as i32)
    }

    // ── legacy values ────────────────────────────────────────────────

    pub fn process_dword(&self, pid: ProcessId, offset: i32) -> Result<u32, GuestProcError> {
        if !self.is_current(pid) {
            return Err(GuestProcError::InvalidParameter("process dword of another process"));
        }
        let field = ProcessDword::from_offset(offset)
            .ok_or(GuestProcError::InvalidParameter("unknown process dword offset"))?;
        let state = self.descriptor.lock();
        let startup = &state.env.startup;
        Ok(match field {
            ProcessDword::AppCompatFlags
            | ProcessDword::LoadDoneEvent
            | ProcessDword::Instance16 => 0,
            ProcessDword::WindowsVersion => state.version,
            ProcessDword::Thread => state.tid,
            ProcessDword::Process => state.pid,
            ProcessDword::StdOutput => startup.std.output.map_or(0, |h| h.0),
            ProcessDword::StdInput => startup.std.input.map_or(0, |h| h.0),
            ProcessDword::ShowWindow => u32::from(startup.show_window),
            ProcessDword::Size => pack_coordinates(startup.x_size, startup.y_size),
            ProcessDword::Position => pack_coordinates(startup.x, startup.y),
            ProcessDword::StartupFlags => startup.flags,
            ProcessDword::Parent => state.parent.unwrap_or(0),
            ProcessDword::Flags => state.flags.bits(),
            ProcessDword::UserData => state.user_data,
        })
    }

    /// Only the user data value is writable.
    pub fn set_process_dword(
        &self,
        pid: ProcessId,
        offset: i32,
        value: u32,
    ) -> Result<(), GuestProcError> {
        if !self.is_current(pid) {
            return Err(GuestProcError::InvalidParameter("process dword of another process"));
        }
        match ProcessDword::from_offset(offset) {
            Some(ProcessDword::UserData) => {
                self.descriptor.lock().user_data = value;
                Ok(())
            }
            _ => Err(GuestProcError::InvalidParameter("read-only process dword")),
        }
    }

    pub fn process_flags(&self, pid: ProcessId) -> Result<ProcessFlags, GuestProcError> {
        if !self.is_current(pid) {
            return Err(GuestProcError::InvalidParameter("flags of another process"));
        }
        Ok(self.descriptor.lock().flags)
    }

    /// Subsystem version of the main image.
    pub fn process_version(&self, pid: ProcessId) -> Result<u32, GuestProcError> {
        if !self.is_current(pid) {
            return Err(GuestProcError::InvalidParameter("version of another process"));
        }
        Ok(self.descriptor.lock().version)
    }

    /// Returns the previous mode.
    pub fn set_error_mode(&self, mode: u32) -> u32 {
        std::mem::replace(&mut self.descriptor.lock().error_mode, mode)
    }

    pub fn shutdown_parameters(&self) -> ShutdownParameters {
        self.descriptor.lock().shutdown
    }

    pub fn set_shutdown_parameters(&self, level: u32, flags: u32) {
        self.descriptor.lock().shutdown = ShutdownParameters { level, flags };
    }
}
