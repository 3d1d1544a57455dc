//! Broker wire protocol.
//!
//! Every exchange is one JSON line in each direction. A request line is
//! `{"request": "<kind>", "args": {...}}`; the broker answers with
//! `{"return": {"reply": "<kind>", "args": {...}}}` on success or
//! `{"error": {"status": "<status>", "desc": "..."}}` on failure.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exit code reported for a process that has not terminated yet.
pub const STILL_ACTIVE: u32 = 259;

/// Granularity of remote memory transfers, in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<u32>();

/// Default upper bound on the payload of one memory request.
pub const DEFAULT_MAX_TRANSFER: usize = 1024;

/// Room a request line needs besides its memory payload.
const LINE_OVERHEAD: usize = 1024;

/// Longest request line a broker accepts: a full-size write, each byte
/// taking up to four characters as a JSON number, plus framing.
pub fn max_request_line(max_transfer: usize) -> usize {
    max_transfer.saturating_mul(4).saturating_add(LINE_OVERHEAD)
}

pub type ProcessId = u32;
pub type ThreadId = u32;

/// Reference to a broker object, valid only within the session that owns it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl Handle {
    /// Pseudo-handle naming the calling process.
    pub const CURRENT_PROCESS: Handle = Handle(u32::MAX);

    pub fn is_current_process(self) -> bool {
        self == Self::CURRENT_PROCESS
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags::bitflags! {
    /// Flags accepted by process creation.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CreationFlags: u32 {
        const DEBUG_PROCESS = 0x0000_0001;
        const DEBUG_ONLY_THIS_PROCESS = 0x0000_0002;
        const CREATE_SUSPENDED = 0x0000_0004;
        const DETACHED_PROCESS = 0x0000_0008;
        const CREATE_NEW_CONSOLE = 0x0000_0010;
        const CREATE_NEW_PROCESS_GROUP = 0x0000_0200;
        const CREATE_UNICODE_ENVIRONMENT = 0x0000_0400;
    }
}

impl CreationFlags {
    pub fn debugged(self) -> bool {
        self.intersects(Self::DEBUG_PROCESS | Self::DEBUG_ONLY_THIS_PROCESS)
    }
}

bitflags::bitflags! {
    /// Startup-info flags describing which startup fields are meaningful.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StartupFlags: u32 {
        const USESHOWWINDOW = 0x0000_0001;
        const USESIZE = 0x0000_0002;
        const USEPOSITION = 0x0000_0004;
        const USECOUNTCHARS = 0x0000_0008;
        const USEFILLATTRIBUTE = 0x0000_0010;
        const RUNFULLSCREEN = 0x0000_0020;
        const FORCEONFEEDBACK = 0x0000_0040;
        const FORCEOFFFEEDBACK = 0x0000_0080;
        const USESTDHANDLES = 0x0000_0100;
    }
}

bitflags::bitflags! {
    /// Access rights carried by a process handle.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ProcessAccess: u32 {
        const TERMINATE = 0x0001;
        const VM_OPERATION = 0x0008;
        const VM_READ = 0x0010;
        const VM_WRITE = 0x0020;
        const SET_INFORMATION = 0x0200;
        const QUERY_INFORMATION = 0x0400;
        const SYNCHRONIZE = 0x0010_0000;
        const ALL_ACCESS = 0x001F_0FFF;
    }
}

/// Scheduling priority class. Stored and reported, never enforced.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
    Realtime,
}

impl PriorityClass {
    /// Numeric class value as exposed by the emulated API.
    pub fn as_raw(self) -> u32 {
        match self {
            Self::Idle => 0x0040,
            Self::BelowNormal => 0x4000,
            Self::Normal => 0x0020,
            Self::AboveNormal => 0x8000,
            Self::High => 0x0080,
            Self::Realtime => 0x0100,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x0040 => Some(Self::Idle),
            0x4000 => Some(Self::BelowNormal),
            0x0020 => Some(Self::Normal),
            0x8000 => Some(Self::AboveNormal),
            0x0080 => Some(Self::High),
            0x0100 => Some(Self::Realtime),
            _ => None,
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::BelowNormal => write!(f, "below_normal"),
            Self::Normal => write!(f, "normal"),
            Self::AboveNormal => write!(f, "above_normal"),
            Self::High => write!(f, "high"),
            Self::Realtime => write!(f, "realtime"),
        }
    }
}

/// Lifecycle state of a process as the broker sees it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Host process exists, initialization not finished.
    Starting,
    Running,
    Exited,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Status codes the broker returns for a refused request.
#[derive(thiserror::Error, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrokerStatus {
    #[error("invalid handle")]
    InvalidHandle,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("not enough memory")]
    NoMemory,
    #[error("wait timed out")]
    Timeout,
    #[error("process not found")]
    NotFound,
    #[error("only part of the memory range was accessible")]
    PartialCopy,
    #[error("broker connection lost")]
    Disconnected,
    #[error("malformed broker message")]
    Protocol,
}

// ── Request payloads ─────────────────────────────────────────────────

/// Standard stream handles handed to a new process.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StdHandles {
    pub input: Option<Handle>,
    pub output: Option<Handle>,
    pub error: Option<Handle>,
}

/// Startup parameters passed from creator to child through the broker.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StartupParams {
    pub flags: u32,
    pub show_window: u16,
    pub x: u32,
    pub y: u32,
    pub x_size: u32,
    pub y_size: u32,
    pub std: StdHandles,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewProcessRequest {
    pub inherit_all: bool,
    pub create_flags: u32,
    /// Guest image to run, `None` for a plain host binary.
    pub exe_name: Option<String>,
    pub startup: StartupParams,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WaitProcessRequest {
    /// Discard the pending creation instead of waiting for it.
    pub cancel: bool,
    pub host_pid: Option<u32>,
    pub process_inherit: bool,
    pub thread_inherit: bool,
    pub timeout_ms: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InitProcessDoneRequest {
    pub module: u64,
    pub entry: u64,
    pub name: String,
    pub gui: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WriteMemoryRequest {
    pub handle: Handle,
    /// Word-aligned target address.
    pub addr: u64,
    /// Byte mask applied to the first word.
    pub first_mask: u32,
    /// Byte mask applied to the last word.
    pub last_mask: u32,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "request", content = "args", rename_all = "snake_case")]
pub enum Request {
    Connect {
        host_pid: u32,
    },
    NewProcess(NewProcessRequest),
    WaitProcess(WaitProcessRequest),
    InitProcess {
        host_pid: u32,
        host_ppid: u32,
    },
    InitProcessDone(InitProcessDoneRequest),
    Select {
        handles: Vec<Handle>,
        timeout_ms: Option<u32>,
    },
    OpenProcess {
        pid: ProcessId,
        access: u32,
        inherit: bool,
    },
    GetProcessInfo {
        handle: Handle,
    },
    SetProcessInfo {
        handle: Handle,
        priority: Option<PriorityClass>,
        affinity: Option<u32>,
    },
    TerminateProcess {
        handle: Handle,
        exit_code: u32,
    },
    HostProcessExited {
        host_pid: u32,
        status: u32,
    },
    ReadMemory {
        handle: Handle,
        /// Word-aligned source address.
        addr: u64,
        words: u32,
    },
    WriteMemory(WriteMemoryRequest),
    CloseHandle {
        handle: Handle,
    },
    ListProcesses,
}

impl Request {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::NewProcess(_) => "new_process",
            Self::WaitProcess(_) => "wait_process",
            Self::InitProcess { .. } => "init_process",
            Self::InitProcessDone(_) => "init_process_done",
            Self::Select { .. } => "select",
            Self::OpenProcess { .. } => "open_process",
            Self::GetProcessInfo { .. } => "get_process_info",
            Self::SetProcessInfo { .. } => "set_process_info",
            Self::TerminateProcess { .. } => "terminate_process",
            Self::HostProcessExited { .. } => "host_process_exited",
            Self::ReadMemory { .. } => "read_memory",
            Self::WriteMemory(_) => "write_memory",
            Self::CloseHandle { .. } => "close_handle",
            Self::ListProcesses => "list_processes",
        }
    }
}

// ── Reply payloads ───────────────────────────────────────────────────

/// Identities and handles of a process whose creation completed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreatedProcess {
    pub pid: ProcessId,
    pub tid: ThreadId,
    pub process: Handle,
    pub thread: Handle,
    /// Signaled once the child finished its own initialization.
    /// Absent for plain host binaries.
    pub load_done: Option<Handle>,
}

/// What a freshly started process learns about itself.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StartupReply {
    pub pid: ProcessId,
    pub tid: ThreadId,
    pub parent: Option<ProcessId>,
    pub create_flags: u32,
    pub exe_name: Option<String>,
    pub startup: StartupParams,
    /// Broker start time, milliseconds since the Unix epoch.
    pub server_start: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub ppid: Option<ProcessId>,
    pub exit_code: u32,
    pub priority: PriorityClass,
    pub process_affinity: u32,
    pub system_affinity: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProcessSummary {
    pub pid: ProcessId,
    pub ppid: Option<ProcessId>,
    pub host_pid: Option<u32>,
    pub name: Option<String>,
    pub state: ProcessState,
    pub exit_code: u32,
    pub priority: PriorityClass,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "reply", content = "args", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Connected {
        max_transfer: u32,
        broker_pid: u32,
        server_start: u64,
    },
    Created(CreatedProcess),
    Startup(StartupReply),
    Initialized {
        debugged: bool,
    },
    Signaled {
        index: usize,
    },
    Handle {
        handle: Handle,
    },
    ProcessInfo(ProcessInfo),
    Memory {
        data: Vec<u8>,
    },
    Processes {
        processes: Vec<ProcessSummary>,
    },
}

/// Failure half of a response line.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorDetail {
    pub status: BrokerStatus,
    pub desc: String,
}

/// One response line.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Return(Reply),
    Error(ErrorDetail),
}

impl Response {
    pub fn from_result(result: Result<Reply, BrokerStatus>) -> Self {
        match result {
            Ok(reply) => Self::Return(reply),
            Err(status) => Self::Error(ErrorDetail {
                status,
                desc: status.to_string(),
            }),
        }
    }

    pub fn into_result(self) -> Result<Reply, BrokerStatus> {
        match self {
            Self::Return(reply) => Ok(reply),
            Self::Error(detail) => Err(detail.status),
        }
    }
}
