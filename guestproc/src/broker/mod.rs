//! Session broker client.
//!
//! A process talks to the broker through exactly one [`BrokerSession`],
//! established at bootstrap and shared by every thread. Each call holds the
//! session lock for its full request/response pair, so concurrent callers
//! are serialized.

pub mod socket;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::protocol::{
    BrokerStatus, CreatedProcess, Handle, InitProcessDoneRequest, NewProcessRequest, PriorityClass,
    ProcessId, ProcessInfo, ProcessSummary, Reply, Request, StartupReply, WaitProcessRequest,
    WriteMemoryRequest, DEFAULT_MAX_TRANSFER,
};
use crate::spawn::ExitReporter;

pub use socket::{read_line_bounded, UnixSocketTransport};

/// One request/response exchange with the broker.
pub trait BrokerTransport: Send {
    fn call(&mut self, request: &Request) -> Result<Reply, BrokerStatus>;
}

/// The process-wide connection to the broker.
pub struct BrokerSession {
    transport: Mutex<Box<dyn BrokerTransport>>,
    host_pid: u32,
    max_transfer: usize,
    broker_pid: u32,
    server_start: u64,
}

impl BrokerSession {
    /// Open a session over `transport` on behalf of host process `host_pid`.
    pub fn connect(
        mut transport: Box<dyn BrokerTransport>,
        host_pid: u32,
    ) -> Result<Self, BrokerStatus> {
        match transport.call(&Request::Connect { host_pid })? {
            Reply::Connected {
                max_transfer,
                broker_pid,
                server_start,
            } => {
                log::debug!(
                    "[broker] session open: host pid {host_pid}, broker pid {broker_pid}, \
                     max transfer {max_transfer}"
                );
                Ok(Self {
                    transport: Mutex::new(transport),
                    host_pid,
                    max_transfer: usize::try_from(max_transfer).unwrap_or(DEFAULT_MAX_TRANSFER),
                    broker_pid,
                    server_start,
                })
            }
            other => Err(unexpected("connect", &other)),
        }
    }

    pub fn host_pid(&self) -> u32 {
        self.host_pid
    }

    /// Largest memory payload the broker accepts in one request.
    pub fn max_transfer(&self) -> usize {
        self.max_transfer
    }

    pub fn broker_pid(&self) -> u32 {
        self.broker_pid
    }

    pub fn server_start(&self) -> u64 {
        self.server_start
    }

    /// Perform one round trip.
    pub fn call(&self, request: &Request) -> Result<Reply, BrokerStatus> {
        let mut transport = self
            .transport
            .lock()
            .map_err(|_| BrokerStatus::Disconnected)?;
        log::trace!("[broker] -> {}", request.kind());
        let result = transport.call(request);
        if let Err(status) = &result {
            log::debug!("[broker] {} refused: {status}", request.kind());
        }
        result
    }

    fn call_ack(&self, request: &Request) -> Result<(), BrokerStatus> {
        match self.call(request)? {
            Reply::Ack => Ok(()),
            other => Err(unexpected(request.kind(), &other)),
        }
    }

    // ── Process creation ─────────────────────────────────────────────

    pub fn new_process(&self, request: NewProcessRequest) -> Result<(), BrokerStatus> {
        self.call_ack(&Request::NewProcess(request))
    }

    /// Returns `None` when the request cancelled the pending creation.
    pub fn wait_process(
        &self,
        request: WaitProcessRequest,
    ) -> Result<Option<CreatedProcess>, BrokerStatus> {
        match self.call(&Request::WaitProcess(request))? {
            Reply::Ack => Ok(None),
            Reply::Created(created) => Ok(Some(created)),
            other => Err(unexpected("wait_process", &other)),
        }
    }

    pub fn init_process(&self, host_ppid: u32) -> Result<StartupReply, BrokerStatus> {
        match self.call(&Request::InitProcess {
            host_pid: self.host_pid,
            host_ppid,
        })? {
            Reply::Startup(startup) => Ok(startup),
            other => Err(unexpected("init_process", &other)),
        }
    }

    /// Report initialization finished; returns whether a debugger is attached.
    pub fn init_process_done(&self, request: InitProcessDoneRequest) -> Result<bool, BrokerStatus> {
        match self.call(&Request::InitProcessDone(request))? {
            Reply::Initialized { debugged } => Ok(debugged),
            other => Err(unexpected("init_process_done", &other)),
        }
    }

    // ── Waiting ──────────────────────────────────────────────────────

    /// Block until one of `handles` is signaled; returns its index. When
    /// several are signaled the lowest index wins.
    pub fn select(
        &self,
        handles: &[Handle],
        timeout: Option<Duration>,
    ) -> Result<usize, BrokerStatus> {
        let timeout_ms = timeout.map(|t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX));
        match self.call(&Request::Select {
            handles: handles.to_vec(),
            timeout_ms,
        })? {
            Reply::Signaled { index } => Ok(index),
            other => Err(unexpected("select", &other)),
        }
    }

    // ── Process information ──────────────────────────────────────────

    pub fn open_process(
        &self,
        pid: ProcessId,
        access: u32,
        inherit: bool,
    ) -> Result<Handle, BrokerStatus> {
        match self.call(&Request::OpenProcess { pid, access, inherit })? {
            Reply::Handle { handle } => Ok(handle),
            other => Err(unexpected("open_process", &other)),
        }
    }

    pub fn process_info(&self, handle: Handle) -> Result<ProcessInfo, BrokerStatus> {
        match self.call(&Request::GetProcessInfo { handle })? {
            Reply::ProcessInfo(info) => Ok(info),
            other => Err(unexpected("get_process_info", &other)),
        }
    }

    pub fn set_process_info(
        &self,
        handle: Handle,
        priority: Option<PriorityClass>,
        affinity: Option<u32>,
    ) -> Result<(), BrokerStatus> {
        self.call_ack(&Request::SetProcessInfo {
            handle,
            priority,
            affinity,
        })
    }

    pub fn terminate_process(&self, handle: Handle, exit_code: u32) -> Result<(), BrokerStatus> {
        self.call_ack(&Request::TerminateProcess { handle, exit_code })
    }

    /// Report the host exit status of a reaped child.
    pub fn host_process_exited(&self, host_pid: u32, status: u32) -> Result<(), BrokerStatus> {
        self.call_ack(&Request::HostProcessExited { host_pid, status })
    }

    pub fn close_handle(&self, handle: Handle) -> Result<(), BrokerStatus> {
        self.call_ack(&Request::CloseHandle { handle })
    }

    pub fn list_processes(&self) -> Result<Vec<ProcessSummary>, BrokerStatus> {
        match self.call(&Request::ListProcesses)? {
            Reply::Processes { processes } => Ok(processes),
            other => Err(unexpected("list_processes", &other)),
        }
    }

    // ── Raw memory requests ──────────────────────────────────────────

    /// Read `words` whole words starting at the aligned address `addr`.
    pub fn read_words(
        &self,
        handle: Handle,
        addr: u64,
        words: u32,
    ) -> Result<Vec<u8>, BrokerStatus> {
        match self.call(&Request::ReadMemory { handle, addr, words })? {
            Reply::Memory { data } => Ok(data),
            other => Err(unexpected("read_memory", &other)),
        }
    }

    pub fn write_words(&self, request: WriteMemoryRequest) -> Result<(), BrokerStatus> {
        self.call_ack(&Request::WriteMemory(request))
    }
}

/// Exit reporter that opens its own connection per report, so it never
/// waits behind a caller blocked inside the main session.
pub fn socket_exit_reporter(socket_path: PathBuf) -> ExitReporter {
    Arc::new(move |host_pid, status| {
        let session = UnixSocketTransport::connect(&socket_path)
            .map_err(|e| log::warn!("[broker] exit report for {host_pid}: {e}"))
            .and_then(|transport| {
                BrokerSession::connect(Box::new(transport), std::process::id())
                    .map_err(|status| log::warn!("[broker] exit report for {host_pid}: {status}"))
            });
        if let Ok(session) = session {
            if let Err(e) = session.host_process_exited(host_pid, status) {
                log::warn!("[broker] exit report for {host_pid} refused: {e}");
            }
        }
    })
}

fn unexpected(kind: &str, reply: &Reply) -> BrokerStatus {
    log::warn!("[broker] unexpected reply to {kind}: {reply:?}");
    BrokerStatus::Protocol
}
