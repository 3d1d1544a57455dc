//! The broker's authoritative process registry.
//!
//! All state lives behind one mutex. Requests that block (`wait_process`,
//! `select`) wait on a single condition variable that is notified on every
//! change that can signal an object: a child registering, a process
//! finishing initialization, a process exiting.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use guestproc::memory::{merge_masked, ALL_BYTES};
use guestproc::protocol::{
    BrokerStatus, CreatedProcess, CreationFlags, Handle, InitProcessDoneRequest,
    NewProcessRequest, PriorityClass, ProcessAccess, ProcessId, ProcessInfo, ProcessState,
    ProcessSummary, Reply, Request, StartupParams, StartupReply, ThreadId, WaitProcessRequest,
    WriteMemoryRequest, STILL_ACTIVE, WORD_SIZE,
};

use crate::config::BrokerConfig;
use crate::handles::{HandleEntry, HandleTable, Object};
use crate::host::HostBackend;

pub type SessionId = u64;

/// Exit code recorded for a process whose session vanished without a report.
pub const DISCONNECT_EXIT_CODE: u32 = 1;

/// Host exits reported before anyone asked about the host pid.
const ORPHAN_EXIT_LIMIT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_transfer: usize,
    pub max_processes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_transfer: guestproc::protocol::DEFAULT_MAX_TRANSFER,
            max_processes: 1024,
        }
    }
}

impl From<&BrokerConfig> for Limits {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            max_transfer: config.max_transfer,
            max_processes: config.max_processes,
        }
    }
}

#[derive(Debug)]
struct ProcessRecord {
    pid: ProcessId,
    tid: ThreadId,
    ppid: Option<ProcessId>,
    host_pid: Option<u32>,
    name: Option<String>,
    exe_name: Option<String>,
    create_flags: u32,
    startup: StartupParams,
    priority: PriorityClass,
    affinity: u32,
    exit_code: Option<u32>,
    /// `exit_code` came from a disconnect, not from the process itself.
    exit_provisional: bool,
    loaded: bool,
    created_at: DateTime<Utc>,
}

impl ProcessRecord {
    fn state(&self) -> ProcessState {
        if self.exit_code.is_some() {
            ProcessState::Exited
        } else if self.loaded {
            ProcessState::Running
        } else {
            ProcessState::Starting
        }
    }

    /// Returns false if an exit code was already recorded.
    fn set_exit_code(&mut self, code: u32) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        self.exit_code = Some(code);
        true
    }

    /// The host's own status for the process. Replaces a code recorded at
    /// disconnect, never one the process reported.
    fn set_host_status(&mut self, status: u32) -> bool {
        if self.exit_code.is_some() && !self.exit_provisional {
            return false;
        }
        self.exit_code = Some(status);
        self.exit_provisional = false;
        true
    }

    fn summary(&self) -> ProcessSummary {
        ProcessSummary {
            pid: self.pid,
            ppid: self.ppid,
            host_pid: self.host_pid,
            name: self.name.clone().or_else(|| self.exe_name.clone()),
            state: self.state(),
            exit_code: self.exit_code.unwrap_or(STILL_ACTIVE),
            priority: self.priority,
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// A creation registered by `new_process` and not yet handed out.
#[derive(Debug)]
struct PendingCreation {
    parent: Option<ProcessId>,
    create_flags: u32,
    exe_name: Option<String>,
    startup: StartupParams,
    host_pid: Option<u32>,
    /// Set once the child registered itself.
    child: Option<ProcessId>,
    /// Host exit status seen before the child registered.
    early_exit: Option<u32>,
}

impl PendingCreation {
    /// Guest children register themselves; plain host binaries never do.
    fn expects_child(&self) -> bool {
        self.exe_name.is_some()
    }

    fn settled(&self) -> bool {
        !self.expects_child() || self.child.is_some() || self.early_exit.is_some()
    }
}

#[derive(Debug, Default)]
struct Session {
    host_pid: Option<u32>,
    process: Option<ProcessId>,
    handles: HandleTable,
    pending: Option<PendingCreation>,
}

#[derive(Debug, Default)]
struct RegistryState {
    last_id: u32,
    last_session: SessionId,
    sessions: HashMap<SessionId, Session>,
    processes: BTreeMap<ProcessId, ProcessRecord>,
    orphan_exits: VecDeque<(u32, u32)>,
}

impl RegistryState {
    /// Next process or thread id. Ids are multiples of 4 and never reused.
    fn next_id(&mut self) -> Result<u32, BrokerStatus> {
        let id = self.last_id.checked_add(4).ok_or(BrokerStatus::NoMemory)?;
        self.last_id = id;
        Ok(id)
    }

    fn session(&self, id: SessionId) -> Result<&Session, BrokerStatus> {
        self.sessions.get(&id).ok_or(BrokerStatus::Disconnected)
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut Session, BrokerStatus> {
        self.sessions.get_mut(&id).ok_or(BrokerStatus::Disconnected)
    }

    fn record(&self, pid: ProcessId) -> Result<&ProcessRecord, BrokerStatus> {
        self.processes.get(&pid).ok_or(BrokerStatus::InvalidHandle)
    }

    fn record_mut(&mut self, pid: ProcessId) -> Result<&mut ProcessRecord, BrokerStatus> {
        self.processes.get_mut(&pid).ok_or(BrokerStatus::InvalidHandle)
    }

    /// Processes that count against the live-process limit.
    fn live_count(&self) -> usize {
        let running = self
            .processes
            .values()
            .filter(|p| p.exit_code.is_none())
            .count();
        let pending = self
            .sessions
            .values()
            .filter(|s| s.pending.as_ref().is_some_and(|p| p.child.is_none()))
            .count();
        running + pending
    }

    fn check_capacity(&self, max_processes: usize) -> Result<(), BrokerStatus> {
        if self.live_count() >= max_processes {
            log::warn!("[registry] live process limit {max_processes} reached");
            return Err(BrokerStatus::NoMemory);
        }
        Ok(())
    }

    fn register(
        &mut self,
        ppid: Option<ProcessId>,
        exe_name: Option<String>,
        create_flags: u32,
        startup: StartupParams,
        affinity: u32,
    ) -> Result<ProcessId, BrokerStatus> {
        let pid = self.next_id()?;
        let tid = self.next_id()?;
        self.processes.insert(
            pid,
            ProcessRecord {
                pid,
                tid,
                ppid,
                host_pid: None,
                name: None,
                exe_name,
                create_flags,
                startup,
                priority: PriorityClass::default(),
                affinity,
                exit_code: None,
                exit_provisional: false,
                loaded: false,
                created_at: Utc::now(),
            },
        );
        Ok(pid)
    }

    fn resolve(&self, session: SessionId, handle: Handle) -> Result<HandleEntry, BrokerStatus> {
        let session = self.session(session)?;
        if handle.is_current_process() {
            let pid = session.process.ok_or(BrokerStatus::InvalidHandle)?;
            return Ok(HandleEntry {
                object: Object::Process(pid),
                access: ProcessAccess::ALL_ACCESS,
                inherit: false,
            });
        }
        session
            .handles
            .get(handle)
            .copied()
            .ok_or(BrokerStatus::InvalidHandle)
    }

    /// Process behind a process handle carrying `access`.
    fn process_for(
        &self,
        session: SessionId,
        handle: Handle,
        access: ProcessAccess,
    ) -> Result<ProcessId, BrokerStatus> {
        let entry = self.resolve(session, handle)?;
        let Object::Process(pid) = entry.object else {
            return Err(BrokerStatus::InvalidHandle);
        };
        if !entry.access.contains(access) {
            return Err(BrokerStatus::AccessDenied);
        }
        Ok(pid)
    }

    fn is_signaled(&self, object: Object) -> bool {
        match object {
            Object::Process(pid) | Object::Thread(pid) => self
                .processes
                .get(&pid)
                .map_or(true, |p| p.exit_code.is_some()),
            Object::LoadDone(pid) => self.processes.get(&pid).is_some_and(|p| p.loaded),
        }
    }

    fn record_exit(&mut self, pid: ProcessId, code: u32) -> bool {
        match self.processes.get_mut(&pid) {
            Some(record) => record.set_exit_code(code),
            None => false,
        }
    }

    fn take_orphan_exit(&mut self, host_pid: u32) -> Option<u32> {
        let index = self.orphan_exits.iter().position(|(h, _)| *h == host_pid)?;
        self.orphan_exits.remove(index).map(|(_, status)| status)
    }

    /// Drop exited processes nobody can observe any more.
    fn prune(&mut self) {
        let sessions = &self.sessions;
        let referenced = |pid: ProcessId| {
            sessions.values().any(|s| {
                s.process == Some(pid)
                    || s.pending.as_ref().is_some_and(|p| p.child == Some(pid))
                    || s.handles.references(pid)
            })
        };
        self.processes
            .retain(|pid, record| record.exit_code.is_none() || referenced(*pid));
    }
}

/// Process registry shared by every session.
pub struct Registry {
    limits: Limits,
    host: Arc<dyn HostBackend>,
    state: Mutex<RegistryState>,
    changed: Condvar,
    broker_pid: u32,
    server_start: u64,
    system_affinity: u32,
}

fn system_affinity() -> u32 {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    if cpus >= 32 {
        u32::MAX
    } else {
        (1u32 << cpus) - 1
    }
}

impl Registry {
    pub fn new(limits: Limits, host: Arc<dyn HostBackend>) -> Self {
        Self {
            limits,
            host,
            state: Mutex::new(RegistryState::default()),
            changed: Condvar::new(),
            broker_pid: std::process::id(),
            server_start: u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default(),
            system_affinity: system_affinity(),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until notified or `deadline` passes. The flag is true once the
    /// deadline has passed.
    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, RegistryState>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, RegistryState>, bool) {
        match deadline {
            None => (
                self.changed
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                false,
            ),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (guard, true);
                }
                let (guard, _) = self
                    .changed
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, false)
            }
        }
    }

    // ── sessions ─────────────────────────────────────────────────────

    pub fn open_session(&self) -> SessionId {
        let mut state = self.lock();
        state.last_session += 1;
        let id = state.last_session;
        state.sessions.insert(id, Session::default());
        log::debug!("[registry] session {id} opened");
        id
    }

    /// Tear down a session. A bound process that never reported an exit
    /// code is marked exited with [`DISCONNECT_EXIT_CODE`] until the host
    /// reports its real status.
    pub fn close_session(&self, id: SessionId) {
        let mut state = self.lock();
        let Some(session) = state.sessions.remove(&id) else {
            return;
        };
        if let Some(record) = session.process.and_then(|pid| state.processes.get_mut(&pid)) {
            if record.set_exit_code(DISCONNECT_EXIT_CODE) {
                record.exit_provisional = true;
                log::info!("[registry] pid {} disconnected without exit code", record.pid);
            }
        }
        if session.pending.is_some() {
            log::debug!("[registry] session {id} closed with a pending creation");
        }
        state.prune();
        drop(state);
        self.changed.notify_all();
        log::debug!("[registry] session {id} closed");
    }

    /// Number of open handles held by a session.
    pub fn handle_count(&self, id: SessionId) -> usize {
        self.lock().sessions.get(&id).map_or(0, |s| s.handles.len())
    }

    /// Summaries of every known process, by pid.
    pub fn processes(&self) -> Vec<ProcessSummary> {
        self.lock()
            .processes
            .values()
            .map(ProcessRecord::summary)
            .collect()
    }

    /// Serve one request on behalf of `session`.
    pub fn handle(&self, session: SessionId, request: Request) -> Result<Reply, BrokerStatus> {
        log::trace!("[registry] session {session}: {}", request.kind());
        if !matches!(request, Request::Connect { .. })
            && self.lock().session(session)?.host_pid.is_none()
        {
            log::warn!("[registry] session {session}: {} before connect", request.kind());
            return Err(BrokerStatus::Protocol);
        }
        match request {
            Request::Connect { host_pid } => self.connect(session, host_pid),
            Request::NewProcess(req) => self.new_process(session, req),
            Request::WaitProcess(req) => self.wait_process(session, req),
            Request::InitProcess {
                host_pid,
                host_ppid,
            } => self.init_process(session, host_pid, host_ppid),
            Request::InitProcessDone(req) => self.init_process_done(session, req),
            Request::Select {
                handles,
                timeout_ms,
            } => self.select(session, &handles, timeout_ms),
            Request::OpenProcess {
                pid,
                access,
                inherit,
            } => self.open_process(session, pid, access, inherit),
            Request::GetProcessInfo { handle } => self.process_info(session, handle),
            Request::SetProcessInfo {
                handle,
                priority,
                affinity,
            } => self.set_process_info(session, handle, priority, affinity),
            Request::TerminateProcess { handle, exit_code } => {
                self.terminate_process(session, handle, exit_code)
            }
            Request::HostProcessExited { host_pid, status } => {
                self.host_process_exited(host_pid, status)
            }
            Request::ReadMemory {
                handle,
                addr,
                words,
            } => self.read_memory(session, handle, addr, words),
            Request::WriteMemory(req) => self.write_memory(session, req),
            Request::CloseHandle { handle } => self.close_handle(session, handle),
            Request::ListProcesses => Ok(Reply::Processes {
                processes: self.processes(),
            }),
        }
    }

    fn connect(&self, session: SessionId, host_pid: u32) -> Result<Reply, BrokerStatus> {
        self.lock().session_mut(session)?.host_pid = Some(host_pid);
        log::debug!("[registry] session {session} is host pid {host_pid}");
        Ok(Reply::Connected {
            max_transfer: u32::try_from(self.limits.max_transfer).unwrap_or(u32::MAX),
            broker_pid: self.broker_pid,
            server_start: self.server_start,
        })
    }

    // ── creation ─────────────────────────────────────────────────────

    fn new_process(
        &self,
        session: SessionId,
        req: NewProcessRequest,
    ) -> Result<Reply, BrokerStatus> {
        let mut state = self.lock();
        if state.session_mut(session)?.pending.take().is_some() {
            log::debug!("[registry] session {session}: stale pending creation replaced");
        }
        state.check_capacity(self.limits.max_processes)?;
        let parent = state.session(session)?.process;
        log::debug!(
            "[registry] session {session}: creation of {:?} registered (inherit all: {})",
            req.exe_name,
            req.inherit_all
        );
        state.session_mut(session)?.pending = Some(PendingCreation {
            parent,
            create_flags: req.create_flags,
            exe_name: req.exe_name,
            startup: req.startup,
            host_pid: None,
            child: None,
            early_exit: None,
        });
        Ok(Reply::Ack)
    }

    fn wait_process(
        &self,
        session: SessionId,
        req: WaitProcessRequest,
    ) -> Result<Reply, BrokerStatus> {
        let mut state = self.lock();
        if req.cancel {
            if let Some(pending) = state.session_mut(session)?.pending.take() {
                log::debug!(
                    "[registry] session {session}: creation of {:?} cancelled",
                    pending.exe_name
                );
            }
            return Ok(Reply::Ack);
        }

        let host_pid = req.host_pid.ok_or(BrokerStatus::InvalidParameter)?;
        let early_exit = state.take_orphan_exit(host_pid);
        {
            let pending = state
                .session_mut(session)?
                .pending
                .as_mut()
                .ok_or(BrokerStatus::InvalidParameter)?;
            pending.host_pid = Some(host_pid);
            if early_exit.is_some() {
                pending.early_exit = early_exit;
            }
        }

        let deadline = Instant::now() + Duration::from_millis(req.timeout_ms.into());
        loop {
            let settled = state
                .session(session)?
                .pending
                .as_ref()
                .ok_or(BrokerStatus::InvalidParameter)?
                .settled();
            if settled {
                break;
            }
            let (guard, expired) = self.wait(state, Some(deadline));
            state = guard;
            if expired {
                state.session_mut(session)?.pending = None;
                log::warn!("[registry] session {session}: host pid {host_pid} never registered");
                return Err(BrokerStatus::Timeout);
            }
        }

        let pending = state
            .session_mut(session)?
            .pending
            .take()
            .ok_or(BrokerStatus::InvalidParameter)?;
        let pid = match pending.child {
            Some(pid) => pid,
            None => state.register(
                pending.parent,
                pending.exe_name.clone(),
                pending.create_flags,
                pending.startup.clone(),
                self.system_affinity,
            )?,
        };
        let (tid, guest) = {
            let record = state.record_mut(pid)?;
            record.host_pid = Some(host_pid);
            if !pending.expects_child() {
                record.loaded = true;
            }
            if let Some(status) = pending.early_exit {
                record.set_exit_code(status);
            }
            (record.tid, pending.expects_child())
        };

        let handles = &mut state.session_mut(session)?.handles;
        let mut objects = vec![
            (Object::Process(pid), req.process_inherit),
            (Object::Thread(pid), req.thread_inherit),
        ];
        if guest {
            objects.push((Object::LoadDone(pid), false));
        }
        let allocated = alloc_all(handles, &objects)?;

        log::debug!("[registry] session {session}: pid {pid} (host pid {host_pid}) handed out");
        Ok(Reply::Created(CreatedProcess {
            pid,
            tid,
            process: allocated[0],
            thread: allocated[1],
            load_done: allocated.get(2).copied(),
        }))
    }

    fn init_process(
        &self,
        session: SessionId,
        host_pid: u32,
        host_ppid: u32,
    ) -> Result<Reply, BrokerStatus> {
        let mut state = self.lock();
        if state.session(session)?.process.is_some() {
            return Err(BrokerStatus::InvalidParameter);
        }

        let creator = state
            .sessions
            .iter()
            .find(|(id, s)| {
                **id != session
                    && s.host_pid == Some(host_ppid)
                    && s.pending.as_ref().is_some_and(|p| {
                        p.expects_child()
                            && p.child.is_none()
                            && p.host_pid.map_or(true, |h| h == host_pid)
                    })
            })
            .map(|(id, _)| *id);

        let pid = match creator {
            Some(creator) => {
                let (parent, exe_name, create_flags, startup) = {
                    let pending = state
                        .session(creator)?
                        .pending
                        .as_ref()
                        .ok_or(BrokerStatus::InvalidParameter)?;
                    (
                        pending.parent,
                        pending.exe_name.clone(),
                        pending.create_flags,
                        pending.startup.clone(),
                    )
                };
                let pid = state.register(
                    parent,
                    exe_name,
                    create_flags,
                    startup,
                    self.system_affinity,
                )?;
                if let Some(pending) = state.session_mut(creator)?.pending.as_mut() {
                    pending.child = Some(pid);
                }
                log::debug!("[registry] host pid {host_pid} matched creation by session {creator}");
                pid
            }
            None => {
                state.check_capacity(self.limits.max_processes)?;
                state.register(None, None, 0, StartupParams::default(), self.system_affinity)?
            }
        };

        state.session_mut(session)?.process = Some(pid);
        let record = state.record_mut(pid)?;
        record.host_pid = Some(host_pid);
        let reply = StartupReply {
            pid,
            tid: record.tid,
            parent: record.ppid,
            create_flags: record.create_flags,
            exe_name: record.exe_name.clone(),
            startup: record.startup.clone(),
            server_start: self.server_start,
        };
        drop(state);
        self.changed.notify_all();
        Ok(Reply::Startup(reply))
    }

    fn init_process_done(
        &self,
        session: SessionId,
        req: InitProcessDoneRequest,
    ) -> Result<Reply, BrokerStatus> {
        let mut state = self.lock();
        let pid = state
            .session(session)?
            .process
            .ok_or(BrokerStatus::InvalidHandle)?;
        let record = state.record_mut(pid)?;
        record.name = Some(req.name);
        record.loaded = true;
        let debugged = CreationFlags::from_bits_retain(record.create_flags).debugged();
        log::debug!(
            "[registry] pid {pid} ready: module {:#x}, entry {:#x}, gui {}",
            req.module,
            req.entry,
            req.gui
        );
        drop(state);
        self.changed.notify_all();
        Ok(Reply::Initialized { debugged })
    }

    // ── waiting ──────────────────────────────────────────────────────

    fn select(
        &self,
        session: SessionId,
        handles: &[Handle],
        timeout_ms: Option<u32>,
    ) -> Result<Reply, BrokerStatus> {
        if handles.is_empty() {
            return Err(BrokerStatus::InvalidParameter);
        }
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms.into()));
        let mut state = self.lock();
        loop {
            let mut objects = Vec::with_capacity(handles.len());
            for &handle in handles {
                let entry = state.resolve(session, handle)?;
                if matches!(entry.object, Object::Process(_))
                    && !entry.access.contains(ProcessAccess::SYNCHRONIZE)
                {
                    return Err(BrokerStatus::AccessDenied);
                }
                objects.push(entry.object);
            }
            if let Some(index) = objects.iter().position(|o| state.is_signaled(*o)) {
                return Ok(Reply::Signaled { index });
            }
            let (guard, expired) = self.wait(state, deadline);
            state = guard;
            if expired {
                return Err(BrokerStatus::Timeout);
            }
        }
    }

    // ── process information ──────────────────────────────────────────

    fn open_process(
        &self,
        session: SessionId,
        pid: ProcessId,
        access: u32,
        inherit: bool,
    ) -> Result<Reply, BrokerStatus> {
        let mut state = self.lock();
        if !state.processes.contains_key(&pid) {
            return Err(BrokerStatus::NotFound);
        }
        let entry = HandleEntry {
            object: Object::Process(pid),
            access: ProcessAccess::from_bits_truncate(access),
            inherit,
        };
        let handle = state.session_mut(session)?.handles.alloc(entry)?;
        Ok(Reply::Handle { handle })
    }

    fn process_info(&self, session: SessionId, handle: Handle) -> Result<Reply, BrokerStatus> {
        let state = self.lock();
        let pid = state.process_for(session, handle, ProcessAccess::QUERY_INFORMATION)?;
        let record = state.record(pid)?;
        Ok(Reply::ProcessInfo(ProcessInfo {
            pid,
            ppid: record.ppid,
            exit_code: record.exit_code.unwrap_or(STILL_ACTIVE),
            priority: record.priority,
            process_affinity: record.affinity,
            system_affinity: self.system_affinity,
        }))
    }

    fn set_process_info(
        &self,
        session: SessionId,
        handle: Handle,
        priority: Option<PriorityClass>,
        affinity: Option<u32>,
    ) -> Result<Reply, BrokerStatus> {
        if let Some(mask) = affinity {
            if mask == 0 || mask & !self.system_affinity != 0 {
                return Err(BrokerStatus::InvalidParameter);
            }
        }
        let mut state = self.lock();
        let pid = state.process_for(session, handle, ProcessAccess::SET_INFORMATION)?;
        let record = state.record_mut(pid)?;
        if let Some(class) = priority {
            record.priority = class;
        }
        if let Some(mask) = affinity {
            record.affinity = mask;
        }
        Ok(Reply::Ack)
    }

    fn terminate_process(
        &self,
        session: SessionId,
        handle: Handle,
        exit_code: u32,
    ) -> Result<Reply, BrokerStatus> {
        let mut state = self.lock();
        let pid = state.process_for(session, handle, ProcessAccess::TERMINATE)?;
        let own = state.session(session)?.process == Some(pid);
        let recorded = state.record_exit(pid, exit_code);
        let host_pid = state.record(pid)?.host_pid;
        state.prune();
        drop(state);
        self.changed.notify_all();

        if recorded {
            log::debug!("[registry] pid {pid} exit code {exit_code}");
            if let (false, Some(host_pid)) = (own, host_pid) {
                self.host.terminate(host_pid);
            }
        }
        Ok(Reply::Ack)
    }

    fn host_process_exited(&self, host_pid: u32, status: u32) -> Result<Reply, BrokerStatus> {
        let mut state = self.lock();
        let known = state
            .processes
            .values()
            .find(|p| p.host_pid == Some(host_pid))
            .map(|p| p.pid);
        match known {
            Some(pid) => {
                let recorded = state
                    .processes
                    .get_mut(&pid)
                    .is_some_and(|record| record.set_host_status(status));
                if recorded {
                    log::debug!("[registry] pid {pid} (host pid {host_pid}) exited with {status}");
                }
            }
            None => {
                let state = &mut *state;
                let pending = state
                    .sessions
                    .values_mut()
                    .filter_map(|s| s.pending.as_mut())
                    .find(|p| p.host_pid == Some(host_pid));
                match pending {
                    Some(pending) => pending.early_exit = Some(status),
                    None => {
                        if state.orphan_exits.len() == ORPHAN_EXIT_LIMIT {
                            state.orphan_exits.pop_front();
                        }
                        state.orphan_exits.push_back((host_pid, status));
                    }
                }
            }
        }
        state.prune();
        drop(state);
        self.changed.notify_all();
        Ok(Reply::Ack)
    }

    // ── memory ───────────────────────────────────────────────────────

    /// Host pid of a live process reachable through `handle`.
    fn memory_target(
        &self,
        session: SessionId,
        handle: Handle,
        access: ProcessAccess,
    ) -> Result<u32, BrokerStatus> {
        let state = self.lock();
        let pid = state.process_for(session, handle, access)?;
        let record = state.record(pid)?;
        if record.exit_code.is_some() {
            return Err(BrokerStatus::AccessDenied);
        }
        record.host_pid.ok_or(BrokerStatus::AccessDenied)
    }

    fn check_window(&self, addr: u64, len: usize) -> Result<(), BrokerStatus> {
        if addr % WORD_SIZE as u64 != 0 || len % WORD_SIZE != 0 || len > self.limits.max_transfer {
            return Err(BrokerStatus::InvalidParameter);
        }
        Ok(())
    }

    fn read_memory(
        &self,
        session: SessionId,
        handle: Handle,
        addr: u64,
        words: u32,
    ) -> Result<Reply, BrokerStatus> {
        let len = (words as usize)
            .checked_mul(WORD_SIZE)
            .ok_or(BrokerStatus::InvalidParameter)?;
        self.check_window(addr, len)?;
        let host_pid = self.memory_target(session, handle, ProcessAccess::VM_READ)?;
        if len == 0 {
            return Ok(Reply::Memory { data: Vec::new() });
        }
        let data = self.host.read(host_pid, addr, len)?;
        Ok(Reply::Memory { data })
    }

    fn write_memory(
        &self,
        session: SessionId,
        req: WriteMemoryRequest,
    ) -> Result<Reply, BrokerStatus> {
        if req.data.is_empty() {
            return Err(BrokerStatus::InvalidParameter);
        }
        self.check_window(req.addr, req.data.len())?;
        let host_pid = self.memory_target(session, req.handle, ProcessAccess::VM_WRITE)?;
        if req.first_mask == ALL_BYTES && req.last_mask == ALL_BYTES {
            self.host.write(host_pid, req.addr, &req.data)?;
        } else {
            let mut current = self.host.read(host_pid, req.addr, req.data.len())?;
            merge_masked(&mut current, &req.data, req.first_mask, req.last_mask);
            self.host.write(host_pid, req.addr, &current)?;
        }
        Ok(Reply::Ack)
    }

    fn close_handle(&self, session: SessionId, handle: Handle) -> Result<Reply, BrokerStatus> {
        if handle.is_current_process() {
            return Ok(Reply::Ack);
        }
        let mut state = self.lock();
        state
            .session_mut(session)?
            .handles
            .close(handle)
            .ok_or(BrokerStatus::InvalidHandle)?;
        state.prune();
        Ok(Reply::Ack)
    }
}

/// Allocate one handle per object; on failure the ones already allocated
/// are closed again.
fn alloc_all(
    handles: &mut HandleTable,
    objects: &[(Object, bool)],
) -> Result<Vec<Handle>, BrokerStatus> {
    let mut allocated = Vec::with_capacity(objects.len());
    for &(object, inherit) in objects {
        let entry = HandleEntry {
            object,
            access: ProcessAccess::ALL_ACCESS,
            inherit,
        };
        match handles.alloc(entry) {
            Ok(handle) => allocated.push(handle),
            Err(status) => {
                for handle in allocated {
                    handles.close(handle);
                }
                return Err(status);
            }
        }
    }
    Ok(allocated)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoHost;

    impl HostBackend for NoHost {
        fn read(&self, _: u32, _: u64, _: usize) -> Result<Vec<u8>, BrokerStatus> {
            Err(BrokerStatus::AccessDenied)
        }

        fn write(&self, _: u32, _: u64, _: &[u8]) -> Result<(), BrokerStatus> {
            Err(BrokerStatus::AccessDenied)
        }

        fn terminate(&self, _: u32) {}
    }

    fn registry() -> Registry {
        Registry::new(Limits::default(), Arc::new(NoHost))
    }

    fn connected(registry: &Registry, host_pid: u32) -> SessionId {
        let session = registry.open_session();
        registry
            .handle(session, Request::Connect { host_pid })
            .unwrap();
        session
    }

    fn init(
        registry: &Registry,
        session: SessionId,
        host_pid: u32,
        host_ppid: u32,
    ) -> StartupReply {
        match registry
            .handle(session, Request::InitProcess { host_pid, host_ppid })
            .unwrap()
        {
            Reply::Startup(startup) => startup,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn ids_are_multiples_of_four_and_increase() {
        let registry = registry();
        let mut last = 0;
        for host_pid in 100..110 {
            let session = connected(&registry, host_pid);
            let startup = init(&registry, session, host_pid, 1);
            assert_eq!(startup.pid % 4, 0);
            assert_eq!(startup.tid % 4, 0);
            assert!(startup.pid > last && startup.tid > startup.pid);
            last = startup.tid;
            registry.close_session(session);
        }
    }

    #[test]
    fn requests_before_connect_are_refused() {
        let registry = registry();
        let session = registry.open_session();
        assert_eq!(
            registry.handle(session, Request::ListProcesses),
            Err(BrokerStatus::Protocol)
        );
    }

    #[test]
    fn disconnect_records_exit_code_one() {
        let registry = registry();
        let observer = connected(&registry, 1);
        let session = connected(&registry, 200);
        let pid = init(&registry, session, 200, 1).pid;
        let handle = match registry
            .handle(
                observer,
                Request::OpenProcess {
                    pid,
                    access: ProcessAccess::QUERY_INFORMATION.bits(),
                    inherit: false,
                },
            )
            .unwrap()
        {
            Reply::Handle { handle } => handle,
            other => panic!("unexpected reply {other:?}"),
        };

        registry.close_session(session);
        match registry
            .handle(observer, Request::GetProcessInfo { handle })
            .unwrap()
        {
            Reply::ProcessInfo(info) => assert_eq!(info.exit_code, DISCONNECT_EXIT_CODE),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn host_status_replaces_disconnect_code() {
        let registry = registry();
        let observer = connected(&registry, 1);
        let session = connected(&registry, 210);
        let pid = init(&registry, session, 210, 1).pid;
        let handle = match registry
            .handle(
                observer,
                Request::OpenProcess {
                    pid,
                    access: ProcessAccess::QUERY_INFORMATION.bits(),
                    inherit: false,
                },
            )
            .unwrap()
        {
            Reply::Handle { handle } => handle,
            other => panic!("unexpected reply {other:?}"),
        };
        let exit_code = || match registry
            .handle(observer, Request::GetProcessInfo { handle })
            .unwrap()
        {
            Reply::ProcessInfo(info) => info.exit_code,
            other => panic!("unexpected reply {other:?}"),
        };

        registry.close_session(session);
        assert_eq!(exit_code(), DISCONNECT_EXIT_CODE);

        // Killed by SIGSEGV: the reaper reports 128 + 11.
        for status in [139, 0] {
            registry
                .handle(observer, Request::HostProcessExited { host_pid: 210, status })
                .unwrap();
        }
        assert_eq!(exit_code(), 139);
    }

    #[test]
    fn first_exit_code_wins() {
        let registry = registry();
        let session = connected(&registry, 300);
        init(&registry, session, 300, 1);
        for code in [7, 9] {
            registry
                .handle(
                    session,
                    Request::TerminateProcess {
                        handle: Handle::CURRENT_PROCESS,
                        exit_code: code,
                    },
                )
                .unwrap();
        }
        registry
            .handle(session, Request::HostProcessExited { host_pid: 300, status: 11 })
            .unwrap();
        let info = registry
            .handle(session, Request::GetProcessInfo { handle: Handle::CURRENT_PROCESS })
            .unwrap();
        match info {
            Reply::ProcessInfo(info) => assert_eq!(info.exit_code, 7),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn select_with_zero_timeout_on_running_process_times_out() {
        let registry = registry();
        let session = connected(&registry, 400);
        init(&registry, session, 400, 1);
        assert_eq!(
            registry.handle(
                session,
                Request::Select {
                    handles: vec![Handle::CURRENT_PROCESS],
                    timeout_ms: Some(0),
                }
            ),
            Err(BrokerStatus::Timeout)
        );
    }

    #[test]
    fn open_unknown_pid_is_not_found() {
        let registry = registry();
        let session = connected(&registry, 500);
        assert_eq!(
            registry.handle(
                session,
                Request::OpenProcess {
                    pid: 4000,
                    access: ProcessAccess::ALL_ACCESS.bits(),
                    inherit: false,
                }
            ),
            Err(BrokerStatus::NotFound)
        );
    }

    #[test]
    fn oversized_read_is_invalid() {
        let registry = registry();
        let session = connected(&registry, 600);
        init(&registry, session, 600, 1);
        let words = (Limits::default().max_transfer / WORD_SIZE + 1) as u32;
        assert_eq!(
            registry.handle(
                session,
                Request::ReadMemory {
                    handle: Handle::CURRENT_PROCESS,
                    addr: 0x1000,
                    words,
                }
            ),
            Err(BrokerStatus::InvalidParameter)
        );
    }

    #[test]
    fn exited_unreferenced_processes_are_pruned() {
        let registry = registry();
        let session = connected(&registry, 700);
        init(&registry, session, 700, 1);
        assert_eq!(registry.processes().len(), 1);
        registry.close_session(session);
        assert!(registry.processes().is_empty());
    }
}
