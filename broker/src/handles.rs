//! Per-session handle tables.

use std::collections::BTreeMap;

use guestproc::protocol::{BrokerStatus, Handle, ProcessAccess, ProcessId};

/// What a handle refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Object {
    Process(ProcessId),
    /// Main thread of the process.
    Thread(ProcessId),
    /// Event signaled when the process finished initializing.
    LoadDone(ProcessId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleEntry {
    pub object: Object,
    pub access: ProcessAccess,
    pub inherit: bool,
}

/// Handle values are multiples of 4, allocated upward and never reused
/// within a session.
#[derive(Debug)]
pub struct HandleTable {
    entries: BTreeMap<Handle, HandleEntry>,
    next: u32,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next: 4,
        }
    }
}

impl HandleTable {
    pub fn alloc(&mut self, entry: HandleEntry) -> Result<Handle, BrokerStatus> {
        let value = self.next;
        let next = value.checked_add(4).ok_or(BrokerStatus::NoMemory)?;
        let handle = Handle(value);
        if handle.is_current_process() {
            return Err(BrokerStatus::NoMemory);
        }
        self.next = next;
        self.entries.insert(handle, entry);
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&HandleEntry> {
        self.entries.get(&handle)
    }

    pub fn close(&mut self, handle: Handle) -> Option<HandleEntry> {
        self.entries.remove(&handle)
    }

    /// Whether any handle refers to an object of process `pid`.
    pub fn references(&self, pid: ProcessId) -> bool {
        self.entries.values().any(|entry| match entry.object {
            Object::Process(p) | Object::Thread(p) | Object::LoadDone(p) => p == pid,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
