#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use guestproc::broker::BrokerSession;
use guestproc::config::RuntimeConfig;
use guestproc::context::{HostIdentity, ProcessContext};
use guestproc::error::GuestProcError;
use guestproc::protocol::BrokerStatus;
use guestproc::spawn::{SpawnRequest, Spawner};
use guestproc_broker::host::HostBackend;
use guestproc_broker::{Limits, LocalTransport, Registry, SessionId};

/// Host memory and kill switch kept in a map.
#[derive(Default)]
pub struct FakeHost {
    pub memory: Mutex<HashMap<(u32, u64), u8>>,
    pub killed: Mutex<Vec<u32>>,
}

impl FakeHost {
    pub fn byte(&self, host_pid: u32, addr: u64) -> u8 {
        self.memory
            .lock()
            .unwrap()
            .get(&(host_pid, addr))
            .copied()
            .unwrap_or(0xEE)
    }
}

impl HostBackend for FakeHost {
    fn read(&self, host_pid: u32, addr: u64, len: usize) -> Result<Vec<u8>, BrokerStatus> {
        Ok((0..len as u64).map(|i| self.byte(host_pid, addr + i)).collect())
    }

    fn write(&self, host_pid: u32, addr: u64, data: &[u8]) -> Result<(), BrokerStatus> {
        let mut memory = self.memory.lock().unwrap();
        for (i, byte) in data.iter().enumerate() {
            memory.insert((host_pid, addr + i as u64), *byte);
        }
        Ok(())
    }

    fn terminate(&self, host_pid: u32) {
        self.killed.lock().unwrap().push(host_pid);
    }
}

pub fn broker(limits: Limits) -> (Arc<Registry>, Arc<FakeHost>) {
    let host = Arc::new(FakeHost::default());
    (Arc::new(Registry::new(limits, host.clone())), host)
}

pub fn config() -> RuntimeConfig {
    RuntimeConfig {
        creation_timeout_ms: 2000,
        ..RuntimeConfig::default()
    }
}

/// Register a process with host identity `pid`/`ppid` over a fresh session.
pub fn context(
    registry: &Arc<Registry>,
    config: RuntimeConfig,
    pid: u32,
    ppid: u32,
) -> Result<(ProcessContext, SessionId), GuestProcError> {
    let transport = LocalTransport::open(registry.clone());
    let session_id = transport.session();
    let session = BrokerSession::connect(Box::new(transport), pid)?;
    let ctx = ProcessContext::bootstrap(Arc::new(session), config, HostIdentity { pid, ppid })?;
    Ok((ctx, session_id))
}

pub type ChildBehavior = Arc<dyn Fn(ProcessContext, SpawnRequest) + Send + Sync>;

/// Spawner whose "host processes" are threads that register with the
/// broker as children of `creator_host_pid` and then run `behavior`.
pub struct SimulatedSpawner {
    registry: Arc<Registry>,
    creator_host_pid: u32,
    next_host_pid: AtomicU32,
    behavior: Option<ChildBehavior>,
    pub calls: AtomicUsize,
    pub children: Mutex<Vec<JoinHandle<()>>>,
}

impl SimulatedSpawner {
    /// Children run `behavior` after registering.
    pub fn new(registry: &Arc<Registry>, creator_host_pid: u32, behavior: ChildBehavior) -> Self {
        Self {
            behavior: Some(behavior),
            ..Self::silent(registry, creator_host_pid)
        }
    }

    /// Children never contact the broker, like a plain host binary.
    pub fn silent(registry: &Arc<Registry>, creator_host_pid: u32) -> Self {
        Self {
            registry: registry.clone(),
            creator_host_pid,
            next_host_pid: AtomicU32::new(creator_host_pid + 1),
            behavior: None,
            calls: AtomicUsize::new(0),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn join_children(&self) {
        for child in self.children.lock().unwrap().drain(..) {
            child.join().unwrap();
        }
    }
}

impl Spawner for SimulatedSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32, GuestProcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let host_pid = self.next_host_pid.fetch_add(1, Ordering::SeqCst);
        if let Some(behavior) = self.behavior.clone() {
            let registry = self.registry.clone();
            let ppid = self.creator_host_pid;
            let request = request.clone();
            let child = std::thread::spawn(move || {
                let (ctx, _) = context(&registry, config(), host_pid, ppid).unwrap();
                behavior(ctx, request);
            });
            self.children.lock().unwrap().push(child);
        }
        Ok(host_pid)
    }
}

/// Spawner that always fails like a missing binary.
pub struct FailingSpawner;

impl Spawner for FailingSpawner {
    fn spawn(&self, _request: &SpawnRequest) -> Result<u32, GuestProcError> {
        Err(GuestProcError::Spawn {
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        })
    }
}
