//! Process lifecycle notifications.
//!
//! A host component (a shell, a debugger front end) may register a
//! [`LifecycleSink`] to hear about process and thread milestones. With no
//! sink registered every notification is a no-op.

use std::sync::Arc;

use crate::descriptor::{ProcessDescriptor, ProcessFlags};
use crate::loader::ModuleHandle;
use crate::protocol::StartupFlags;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum UserSignal {
    ThreadInit = 0x0020,
    ProcessCreate = 0x0100,
    ProcessInit = 0x0200,
    ProcessExit = 0x0300,
    ProcessRunning = 0x0500,
    ProcessLoaded = 0x0600,
}

impl UserSignal {
    /// Thread notifications are addressed to the thread, all others to the process.
    pub fn targets_thread(self) -> bool {
        self == Self::ThreadInit
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SignalFlags: u32 {
        const WIN32 = 0x0001;
        const GUI = 0x0002;
        const FEEDBACK = 0x0004;
    }
}

/// Flags describing the process to a sink.
///
/// GUI processes get launch feedback unless the creator forced it off;
/// console processes only when the creator forced it on.
pub fn signal_flags(flags: ProcessFlags, startup: StartupFlags) -> SignalFlags {
    let mut out = SignalFlags::empty();
    if !flags.contains(ProcessFlags::WIN16) {
        out |= SignalFlags::WIN32;
    }
    if flags.contains(ProcessFlags::CONSOLE) {
        if startup.contains(StartupFlags::FORCEONFEEDBACK) {
            out |= SignalFlags::FEEDBACK;
        }
    } else {
        out |= SignalFlags::GUI;
        if !startup.contains(StartupFlags::FORCEOFFFEEDBACK) {
            out |= SignalFlags::FEEDBACK;
        }
    }
    out
}

pub trait LifecycleSink: Send + Sync {
    fn notify(&self, signal: UserSignal, target: u32, flags: SignalFlags, module: ModuleHandle);
}

/// Sink that writes every notification to the log.
pub struct LoggingSink;

impl LifecycleSink for LoggingSink {
    fn notify(&self, signal: UserSignal, target: u32, flags: SignalFlags, module: ModuleHandle) {
        log::info!("[lifecycle] {signal:?} target {target} flags {flags:?} module {module}");
    }
}

#[derive(Clone, Default)]
pub struct LifecycleNotifier {
    sink: Option<Arc<dyn LifecycleSink>>,
}

impl LifecycleNotifier {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn LifecycleSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn is_registered(&self) -> bool {
        self.sink.is_some()
    }

    /// Deliver `signal` for the process `descriptor` describes.
    pub fn signal(&self, descriptor: &ProcessDescriptor, signal: UserSignal, module: ModuleHandle) {
        let Some(sink) = &self.sink else {
            return;
        };
        let (target, flags) = {
            let state = descriptor.lock();
            let target = if signal.targets_thread() { state.tid } else { state.pid };
            let startup = StartupFlags::from_bits_retain(state.env.startup.flags);
            (target, signal_flags(state.flags, startup))
        };
        sink.notify(signal, target, flags, module);
    }
}
