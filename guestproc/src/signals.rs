//! Host signal handling for guest processes.

use nix::sys::signal::{raise, sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::GuestProcError;

const FATAL_SIGNALS: [Signal; 4] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
];

extern "C" fn on_fatal_signal(signo: libc::c_int) {
    const MESSAGE: &[u8] = b"guestproc: unhandled fault in guest code\n";
    // SAFETY: write and _exit are async-signal-safe.
    unsafe {
        libc::write(libc::STDERR_FILENO, MESSAGE.as_ptr().cast(), MESSAGE.len());
        libc::_exit(128 + signo);
    }
}

/// Ignore `SIGPIPE` and turn hardware faults into a diagnostic plus exit
/// status `128 + signal`.
pub fn install() -> Result<(), GuestProcError> {
    let errno = |e: nix::errno::Errno| GuestProcError::Io(e.into());

    // SAFETY: SIG_IGN does not run any code.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.map_err(errno)?;

    let action = SigAction::new(
        SigHandler::Handler(on_fatal_signal),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    for sig in FATAL_SIGNALS {
        // SAFETY: the handler only calls async-signal-safe functions.
        unsafe { sigaction(sig, &action) }.map_err(errno)?;
    }
    log::debug!("[signals] fault handlers installed");
    Ok(())
}

/// Stop in the attached debugger.
pub fn trap_to_debugger() -> Result<(), GuestProcError> {
    raise(Signal::SIGTRAP).map_err(|e| GuestProcError::Io(e.into()))
}
