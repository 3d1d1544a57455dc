//! First code run inside a new guest process.
//!
//! Runs once, on the guest main thread, before any guest code. The order of
//! steps is observable by the broker and by lifecycle sinks and must not
//! change: readiness is reported before fault handling and notifications,
//! and the process-running notification is console-only.

use std::path::{Path, PathBuf};

use crate::context::ProcessContext;
use crate::descriptor::ProcessFlags;
use crate::error::GuestProcError;
use crate::lifecycle::UserSignal;
use crate::loader::{ImageLoader, Subsystem};
use crate::protocol::InitProcessDoneRequest;
use crate::signals;
use crate::spawn::build_command_line;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartupOptions {
    pub install_signal_handlers: bool,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            install_signal_handlers: true,
        }
    }
}

/// Display name of an image found by search.
fn canonical_name(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Initialize the process for the guest command line `args` and run the
/// entry point. Returns the entry point's result.
pub fn run(
    ctx: &ProcessContext,
    loader: &dyn ImageLoader,
    args: &[String],
    options: StartupOptions,
) -> Result<u32, GuestProcError> {
    let known_name = {
        let mut state = ctx.descriptor.lock();
        state.env.command_line = build_command_line(args);
        state.exe_name.clone()
    };

    let path = match &known_name {
        Some(name) => PathBuf::from(name),
        None => {
            let launch = args
                .first()
                .ok_or(GuestProcError::InvalidParameter("empty guest command line"))?;
            loader
                .find_image(launch)
                .ok_or_else(|| GuestProcError::ImageNotFound {
                    name: launch.clone(),
                })?
        }
    };

    let image = loader.load_image(&path)?;
    if image.is_dll {
        return Err(GuestProcError::BadExeFormat { path });
    }
    let gui = image.subsystem == Subsystem::Gui;
    let name = known_name.unwrap_or_else(|| canonical_name(&path));

    {
        let mut state = ctx.descriptor.lock();
        state.module = Some(image.module);
        state.version = image.version;
        state.flags.set(ProcessFlags::CONSOLE, !gui);
    }

    let debugged = ctx.session.init_process_done(InitProcessDoneRequest {
        module: image.module.0,
        entry: image.entry_address,
        name,
        gui,
    })?;
    if debugged {
        ctx.descriptor.lock().flags |= ProcessFlags::DEBUGGED;
    }

    if options.install_signal_handlers {
        signals::install()?;
    }

    {
        let _section = ctx.descriptor.lock();
        loader.attach_dependencies(&image)?;
    }

    let lifecycle = ctx.lifecycle();
    for signal in [
        UserSignal::ProcessCreate,
        UserSignal::ThreadInit,
        UserSignal::ProcessInit,
        UserSignal::ProcessLoaded,
    ] {
        lifecycle.signal(&ctx.descriptor, signal, image.module);
    }
    if !gui {
        lifecycle.signal(&ctx.descriptor, UserSignal::ProcessRunning, image.module);
    }

    if debugged && ctx.config.trap_on_debugger {
        signals::trap_to_debugger()?;
    }

    log::debug!(
        "[startup] pid {} entering {} at {:#x}",
        ctx.pid(),
        path.display(),
        image.entry_address
    );
    Ok((image.entry)(ctx))
}

/// [`run`] on a dedicated thread whose stack is sized by the configuration.
pub fn run_on_guest_stack(
    ctx: &ProcessContext,
    loader: &dyn ImageLoader,
    args: &[String],
    options: StartupOptions,
) -> Result<u32, GuestProcError> {
    std::thread::scope(|scope| {
        let main = std::thread::Builder::new()
            .name("guest-main".to_string())
            .stack_size(ctx.config.main_stack_size)
            .spawn_scoped(scope, || run(ctx, loader, args, options))?;
        main.join()
            .map_err(|_| GuestProcError::Io(std::io::Error::other("guest main thread panicked")))?
    })
}

/// Start the guest and terminate the process with its exit code. Any
/// failure before the entry point exits with that failure's error number.
pub fn start_process(
    ctx: &ProcessContext,
    loader: &dyn ImageLoader,
    args: &[String],
    options: StartupOptions,
) -> ! {
    let code = match run_on_guest_stack(ctx, loader, args, options) {
        Ok(code) => code,
        Err(e) => {
            log::error!("[startup] {e}");
            e.error_code()
        }
    };
    ctx.exit_process(code)
}
