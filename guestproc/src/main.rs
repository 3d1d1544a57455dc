use std::process::ExitCode;

use clap::Parser;

use guestproc::cli::{Cli, Command};
use guestproc::config::{RuntimeConfig, LOG_ENV};
use guestproc::context::ProcessContext;
use guestproc::error::GuestProcError;
use guestproc::loader::BuiltinLoader;
use guestproc::output::{emit, emit_error, OutputFormat};
use guestproc::spawn::RUNTIME_MARKER;
use guestproc::startup::{start_process, StartupOptions};
use guestproc::commands;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(LOG_ENV, "warn")).init();

    let raw: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    if raw.get(1).map(String::as_str) == Some(RUNTIME_MARKER) {
        return run_guest(&raw[2..], OutputFormat::Human);
    }

    let cli = Cli::parse();
    if let Command::Run(args) = &cli.command {
        return run_guest(&args.args, cli.output);
    }

    let ctx = match RuntimeConfig::load().and_then(ProcessContext::connect) {
        Ok(ctx) => ctx,
        Err(e) => return fail(cli.output, &e),
    };

    let result: Result<serde_json::Value, GuestProcError> = match cli.command {
        Command::Run(_) => unreachable!("handled above"),
        Command::Create(args) => commands::create(&ctx, args),
        Command::List => commands::list(&ctx),
        Command::ExitCode(args) => commands::exit_code(&ctx, args),
        Command::Priority(args) => commands::priority(&ctx, args),
        Command::ReadMem(args) => commands::read_mem(&ctx, args),
        Command::WriteMem(args) => commands::write_mem(&ctx, args),
        Command::Terminate(args) => commands::terminate(&ctx, args),
    };

    match result {
        Ok(output) => {
            ctx.report_exit(0);
            let _ = emit(cli.output, &output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            ctx.report_exit(e.error_code());
            fail(cli.output, &e)
        }
    }
}

/// Become the guest process named by `args`. Only returns on bootstrap failure.
fn run_guest(args: &[String], format: OutputFormat) -> ExitCode {
    let ctx = match RuntimeConfig::load().and_then(ProcessContext::connect) {
        Ok(ctx) => ctx,
        Err(e) => return fail(format, &e),
    };
    let loader = BuiltinLoader::with_programs();
    start_process(&ctx, &loader, args, StartupOptions::default())
}

fn fail(format: OutputFormat, error: &GuestProcError) -> ExitCode {
    let code = error.exit_code();
    emit_error(format, exit_code_to_u8(&code), &error.to_string());
    code
}

fn exit_code_to_u8(code: &ExitCode) -> u8 {
    // ExitCode doesn't expose its inner value.
    if *code == ExitCode::from(2) {
        2
    } else if *code == ExitCode::from(1) {
        1
    } else {
        0
    }
}
