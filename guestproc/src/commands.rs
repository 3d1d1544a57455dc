//! Subcommand handlers. Each returns the JSON value to print.

use serde::Serialize;

use crate::broker::socket_exit_reporter;
use crate::cli::{CreateArgs, PidArg, PriorityArgs, ReadMemArgs, TerminateArgs, WriteMemArgs};
use crate::context::ProcessContext;
use crate::create::{create_process, CreateRequest};
use crate::error::GuestProcError;
use crate::memory::{read_memory, write_memory};
use crate::protocol::{PriorityClass, ProcessAccess, ProcessId, StartupParams};
use crate::spawn::{build_command_line, HostSpawner};

// ── Output types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
pub struct CreateOutput {
    pub pid: ProcessId,
    pub tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u32>,
}

#[derive(Serialize, Debug)]
pub struct ExitCodeOutput {
    pub pid: ProcessId,
    pub exit_code: u32,
    pub running: bool,
}

#[derive(Serialize, Debug)]
pub struct PriorityOutput {
    pub pid: ProcessId,
    pub priority: PriorityClass,
}

#[derive(Serialize, Debug)]
pub struct MemoryOutput {
    pub pid: ProcessId,
    pub address: String,
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────

pub fn create(ctx: &ProcessContext, args: CreateArgs) -> Result<serde_json::Value, GuestProcError> {
    let program = args.filename.to_string_lossy().into_owned();
    let mut argv = vec![program.clone()];
    argv.extend(args.args);

    let request = CreateRequest {
        image: args.guest.then(|| program.clone()),
        filename: args.filename,
        command_line: build_command_line(&argv),
        extra_env: args.env,
        inherit_handles: args.inherit,
        startup: StartupParams::default(),
        current_directory: args.cwd,
        ..CreateRequest::default()
    };

    let spawner = HostSpawner::new(&ctx.config)
        .report_exits(socket_exit_reporter(ctx.config.socket_path.clone()));
    let info = create_process(ctx, &spawner, &request)?;

    let exit_code = if args.wait {
        ctx.session.select(&[info.process], None)?;
        Some(ctx.exit_code(info.process)?)
    } else {
        None
    };
    ctx.close_handle(info.thread)?;
    ctx.close_handle(info.process)?;

    Ok(serde_json::to_value(CreateOutput {
        pid: info.pid,
        tid: info.tid,
        exit_code,
    })?)
}

pub fn list(ctx: &ProcessContext) -> Result<serde_json::Value, GuestProcError> {
    Ok(serde_json::to_value(ctx.session.list_processes()?)?)
}

pub fn exit_code(ctx: &ProcessContext, args: PidArg) -> Result<serde_json::Value, GuestProcError> {
    let handle = ctx.open_process(args.pid, ProcessAccess::QUERY_INFORMATION, false)?;
    let result = ctx.exit_code(handle);
    ctx.close_handle(handle)?;
    let exit_code = result?;
    Ok(serde_json::to_value(ExitCodeOutput {
        pid: args.pid,
        exit_code,
        running: exit_code == crate::protocol::STILL_ACTIVE,
    })?)
}

pub fn priority(
    ctx: &ProcessContext,
    args: PriorityArgs,
) -> Result<serde_json::Value, GuestProcError> {
    let access = ProcessAccess::QUERY_INFORMATION | ProcessAccess::SET_INFORMATION;
    let handle = ctx.open_process(args.pid, access, false)?;
    let result = match args.set {
        Some(class) => ctx
            .set_priority_class(handle, class.into())
            .and_then(|()| ctx.priority_class(handle)),
        None => ctx.priority_class(handle),
    };
    ctx.close_handle(handle)?;
    Ok(serde_json::to_value(PriorityOutput {
        pid: args.pid,
        priority: result?,
    })?)
}

pub fn read_mem(
    ctx: &ProcessContext,
    args: ReadMemArgs,
) -> Result<serde_json::Value, GuestProcError> {
    let handle = ctx.open_process(args.pid, ProcessAccess::VM_READ, false)?;
    let mut buf = vec![0u8; args.length];
    let result = read_memory(&ctx.session, handle, args.address, &mut buf);
    ctx.close_handle(handle)?;
    let length = result?;
    Ok(serde_json::to_value(MemoryOutput {
        pid: args.pid,
        address: format!("{:#x}", args.address),
        length,
        data: Some(hex::encode(&buf[..length])),
    })?)
}

pub fn write_mem(
    ctx: &ProcessContext,
    args: WriteMemArgs,
) -> Result<serde_json::Value, GuestProcError> {
    let data = hex::decode(args.data.trim())
        .map_err(|_| GuestProcError::InvalidParameter("data is not valid hex"))?;
    let handle = ctx.open_process(args.pid, ProcessAccess::VM_WRITE, false)?;
    let result = write_memory(&ctx.session, handle, args.address, &data);
    ctx.close_handle(handle)?;
    Ok(serde_json::to_value(MemoryOutput {
        pid: args.pid,
        address: format!("{:#x}", args.address),
        length: result?,
        data: None,
    })?)
}

pub fn terminate(
    ctx: &ProcessContext,
    args: TerminateArgs,
) -> Result<serde_json::Value, GuestProcError> {
    let handle = ctx.open_process(args.pid, ProcessAccess::TERMINATE, false)?;
    let result = ctx.terminate_process(handle, args.code);
    ctx.close_handle(handle)?;
    result?;
    Ok(serde_json::json!({ "pid": args.pid, "exit_code": args.code }))
}
