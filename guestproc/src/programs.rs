//! Console programs shipped with the builtin loader.

use std::io::Write;
use std::time::Duration;

use crate::context::ProcessContext;
use crate::loader::BuiltinProgram;
use crate::spawn::build_argv;

pub fn shipped() -> Vec<(&'static str, BuiltinProgram)> {
    vec![
        ("echo", BuiltinProgram::console(echo)),
        ("exit", BuiltinProgram::console(exit)),
        ("sleep", BuiltinProgram::console(sleep)),
    ]
}

fn arguments(ctx: &ProcessContext) -> Vec<String> {
    build_argv(&ctx.command_line()).into_iter().skip(1).collect()
}

/// Print the arguments on one line.
fn echo(ctx: &ProcessContext) -> u32 {
    let mut out = std::io::stdout().lock();
    match writeln!(out, "{}", arguments(ctx).join(" ")) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Exit with the first argument as exit code.
fn exit(ctx: &ProcessContext) -> u32 {
    arguments(ctx)
        .first()
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

/// Sleep for the first argument in milliseconds.
fn sleep(ctx: &ProcessContext) -> u32 {
    let millis = arguments(ctx)
        .first()
        .and_then(|ms| ms.parse().ok())
        .unwrap_or(0);
    std::thread::sleep(Duration::from_millis(millis));
    0
}
