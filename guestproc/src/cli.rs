use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::output::OutputFormat;
use crate::protocol::PriorityClass;

/// Create, run and inspect guest processes.
///
/// `guestproc -- PROGRAM [ARGS...]` runs a guest program in this process;
/// it is how the runtime relaunches itself for a new guest.
#[derive(Parser, Debug)]
#[command(name = "guestproc", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Output format for all subcommands.
    #[arg(long, value_enum, default_value = "human", global = true)]
    pub output: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a guest program in this process.
    Run(RunArgs),

    /// Create a new process and print its identities.
    Create(CreateArgs),

    /// List processes known to the broker.
    List,

    /// Print the exit code of a process.
    ExitCode(PidArg),

    /// Show or change the priority class of a process.
    Priority(PriorityArgs),

    /// Read bytes from the address space of a process.
    ReadMem(ReadMemArgs),

    /// Write bytes into the address space of a process.
    WriteMem(WriteMemArgs),

    /// Terminate a process.
    Terminate(TerminateArgs),
}

// ── run ──────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Guest program followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub args: Vec<String>,
}

// ── create ───────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Treat FILENAME as a guest image run by a relaunched runtime instead
    /// of a host binary.
    #[arg(long)]
    pub guest: bool,

    /// Working directory of the new process.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Extra environment entry, NAME=VALUE; overrides every other value.
    #[arg(long = "env", value_name = "NAME=VALUE")]
    pub env: Vec<String>,

    /// Let the child inherit inheritable handles.
    #[arg(long)]
    pub inherit: bool,

    /// Wait for the process to exit and report its exit code.
    #[arg(long)]
    pub wait: bool,

    pub filename: PathBuf,

    /// Arguments after the program name.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

// ── process selection ────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct PidArg {
    pub pid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    Realtime,
}

impl From<PriorityArg> for PriorityClass {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Idle => Self::Idle,
            PriorityArg::BelowNormal => Self::BelowNormal,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::AboveNormal => Self::AboveNormal,
            PriorityArg::High => Self::High,
            PriorityArg::Realtime => Self::Realtime,
        }
    }
}

#[derive(Args, Debug)]
pub struct PriorityArgs {
    pub pid: u32,

    /// New priority class.
    #[arg(long, value_enum)]
    pub set: Option<PriorityArg>,
}

// ── memory ───────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct ReadMemArgs {
    pub pid: u32,

    /// Start address, decimal or 0x-prefixed hex.
    #[arg(value_parser = parse_address)]
    pub address: u64,

    /// Number of bytes.
    pub length: usize,
}

#[derive(Args, Debug)]
pub struct WriteMemArgs {
    pub pid: u32,

    /// Start address, decimal or 0x-prefixed hex.
    #[arg(value_parser = parse_address)]
    pub address: u64,

    /// Bytes to write, as hex.
    pub data: String,
}

// ── terminate ────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct TerminateArgs {
    pub pid: u32,

    /// Exit code recorded for the process.
    #[arg(long, default_value_t = 1)]
    pub code: u32,
}

pub fn parse_address(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{text}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_parse_in_hex_and_decimal() {
        assert_eq!(parse_address("0x1000"), Ok(0x1000));
        assert_eq!(parse_address("4096"), Ok(4096));
        assert!(parse_address("0xzz").is_err());
    }

    #[test]
    fn create_keeps_hyphenated_guest_arguments() {
        let cli =
            Cli::try_parse_from(["guestproc", "create", "--guest", "echo", "-n", "hi"]).unwrap();
        match cli.command {
            Command::Create(args) => {
                assert!(args.guest);
                assert_eq!(args.filename, PathBuf::from("echo"));
                assert_eq!(args.args, vec!["-n".to_string(), "hi".to_string()]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn priority_set_parses_class() {
        let cli =
            Cli::try_parse_from(["guestproc", "priority", "8", "--set", "above-normal"]).unwrap();
        match cli.command {
            Command::Priority(args) => {
                assert_eq!(args.set.map(PriorityClass::from), Some(PriorityClass::AboveNormal));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
