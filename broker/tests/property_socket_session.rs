//! Property 5: Sessions over the socket
//!
//! A process that connects over the broker socket can create a host
//! process, wait for it and read its exit code, with the reaper's report
//! arriving over a connection of its own. Memory requests against the
//! current process reach the real address space.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use guestproc::broker::socket_exit_reporter;
use guestproc::config::RuntimeConfig;
use guestproc::context::ProcessContext;
use guestproc::create::{create_process, CreateRequest};
use guestproc::memory::{read_memory, write_memory};
use guestproc::protocol::{Handle, STILL_ACTIVE};
use guestproc::spawn::HostSpawner;
use guestproc_broker::host::LinuxHost;
use guestproc_broker::{server, Limits, Registry};

/// Start a broker on a socket inside `dir` and return a config pointing at it.
fn start_broker(dir: &tempfile::TempDir) -> RuntimeConfig {
    let socket_path = dir.path().join("run").join("broker.sock");
    let listener = server::bind(&socket_path).unwrap();
    let registry = Arc::new(Registry::new(Limits::default(), Arc::new(LinuxHost)));
    std::thread::spawn(move || server::serve(listener, registry));
    RuntimeConfig {
        socket_path,
        creation_timeout_ms: 10_000,
        ..RuntimeConfig::default()
    }
}

#[test]
fn host_binary_exit_code_arrives_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = start_broker(&dir);
    let ctx = ProcessContext::connect(config.clone()).unwrap();
    assert_eq!(ctx.session.host_pid(), std::process::id());

    let script = dir.path().join("exit9.sh");
    std::fs::write(&script, "exit 9\n").unwrap();
    let spawner =
        HostSpawner::new(&config).report_exits(socket_exit_reporter(config.socket_path.clone()));
    let request = CreateRequest {
        filename: PathBuf::from("/bin/sh"),
        command_line: format!("sh {}", script.display()),
        ..CreateRequest::default()
    };

    let info = create_process(&ctx, &spawner, &request).unwrap();
    let index = ctx
        .session
        .select(&[info.process], Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(index, 0);
    let code = ctx.exit_code(info.process).unwrap();
    assert_ne!(code, STILL_ACTIVE);
    assert_eq!(code, 9);

    let listed = ctx.session.list_processes().unwrap();
    assert!(listed.iter().any(|p| p.pid == info.pid && p.ppid == Some(ctx.pid())));

    ctx.close_handle(info.thread).unwrap();
    ctx.close_handle(info.process).unwrap();
}

#[test]
fn own_memory_round_trips_through_broker() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ProcessContext::connect(start_broker(&dir)).unwrap();

    let mut buffer = vec![0u8; 64];
    let addr = buffer.as_mut_ptr() as u64 + 3;
    let message = b"through the broker";
    write_memory(&ctx.session, Handle::CURRENT_PROCESS, addr, message).unwrap();
    // Written behind the compiler's back.
    let buffer = std::hint::black_box(buffer);
    assert_eq!(&buffer[3..3 + message.len()], message);
    assert_eq!(buffer[2], 0);
    assert_eq!(buffer[3 + message.len()], 0);

    let mut back = [0u8; 18];
    read_memory(&ctx.session, Handle::CURRENT_PROCESS, addr, &mut back).unwrap();
    assert_eq!(&back, message);
}

#[test]
fn second_connection_gets_its_own_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = start_broker(&dir);
    let first = ProcessContext::connect(config.clone()).unwrap();
    let second = ProcessContext::connect(config).unwrap();
    assert_ne!(first.pid(), second.pid());
    assert!(second.pid() > first.pid());
    assert_eq!(second.session.list_processes().unwrap().len(), 2);
}
