//! Property 5: Remote memory transfer
//!
//! Writing an arbitrary byte range and reading it back returns the written
//! bytes, for any alignment and any transfer limit. Bytes next to the range
//! keep their values, every request stays word aligned and within the limit,
//! and a refused chunk fails the whole call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use guestproc::broker::{BrokerSession, BrokerTransport};
use guestproc::error::GuestProcError;
use guestproc::memory::{merge_masked, read_memory, write_memory};
use guestproc::protocol::{BrokerStatus, Handle, Reply, Request, WORD_SIZE};
use proptest::prelude::*;

const PROCESS: Handle = Handle(4);

/// Value of a byte nobody wrote.
fn background(addr: u64) -> u8 {
    (addr.wrapping_mul(31) % 251) as u8
}

#[derive(Default)]
struct Remote {
    written: HashMap<u64, u8>,
    requests: usize,
    /// Aligned chunk address that is refused.
    fail_at: Option<u64>,
}

impl Remote {
    fn byte(&self, addr: u64) -> u8 {
        self.written.get(&addr).copied().unwrap_or_else(|| background(addr))
    }
}

/// Broker double serving memory requests from a sparse address space.
struct MemoryBroker {
    max_transfer: usize,
    remote: Arc<Mutex<Remote>>,
}

impl MemoryBroker {
    fn check(&self, addr: u64, len: usize) -> Result<(), BrokerStatus> {
        if addr % WORD_SIZE as u64 != 0 || len % WORD_SIZE != 0 || len > self.max_transfer {
            return Err(BrokerStatus::InvalidParameter);
        }
        Ok(())
    }
}

impl BrokerTransport for MemoryBroker {
    fn call(&mut self, request: &Request) -> Result<Reply, BrokerStatus> {
        let mut remote = self.remote.lock().unwrap();
        match request {
            Request::Connect { .. } => {
                return Ok(Reply::Connected {
                    max_transfer: self.max_transfer as u32,
                    broker_pid: 1,
                    server_start: 0,
                })
            }
            Request::ReadMemory { handle, addr, words } => {
                remote.requests += 1;
                assert_eq!(*handle, PROCESS);
                let len = *words as usize * WORD_SIZE;
                self.check(*addr, len)?;
                if remote.fail_at == Some(*addr) {
                    return Err(BrokerStatus::PartialCopy);
                }
                let data = (0..len as u64).map(|i| remote.byte(addr + i)).collect();
                Ok(Reply::Memory { data })
            }
            Request::WriteMemory(req) => {
                remote.requests += 1;
                assert_eq!(req.handle, PROCESS);
                if req.data.is_empty() {
                    return Err(BrokerStatus::InvalidParameter);
                }
                self.check(req.addr, req.data.len())?;
                if remote.fail_at == Some(req.addr) {
                    return Err(BrokerStatus::AccessDenied);
                }
                let mut current: Vec<u8> = (0..req.data.len() as u64)
                    .map(|i| remote.byte(req.addr + i))
                    .collect();
                merge_masked(&mut current, &req.data, req.first_mask, req.last_mask);
                for (i, byte) in current.into_iter().enumerate() {
                    remote.written.insert(req.addr + i as u64, byte);
                }
                Ok(Reply::Ack)
            }
            other => panic!("unexpected request {other:?}"),
        }
    }
}

fn session(max_transfer: usize) -> (BrokerSession, Arc<Mutex<Remote>>) {
    let remote = Arc::new(Mutex::new(Remote::default()));
    let broker = MemoryBroker {
        max_transfer,
        remote: remote.clone(),
    };
    (BrokerSession::connect(Box::new(broker), 100).unwrap(), remote)
}

fn arb_max_transfer() -> impl Strategy<Value = usize> {
    prop_oneof![Just(4usize), Just(8), Just(12), Just(64), Just(1024)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn write_then_read_round_trips(
        addr in 0x1000u64..0x2000,
        data in proptest::collection::vec(any::<u8>(), 1..300),
        max_transfer in arb_max_transfer(),
    ) {
        let (session, remote) = session(max_transfer);
        let written = write_memory(&session, PROCESS, addr, &data).unwrap();
        prop_assert_eq!(written, data.len());

        let mut back = vec![0u8; data.len()];
        let read = read_memory(&session, PROCESS, addr, &mut back).unwrap();
        prop_assert_eq!(read, data.len());
        prop_assert_eq!(&back, &data);

        let remote = remote.lock().unwrap();
        for edge in [addr - 1, addr - 2, addr + data.len() as u64, addr + data.len() as u64 + 1] {
            prop_assert_eq!(remote.byte(edge), background(edge), "byte at {:#x} clobbered", edge);
        }
    }

    /// The number of round trips is the number of limit-sized chunks needed
    /// to cover the aligned span.
    #[test]
    fn round_trips_match_chunking(
        addr in 0x1000u64..0x2000,
        len in 1usize..300,
        max_transfer in arb_max_transfer(),
    ) {
        let (session, remote) = session(max_transfer);
        let mut buf = vec![0u8; len];
        read_memory(&session, PROCESS, addr, &mut buf).unwrap();

        let start = addr - addr % WORD_SIZE as u64;
        let end = (addr + len as u64).div_ceil(WORD_SIZE as u64) * WORD_SIZE as u64;
        let span = (end - start) as usize;
        let chunk = max_transfer - max_transfer % WORD_SIZE;
        prop_assert_eq!(remote.lock().unwrap().requests, span.div_ceil(chunk));

        let expected: Vec<u8> = (0..len as u64).map(|i| background(addr + i)).collect();
        prop_assert_eq!(buf, expected);
    }

    /// A refused chunk anywhere makes the whole call fail.
    #[test]
    fn failing_chunk_fails_call(
        addr in 0x1000u64..0x2000,
        len in 9usize..200,
        pick in any::<prop::sample::Index>(),
    ) {
        let (session, remote) = session(8);
        let start = addr - addr % WORD_SIZE as u64;
        let end = addr + len as u64;
        let chunks: Vec<u64> = (start..end).step_by(8).collect();
        let failing = chunks[pick.index(chunks.len())];
        remote.lock().unwrap().fail_at = Some(failing);

        let mut buf = vec![0u8; len];
        let err = read_memory(&session, PROCESS, addr, &mut buf).unwrap_err();
        let is_partial_copy = matches!(
            err,
            GuestProcError::MemoryAccess { addr, status: BrokerStatus::PartialCopy }
                if addr == failing
        );
        prop_assert!(is_partial_copy);

        let data = vec![0xAAu8; len];
        let err = write_memory(&session, PROCESS, addr, &data).unwrap_err();
        let is_access_denied = matches!(
            err,
            GuestProcError::MemoryAccess { status: BrokerStatus::AccessDenied, .. }
        );
        prop_assert!(is_access_denied);
    }
}

#[test]
fn zero_length_write_never_reaches_broker() {
    let (session, remote) = session(1024);
    let err = write_memory(&session, PROCESS, 0x1001, &[]).unwrap_err();
    assert!(matches!(err, GuestProcError::InvalidParameter(_)));
    assert_eq!(remote.lock().unwrap().requests, 0);
}

#[test]
fn zero_length_read_checks_access_once() {
    let (session, remote) = session(1024);
    let mut buf = [0u8; 0];
    assert_eq!(read_memory(&session, PROCESS, 0x1003, &mut buf).unwrap(), 0);
    assert_eq!(remote.lock().unwrap().requests, 1);
}

#[test]
fn single_unaligned_byte_keeps_neighbours() {
    let (session, remote) = session(1024);
    write_memory(&session, PROCESS, 0x1001, &[0x5A]).unwrap();
    let remote = remote.lock().unwrap();
    assert_eq!(remote.byte(0x1001), 0x5A);
    for addr in [0x1000, 0x1002, 0x1003] {
        assert_eq!(remote.byte(addr), background(addr));
    }
}
