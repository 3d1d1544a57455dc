//! Access to host processes on behalf of broker clients.

use std::io::{IoSlice, IoSliceMut};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;

use guestproc::protocol::BrokerStatus;

/// Operations the registry performs on real host processes.
pub trait HostBackend: Send + Sync {
    fn read(&self, host_pid: u32, addr: u64, len: usize) -> Result<Vec<u8>, BrokerStatus>;

    fn write(&self, host_pid: u32, addr: u64, data: &[u8]) -> Result<(), BrokerStatus>;

    /// Kill the host process. Best effort.
    fn terminate(&self, host_pid: u32);
}

/// [`HostBackend`] using `process_vm_readv`/`process_vm_writev`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxHost;

fn remote(addr: u64, len: usize) -> Result<RemoteIoVec, BrokerStatus> {
    let base = usize::try_from(addr).map_err(|_| BrokerStatus::InvalidParameter)?;
    Ok(RemoteIoVec { base, len })
}

fn status_of(errno: Errno) -> BrokerStatus {
    match errno {
        Errno::ESRCH => BrokerStatus::NotFound,
        Errno::EFAULT => BrokerStatus::PartialCopy,
        Errno::ENOMEM => BrokerStatus::NoMemory,
        Errno::EINVAL => BrokerStatus::InvalidParameter,
        _ => BrokerStatus::AccessDenied,
    }
}

impl HostBackend for LinuxHost {
    fn read(&self, host_pid: u32, addr: u64, len: usize) -> Result<Vec<u8>, BrokerStatus> {
        let mut buf = vec![0u8; len];
        let copied = process_vm_readv(
            Pid::from_raw(host_pid as i32),
            &mut [IoSliceMut::new(&mut buf)],
            &[remote(addr, len)?],
        )
        .map_err(status_of)?;
        if copied != len {
            return Err(BrokerStatus::PartialCopy);
        }
        Ok(buf)
    }

    fn write(&self, host_pid: u32, addr: u64, data: &[u8]) -> Result<(), BrokerStatus> {
        let copied = process_vm_writev(
            Pid::from_raw(host_pid as i32),
            &[IoSlice::new(data)],
            &[remote(addr, data.len())?],
        )
        .map_err(status_of)?;
        if copied != data.len() {
            return Err(BrokerStatus::PartialCopy);
        }
        Ok(())
    }

    fn terminate(&self, host_pid: u32) {
        if let Err(e) = kill(Pid::from_raw(host_pid as i32), Signal::SIGKILL) {
            log::debug!("[broker] kill({host_pid}) failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_own_memory() {
        let value: [u8; 8] = *b"guestmem";
        let host = LinuxHost;
        let data = host
            .read(std::process::id(), value.as_ptr() as u64, value.len())
            .unwrap();
        assert_eq!(data, value);
    }

    #[test]
    fn writes_own_memory() {
        let mut target = [0u8; 4];
        let host = LinuxHost;
        host.write(std::process::id(), target.as_mut_ptr() as u64, b"abcd")
            .unwrap();
        assert_eq!(std::hint::black_box(target), *b"abcd");
    }

    #[test]
    fn unmapped_address_fails() {
        let host = LinuxHost;
        assert!(host.read(std::process::id(), 8, 4).is_err());
    }
}
