//! Chunked access to another process's address space.
//!
//! The broker only moves whole, aligned words and at most
//! [`BrokerSession::max_transfer`] bytes per request. An arbitrary byte
//! range is therefore cut into a sequence of [`MemoryWindow`]s; writes carry
//! byte masks so the words straddling the range edges keep their bytes
//! outside the range.

use crate::broker::BrokerSession;
use crate::error::GuestProcError;
use crate::protocol::{BrokerStatus, Handle, WriteMemoryRequest, WORD_SIZE};

/// Mask selecting every byte of a word.
pub const ALL_BYTES: u32 = u32::MAX;

const WORD: u64 = WORD_SIZE as u64;

/// One broker round trip of a memory transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryWindow {
    /// Word-aligned remote address of the chunk.
    pub addr: u64,
    pub words: u32,
    /// Leading chunk bytes that precede the caller's range.
    pub skip: usize,
    /// Caller bytes covered by this chunk.
    pub take: usize,
    pub first_mask: u32,
    pub last_mask: u32,
}

impl MemoryWindow {
    pub fn byte_len(&self) -> usize {
        self.words as usize * WORD_SIZE
    }
}

/// Iterator over the windows covering `[addr, addr + len)`.
#[derive(Clone, Debug)]
pub struct Windows {
    pos: u64,
    offset: usize,
    done: usize,
    len: usize,
    max: usize,
    first_mask: u32,
    last_mask: u32,
}

/// Plan the transfer of `len` bytes at `addr` in chunks of at most
/// `max_transfer` bytes.
pub fn plan(addr: u64, len: usize, max_transfer: usize) -> Windows {
    let offset = (addr % WORD) as usize;
    let last_offset = (offset + len) % WORD_SIZE;
    Windows {
        pos: addr - offset as u64,
        offset,
        done: 0,
        len,
        max: chunk_limit(max_transfer),
        first_mask: leading_mask(offset),
        last_mask: trailing_mask(last_offset),
    }
}

impl Iterator for Windows {
    type Item = MemoryWindow;

    fn next(&mut self) -> Option<MemoryWindow> {
        if self.done >= self.len {
            return None;
        }
        let remaining = self.offset + (self.len - self.done);
        let chunk = round_up(remaining).min(self.max);
        let take = (chunk - self.offset).min(self.len - self.done);
        let first = self.done == 0;
        let last = self.done + take == self.len;

        let window = MemoryWindow {
            addr: self.pos,
            words: (chunk / WORD_SIZE) as u32,
            skip: self.offset,
            take,
            first_mask: if first { self.first_mask } else { ALL_BYTES },
            last_mask: if last { self.last_mask } else { ALL_BYTES },
        };

        self.done += take;
        self.pos = self.pos.wrapping_add(chunk as u64);
        self.offset = 0;
        Some(window)
    }
}

/// Largest whole-word payload not above `max_transfer`, never below one word.
pub fn chunk_limit(max_transfer: usize) -> usize {
    (max_transfer / WORD_SIZE * WORD_SIZE).max(WORD_SIZE)
}

fn round_up(bytes: usize) -> usize {
    bytes.div_ceil(WORD_SIZE) * WORD_SIZE
}

/// Mask for the first word: the `offset` bytes before the range are excluded.
pub fn leading_mask(offset: usize) -> u32 {
    let mut bytes = [0xFFu8; WORD_SIZE];
    for byte in bytes.iter_mut().take(offset) {
        *byte = 0;
    }
    u32::from_ne_bytes(bytes)
}

/// Mask for the last word: only its first `last_offset` bytes belong to the
/// range, or all of them when the range ends on a word boundary.
pub fn trailing_mask(last_offset: usize) -> u32 {
    let used = if last_offset == 0 { WORD_SIZE } else { last_offset };
    let mut bytes = [0u8; WORD_SIZE];
    for byte in bytes.iter_mut().take(used) {
        *byte = 0xFF;
    }
    u32::from_ne_bytes(bytes)
}

/// Read `buf.len()` bytes at `addr` in `process` into `buf`.
///
/// Returns the number of bytes read, always `buf.len()`. A zero-length read
/// still performs one round trip so access rights are checked. If any chunk
/// fails the call fails as a whole, even though earlier chunks may already
/// have been copied into `buf`.
pub fn read_memory(
    session: &BrokerSession,
    process: Handle,
    addr: u64,
    buf: &mut [u8],
) -> Result<usize, GuestProcError> {
    if buf.is_empty() {
        let aligned = addr - addr % WORD;
        session
            .read_words(process, aligned, 0)
            .map_err(|status| GuestProcError::MemoryAccess { addr, status })?;
        return Ok(0);
    }

    let mut copied = 0;
    for window in plan(addr, buf.len(), session.max_transfer()) {
        let data = session
            .read_words(process, window.addr, window.words)
            .map_err(|status| GuestProcError::MemoryAccess {
                addr: window.addr,
                status,
            })?;
        if data.len() != window.byte_len() {
            log::warn!(
                "[memory] read at {:#x}: asked for {} bytes, got {}",
                window.addr,
                window.byte_len(),
                data.len()
            );
            return Err(GuestProcError::MemoryAccess {
                addr: window.addr,
                status: BrokerStatus::Protocol,
            });
        }
        buf[copied..copied + window.take]
            .copy_from_slice(&data[window.skip..window.skip + window.take]);
        copied += window.take;
    }
    Ok(copied)
}

/// Write `data` to `addr` in `process`.
///
/// Zero-length writes are rejected without contacting the broker. If any
/// chunk fails the call fails as a whole; earlier chunks stay written.
pub fn write_memory(
    session: &BrokerSession,
    process: Handle,
    addr: u64,
    data: &[u8],
) -> Result<usize, GuestProcError> {
    if data.is_empty() {
        return Err(GuestProcError::InvalidParameter("zero-length memory write"));
    }

    let mut written = 0;
    for window in plan(addr, data.len(), session.max_transfer()) {
        let mut payload = vec![0u8; window.byte_len()];
        payload[window.skip..window.skip + window.take]
            .copy_from_slice(&data[written..written + window.take]);
        session
            .write_words(WriteMemoryRequest {
                handle: process,
                addr: window.addr,
                first_mask: window.first_mask,
                last_mask: window.last_mask,
                data: payload,
            })
            .map_err(|status| GuestProcError::MemoryAccess {
                addr: window.addr,
                status,
            })?;
        written += window.take;
    }
    Ok(written)
}

/// Merge `data` into `target` word by word under the write masks.
///
/// `first_mask` applies to word 0 and `last_mask` to the final word; a
/// single-word payload gets both. Interior words are copied whole.
pub fn merge_masked(target: &mut [u8], data: &[u8], first_mask: u32, last_mask: u32) {
    let words = data.len() / WORD_SIZE;
    for (index, (dst, src)) in target
        .chunks_exact_mut(WORD_SIZE)
        .zip(data.chunks_exact(WORD_SIZE))
        .enumerate()
    {
        let mut mask = ALL_BYTES;
        if index == 0 {
            mask &= first_mask;
        }
        if index + 1 == words {
            mask &= last_mask;
        }
        for ((d, s), m) in dst.iter_mut().zip(src).zip(mask.to_ne_bytes()) {
            if m != 0 {
                *d = *s;
            }
        }
    }
}
