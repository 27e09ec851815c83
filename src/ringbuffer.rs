// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-producer/single-consumer, chunk-granular FIFO backed by a doubly
// mapped shared-memory region (see `crate::sms`). A chunk is two header
// words — `size` (bytes, zero while uncommitted) then `CHUNK_MAGIC` — followed
// by the payload. The writer publishes the magic word before the size word;
// a reader only trusts a chunk once both match.

use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error;
use crate::notifier::{Notifier, NotifierKind};
use crate::platform::posix::{PlatformShm, ShmMode};
use crate::sms::Sms;

const CHUNK_HEADER_WORDS: usize = 2;
const CHUNK_MAGIC: u32 = 0xAAAA_AAAA;
/// Gap reserved when checking for free space: header words plus one extra
/// word to allow for non-word-sized payloads.
const CHUNK_MARGIN_WORDS: usize = CHUNK_HEADER_WORDS + 1;

/// Behavior flags for `RingBuffer::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbFlags(pub u32);

impl RbFlags {
    /// This call is creating (not just attaching to) the segment.
    pub const CREATE: RbFlags = RbFlags(1 << 0);
    /// When full, reclaim the oldest chunk instead of failing with `EAGAIN`.
    pub const OVERWRITE: RbFlags = RbFlags(1 << 1);

    pub fn contains(&self, other: RbFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for RbFlags {
    type Output = RbFlags;
    fn bitor(self, rhs: RbFlags) -> RbFlags {
        RbFlags(self.0 | rhs.0)
    }
}

#[repr(C)]
struct RbHeader {
    write_pt: AtomicU32,
    read_pt: AtomicU32,
    word_size: AtomicU32,
    _reserved: u32,
}

/// A cross-process chunk ring buffer.
pub struct RingBuffer {
    header: PlatformShm,
    data: Sms,
    notifier: Notifier,
    flags: RbFlags,
    owner: bool,
}

impl RingBuffer {
    /// Create or attach to a named ring buffer of at least `bytes` capacity.
    pub fn open(
        name: &str,
        bytes: usize,
        flags: RbFlags,
        notifier_kind: NotifierKind,
    ) -> io::Result<Self> {
        Self::open_with_user_data(name, bytes, flags, notifier_kind, 0)
    }

    /// Like `open`, but reserves `user_data_bytes` immediately after the
    /// header for caller-defined state (e.g. the SHM transport's
    /// per-direction flow-control word, §4.5).
    pub fn open_with_user_data(
        name: &str,
        bytes: usize,
        flags: RbFlags,
        notifier_kind: NotifierKind,
        user_data_bytes: usize,
    ) -> io::Result<Self> {
        let (header, data, owner) = Self::open_segments(name, bytes, flags, user_data_bytes)?;
        let notifier = Notifier::create(&format!("{name}-notif"), notifier_kind)?;
        Ok(Self {
            header,
            data,
            notifier,
            flags,
            owner,
        })
    }

    /// Like `open_with_user_data`, but takes an already-constructed
    /// `Notifier` instead of building one by name. Used by the SHM IPC
    /// transport for the eventfd-pair variant, whose two eventfds aren't
    /// nameable — the owning side builds the `Notifier` itself and the peer
    /// reconstructs an equivalent one from fds received via `SCM_RIGHTS`
    /// (see `crate::ipc::transport::shm`).
    pub fn open_with_notifier(
        name: &str,
        bytes: usize,
        flags: RbFlags,
        user_data_bytes: usize,
        notifier: Notifier,
    ) -> io::Result<Self> {
        let (header, data, owner) = Self::open_segments(name, bytes, flags, user_data_bytes)?;
        Ok(Self {
            header,
            data,
            notifier,
            flags,
            owner,
        })
    }

    fn open_segments(
        name: &str,
        bytes: usize,
        flags: RbFlags,
        user_data_bytes: usize,
    ) -> io::Result<(PlatformShm, Sms, bool)> {
        let owner = flags.contains(RbFlags::CREATE);
        let mode = if owner {
            ShmMode::Create
        } else {
            ShmMode::Open
        };

        let header = PlatformShm::acquire(
            &format!("{name}-hdr"),
            size_of::<RbHeader>() + user_data_bytes,
            mode,
        )?;

        let hdr = header.as_mut_ptr() as *const RbHeader;

        let word_size = if owner {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            let real_bytes = ((bytes + page_size - 1) / page_size) * page_size;
            let word_size = (real_bytes / 4) as u32;
            unsafe {
                (*hdr).write_pt.store(0, Ordering::Relaxed);
                (*hdr).read_pt.store(0, Ordering::Relaxed);
                (*hdr).word_size.store(word_size, Ordering::Relaxed);
            }
            word_size
        } else {
            unsafe { (*hdr).word_size.load(Ordering::Relaxed) }
        };

        let data = if owner {
            Sms::create(&format!("{name}-data"), word_size as usize * 4)?
        } else {
            Sms::open(&format!("{name}-data"), word_size as usize * 4)?
        };

        Ok((header, data, owner))
    }

    /// The ring's notifier, for callers (the IPC SHM transport) that need
    /// its raw fd for event-loop registration.
    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    fn hdr(&self) -> &RbHeader {
        unsafe { &*(self.header.as_mut_ptr() as *const RbHeader) }
    }

    /// Pointer to the caller-defined region reserved via
    /// `open_with_user_data`, immediately following the header fields.
    pub fn user_data_ptr(&self) -> *mut u8 {
        unsafe { (self.header.as_mut_ptr() as *mut u8).add(size_of::<RbHeader>()) }
    }

    fn word_size(&self) -> usize {
        self.hdr().word_size.load(Ordering::Relaxed) as usize
    }

    fn data_words(&self) -> *mut u32 {
        self.data.as_mut_ptr() as *mut u32
    }

    fn idx_step(&self, idx: u32) -> u32 {
        let ws = self.word_size() as u32;
        if idx > ws - 1 {
            idx % ws
        } else {
            idx
        }
    }

    fn word_at(&self, idx: u32) -> u32 {
        unsafe { std::ptr::read_volatile(self.data_words().add(idx as usize)) }
    }

    fn set_word_at(&self, idx: u32, val: u32) {
        unsafe { std::ptr::write_volatile(self.data_words().add(idx as usize), val) };
    }

    /// Bytes of free space, leaving the reserved margin out of the count.
    pub fn space_free(&self) -> usize {
        let ws = self.word_size() as u32;
        let w = self.hdr().write_pt.load(Ordering::Acquire);
        let r = self.hdr().read_pt.load(Ordering::Acquire);
        let words = if w > r {
            (r.wrapping_sub(w).wrapping_add(ws)) - 1
        } else if w < r {
            (r - w) - 1
        } else {
            ws
        };
        words as usize * 4
    }

    /// Bytes currently occupied by committed and uncommitted chunks.
    pub fn space_used(&self) -> usize {
        let ws = self.word_size() as u32;
        let w = self.hdr().write_pt.load(Ordering::Acquire);
        let r = self.hdr().read_pt.load(Ordering::Acquire);
        let words = if w > r {
            w - r
        } else if w < r {
            (w.wrapping_sub(r).wrapping_add(ws)) - 1
        } else {
            0
        };
        words as usize * 4
    }

    /// Number of whole committed chunks between `read_pt` and `write_pt`,
    /// counted by walking the ring rather than asking the notifier: the
    /// notifier's own posted-count bookkeeping is local to whichever
    /// process last posted to it, so it can't answer "how many chunks are
    /// queued" for a *different* process's reader the way the shared
    /// `read_pt`/`write_pt` header words can.
    pub fn chunks_used(&self) -> io::Result<i64> {
        let write_pt = self.hdr().write_pt.load(Ordering::Acquire);
        let mut read_pt = self.hdr().read_pt.load(Ordering::Acquire);
        let mut count: i64 = 0;
        while read_pt != write_pt {
            let size = self.word_at(read_pt);
            let magic = self.word_at(self.idx_step(read_pt + 1));
            if magic != CHUNK_MAGIC {
                break;
            }
            read_pt = self.chunk_step(read_pt, size);
            count += 1;
        }
        Ok(count)
    }

    /// Reserve space for a `len`-byte chunk and return a pointer to its
    /// payload region. In `OVERWRITE` mode, reclaims the oldest chunk(s)
    /// until there is room; otherwise fails with `EAGAIN`.
    pub fn chunk_alloc(&self, len: usize) -> io::Result<*mut u8> {
        let needed = len + CHUNK_MARGIN_WORDS * 4;
        if self.flags.contains(RbFlags::OVERWRITE) {
            while self.space_free() < needed {
                if !self.chunk_reclaim() {
                    break;
                }
            }
        } else if self.space_free() < needed {
            return Err(error::would_block());
        }

        let mut write_pt = self.hdr().write_pt.load(Ordering::Relaxed);
        self.set_word_at(write_pt, 0);
        write_pt = self.idx_step(write_pt + 1);
        self.set_word_at(write_pt, CHUNK_MAGIC);
        write_pt = self.idx_step(write_pt + 1);

        Ok(unsafe { self.data_words().add(write_pt as usize) as *mut u8 })
    }

    /// Commit the chunk most recently returned by `chunk_alloc`, of `len`
    /// bytes, and post the notifier.
    pub fn chunk_commit(&self, len: usize) -> io::Result<()> {
        let old_write_pt = self.hdr().write_pt.load(Ordering::Relaxed);
        self.set_word_at(old_write_pt, len as u32);
        self.set_word_at(self.idx_step(old_write_pt + 1), CHUNK_MAGIC);

        let new_write_pt = self.chunk_step(old_write_pt, len as u32);
        self.hdr().write_pt.store(new_write_pt, Ordering::Release);

        self.notifier.post(1)
    }

    /// `chunk_alloc` + copy + `chunk_commit`.
    pub fn chunk_write(&self, buf: &[u8]) -> io::Result<usize> {
        let dest = self.chunk_alloc(buf.len())?;
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), dest, buf.len()) };
        self.chunk_commit(buf.len())?;
        Ok(buf.len())
    }

    fn chunk_step(&self, pointer: u32, chunk_size: u32) -> u32 {
        let mut p = pointer + CHUNK_HEADER_WORDS as u32;
        p = self.idx_step(p);
        p += chunk_size / 4;
        if chunk_size % 4 != 0 {
            p += 1;
        }
        self.idx_step(p)
    }

    /// Wait up to `timeout_ms` for a chunk, then return its size and a
    /// pointer to its payload without consuming it. `ENOMSG` if the magic
    /// word doesn't match (reader caught up to an uncommitted chunk).
    pub fn chunk_peek(&self, timeout_ms: Option<u64>) -> io::Result<(usize, *const u8)> {
        if !self.notifier.timedwait(timeout_ms)? {
            return Err(error::timed_out());
        }
        let read_pt = self.hdr().read_pt.load(Ordering::Acquire);
        let size = self.word_at(read_pt);
        let magic = self.word_at(self.idx_step(read_pt + 1));
        let payload = unsafe {
            self.data_words()
                .add(self.idx_step(read_pt + CHUNK_HEADER_WORDS as u32) as usize) as *const u8
        };
        if magic != CHUNK_MAGIC {
            return Err(io::Error::from_raw_os_error(libc::ENOMSG));
        }
        Ok((size as usize, payload))
    }

    /// `chunk_peek` + copy into `buf` + `chunk_reclaim`. `ENOBUFS` if `buf`
    /// is smaller than the chunk.
    pub fn chunk_read(&self, buf: &mut [u8], timeout_ms: Option<u64>) -> io::Result<usize> {
        let (size, payload) = self.chunk_peek(timeout_ms)?;
        if buf.len() < size {
            return Err(error::too_small());
        }
        unsafe { std::ptr::copy_nonoverlapping(payload, buf.as_mut_ptr(), size) };
        self.chunk_reclaim();
        Ok(size)
    }

    /// Advance `read_pt` past the chunk at the current read position,
    /// zeroing its header. Returns `false` if there was nothing to reclaim.
    pub fn chunk_reclaim(&self) -> bool {
        if self.space_used() == 0 {
            return false;
        }
        let old_read_pt = self.hdr().read_pt.load(Ordering::Relaxed);
        let size = self.word_at(old_read_pt);
        let magic = self.word_at(self.idx_step(old_read_pt + 1));
        debug_assert_eq!(magic, CHUNK_MAGIC, "ring buffer chunk magic mismatch");

        let new_read_pt = self.chunk_step(old_read_pt, size);
        self.hdr().read_pt.store(new_read_pt, Ordering::Release);

        self.set_word_at(old_read_pt, 0);
        self.set_word_at(self.idx_step(old_read_pt + 1), 0);
        true
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if self.owner {
            self.header.unlink();
            self.data.unlink();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_rb(tag: &str, overwrite: bool) -> RingBuffer {
        let name = format!("qb-rb-test-{tag}-{}", std::process::id());
        let mut flags = RbFlags::CREATE;
        if overwrite {
            flags = flags | RbFlags::OVERWRITE;
        }
        RingBuffer::open(&name, 4096, flags, NotifierKind::PosixSemRpl).unwrap()
    }

    #[test]
    fn fifo_roundtrip() {
        let rb = open_test_rb("fifo", false);
        rb.chunk_write(b"hello").unwrap();
        rb.chunk_write(b"world").unwrap();

        let mut buf = [0u8; 64];
        let n = rb.chunk_read(&mut buf, Some(0)).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = rb.chunk_read(&mut buf, Some(0)).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn empty_read_times_out() {
        let rb = open_test_rb("empty", false);
        let mut buf = [0u8; 16];
        let err = rb.chunk_read(&mut buf, Some(0)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    }

    #[test]
    fn full_without_overwrite_fails_eagain() {
        let rb = open_test_rb("full", false);
        let chunk = vec![1u8; 256];
        let mut wrote = 0;
        loop {
            match rb.chunk_write(&chunk) {
                Ok(_) => wrote += 1,
                Err(e) => {
                    assert_eq!(e.raw_os_error(), Some(libc::EAGAIN));
                    break;
                }
            }
            assert!(wrote < 1000, "ring buffer never reported EAGAIN");
        }
    }

    #[test]
    fn overwrite_reclaims_oldest() {
        let rb = open_test_rb("overwrite", true);
        let chunk = vec![2u8; 256];
        for _ in 0..64 {
            rb.chunk_write(&chunk).unwrap();
        }
        let mut buf = [0u8; 256];
        let n = rb.chunk_read(&mut buf, Some(0)).unwrap();
        assert_eq!(n, 256);
    }
}
