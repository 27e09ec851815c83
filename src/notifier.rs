// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// "Producer posted, wake the consumer" signal for the ring buffer. Five
// interchangeable backends, selected by `NotifierKind` and host capability.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::platform::posix::EventFd;
use crate::{IpcCondition, IpcMutex, IpcSemaphore};

/// Which notifier backend a ring buffer should use. `EventFdPair` is
/// Linux-only; attempting to select it elsewhere falls back to
/// `PosixSemPshared`, and if that probes as unsupported, to `PosixSemRpl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierKind {
    /// No signaling at all; `timedwait` always returns immediately.
    None,
    /// A pair of Linux eventfds, one per direction.
    EventFdPair,
    /// A process-shared POSIX semaphore (`sem_open`).
    PosixSemPshared,
    /// `IpcCondition` + `IpcMutex` + a counter in shared memory.
    PosixSemRpl,
    /// SysV semaphore (`semget`/`semop`).
    SysV,
}

/// A process-shared wakeup channel coupling a ring buffer's writer to its
/// reader.
pub enum Notifier {
    None,
    #[cfg(target_os = "linux")]
    EventFdPair {
        write_fd: Arc<EventFd>,
        read_fd: Arc<EventFd>,
        space_used: AtomicI64,
    },
    PosixSem(IpcSemaphore),
    PosixCond {
        mtx: IpcMutex,
        cond: IpcCondition,
        counter: Arc<AtomicI64>,
    },
    SysV(SysVSem),
}

impl Notifier {
    /// Create a new notifier of the requested kind, named after the ring
    /// buffer it belongs to.
    pub fn create(name: &str, kind: NotifierKind) -> io::Result<Self> {
        match kind {
            NotifierKind::None => Ok(Notifier::None),
            #[cfg(target_os = "linux")]
            NotifierKind::EventFdPair => Ok(Notifier::EventFdPair {
                write_fd: Arc::new(EventFd::new()?),
                read_fd: Arc::new(EventFd::new()?),
                space_used: AtomicI64::new(0),
            }),
            #[cfg(not(target_os = "linux"))]
            NotifierKind::EventFdPair => Self::create(name, NotifierKind::PosixSemPshared),
            NotifierKind::PosixSemPshared => {
                let sem = IpcSemaphore::open(name, 0)?;
                Ok(Notifier::PosixSem(sem))
            }
            NotifierKind::PosixSemRpl => {
                let mtx = IpcMutex::open(&format!("{name}-m"))?;
                let cond = IpcCondition::open(&format!("{name}-c"))?;
                Ok(Notifier::PosixCond {
                    mtx,
                    cond,
                    counter: Arc::new(AtomicI64::new(0)),
                })
            }
            NotifierKind::SysV => Ok(Notifier::SysV(SysVSem::open(name)?)),
        }
    }

    /// Post `n` available chunks, waking any waiter.
    pub fn post(&self, n: u32) -> io::Result<()> {
        match self {
            Notifier::None => Ok(()),
            #[cfg(target_os = "linux")]
            Notifier::EventFdPair {
                write_fd,
                space_used,
                ..
            } => {
                write_fd.post(n as u64)?;
                space_used.fetch_add(n as i64, Ordering::AcqRel);
                Ok(())
            }
            Notifier::PosixSem(sem) => sem.post(n),
            Notifier::PosixCond { mtx, cond, counter } => {
                mtx.lock()?;
                counter.fetch_add(n as i64, Ordering::AcqRel);
                let res = cond.broadcast();
                mtx.unlock()?;
                res
            }
            Notifier::SysV(sem) => sem.post(n),
        }
    }

    /// Wait for at least one posted chunk. `None` blocks indefinitely,
    /// `Some(0)` polls, `Some(ms)` is a relative timeout in milliseconds.
    /// Returns `Ok(true)` if a chunk is available, `Ok(false)` on timeout.
    pub fn timedwait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        match self {
            Notifier::None => Ok(true),
            #[cfg(target_os = "linux")]
            Notifier::EventFdPair { write_fd, .. } => {
                let ms = timeout_ms.map(|v| v as i64);
                Ok(write_fd.timedwait(ms)?.is_some())
            }
            Notifier::PosixSem(sem) => sem.wait(timeout_ms),
            Notifier::PosixCond { mtx, cond, counter } => {
                mtx.lock()?;
                loop {
                    if counter.load(Ordering::Acquire) > 0 {
                        counter.fetch_sub(1, Ordering::AcqRel);
                        mtx.unlock()?;
                        return Ok(true);
                    }
                    let signalled = cond.wait(mtx, timeout_ms)?;
                    if !signalled {
                        mtx.unlock()?;
                        return Ok(false);
                    }
                }
            }
            Notifier::SysV(sem) => sem.timedwait(timeout_ms),
        }
    }

    /// Current count of chunks the reader has not yet consumed.
    pub fn chunks_used(&self) -> io::Result<i64> {
        match self {
            Notifier::None => Ok(0),
            #[cfg(target_os = "linux")]
            Notifier::EventFdPair { space_used, .. } => {
                Ok(space_used.load(Ordering::Acquire))
            }
            Notifier::PosixSem(sem) => Ok(sem.value()? as i64),
            Notifier::PosixCond { counter, .. } => Ok(counter.load(Ordering::Acquire)),
            Notifier::SysV(sem) => sem.getval(),
        }
    }

    /// The raw eventfd pair, for the SHM transport to pass across the setup
    /// socket via `SCM_RIGHTS`. `None` for every other variant.
    #[cfg(target_os = "linux")]
    pub fn eventfd_pair(&self) -> Option<(i32, i32)> {
        match self {
            Notifier::EventFdPair {
                write_fd, read_fd, ..
            } => Some((write_fd.as_raw_fd(), read_fd.as_raw_fd())),
            _ => None,
        }
    }

    /// The fd to register with the event loop for readiness-driven wakeup,
    /// if this variant has one. `None` for the semaphore/SysV variants,
    /// which the IPC transport instead polls from a recurring low-priority
    /// job (§9's `needs_sock_for_poll` fallback).
    #[cfg(target_os = "linux")]
    pub fn raw_fd(&self) -> Option<i32> {
        match self {
            Notifier::EventFdPair { write_fd, .. } => Some(write_fd.as_raw_fd()),
            _ => None,
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn raw_fd(&self) -> Option<i32> {
        None
    }

    /// Reconstruct an `EventFdPair` notifier from descriptors received over
    /// `SCM_RIGHTS` (the connecting side of the SHM transport's setup
    /// handshake, §4.3/§4.5 — eventfds have no name a second process could
    /// open independently, so the fds themselves have to be the handshake
    /// payload). `write_fd`/`read_fd` are the same descriptors (new fd
    /// numbers, same underlying eventfd objects) the accepting side's own
    /// pair refers to, in the same order.
    #[cfg(target_os = "linux")]
    pub fn from_eventfd_pair(write_fd: i32, read_fd: i32) -> Self {
        Notifier::EventFdPair {
            write_fd: Arc::new(unsafe { EventFd::from_raw_fd(write_fd) }),
            read_fd: Arc::new(unsafe { EventFd::from_raw_fd(read_fd) }),
            space_used: AtomicI64::new(0),
        }
    }
}

// ---------------------------------------------------------------------------
// SysV semaphore — selectable explicitly for interoperability, never
// auto-selected.
// ---------------------------------------------------------------------------

pub struct SysVSem {
    id: libc::c_int,
    owner: bool,
}

impl SysVSem {
    fn open(name: &str) -> io::Result<Self> {
        let key = crate::shm_name::fnv1a_64(name.as_bytes()) as libc::key_t;
        let id = unsafe { libc::semget(key, 1, 0o666 | libc::IPC_CREAT) };
        if id == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { id, owner: true })
    }

    fn post(&self, n: u32) -> io::Result<()> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: n as i16,
            sem_flg: 0,
        };
        let rc = unsafe { libc::semop(self.id, &mut op, 1) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn timedwait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: -1,
            sem_flg: 0,
        };
        match timeout_ms {
            None => loop {
                let rc = unsafe { libc::semop(self.id, &mut op, 1) };
                if rc == 0 {
                    return Ok(true);
                }
                let e = io::Error::last_os_error();
                if e.raw_os_error() != Some(libc::EINTR) {
                    return Err(e);
                }
            },
            Some(ms) => {
                let ts = libc::timespec {
                    tv_sec: (ms / 1000) as libc::time_t,
                    tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
                };
                loop {
                    let rc = unsafe { libc::semtimedop(self.id, &mut op, 1, &ts) };
                    if rc == 0 {
                        return Ok(true);
                    }
                    let e = io::Error::last_os_error();
                    match e.raw_os_error() {
                        Some(libc::EAGAIN) => return Ok(false),
                        Some(libc::EINTR) => continue,
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    fn getval(&self) -> io::Result<i64> {
        let rc = unsafe { libc::semctl(self.id, 0, libc::GETVAL) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as i64)
    }
}

impl Drop for SysVSem {
    fn drop(&mut self) {
        if self.owner {
            unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        }
    }
}
