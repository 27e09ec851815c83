// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named POSIX semaphore (sem_open family). Backs the "posix-sem (pshared)"
// notifier variant. The donor crate's Windows condition-variable emulation
// and its own `tests/test_semaphore.rs` both reference a `libipc::IpcSemaphore`
// type that the donor crate never actually defines; this module supplies it.

use std::ffi::CString;
use std::io;

use crate::shm_name;

/// A named, inter-process counting semaphore.
pub struct IpcSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

// Safety: sem_t is designed for concurrent cross-process access.
unsafe impl Send for IpcSemaphore {}
unsafe impl Sync for IpcSemaphore {}

impl IpcSemaphore {
    /// Open (or create) a named semaphore with the given initial count.
    pub fn open(name: &str, initial: u32) -> io::Result<Self> {
        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o666u32 as libc::mode_t,
                initial,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            sem: sem as *mut libc::sem_t,
            name: posix_name,
        })
    }

    /// Increment the semaphore by `n`.
    pub fn post(&self, n: u32) -> io::Result<()> {
        for _ in 0..n.max(1) {
            let rc = unsafe { libc::sem_post(self.sem) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Wait for the semaphore to become available. `None` blocks
    /// indefinitely; `Some(0)` is a non-blocking poll; any other value is a
    /// relative timeout in milliseconds. Returns `Ok(true)` if the
    /// semaphore was decremented, `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        match timeout_ms {
            None => loop {
                let rc = unsafe { libc::sem_wait(self.sem) };
                if rc == 0 {
                    return Ok(true);
                }
                let e = io::Error::last_os_error();
                if e.raw_os_error() != Some(libc::EINTR) {
                    return Err(e);
                }
            },
            Some(0) => loop {
                let rc = unsafe { libc::sem_trywait(self.sem) };
                if rc == 0 {
                    return Ok(true);
                }
                let e = io::Error::last_os_error();
                match e.raw_os_error() {
                    Some(libc::EAGAIN) => return Ok(false),
                    Some(libc::EINTR) => continue,
                    _ => return Err(e),
                }
            },
            Some(ms) => {
                let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
                unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
                let ns_total = ts.tv_nsec as u64 + (ms % 1000) * 1_000_000;
                ts.tv_sec += (ms / 1000) as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
                ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
                loop {
                    let rc = unsafe { libc::sem_timedwait(self.sem, &ts) };
                    if rc == 0 {
                        return Ok(true);
                    }
                    let e = io::Error::last_os_error();
                    match e.raw_os_error() {
                        Some(libc::ETIMEDOUT) => return Ok(false),
                        Some(libc::EINTR) => continue,
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    /// Current value of the semaphore counter (`sem_getvalue`).
    pub fn value(&self) -> io::Result<i32> {
        let mut val: libc::c_int = 0;
        let rc = unsafe { libc::sem_getvalue(self.sem, &mut val) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(val)
    }

    /// Remove the backing storage for a named semaphore (static helper).
    pub fn clear_storage(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::sem_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for IpcSemaphore {
    fn drop(&mut self) {
        if !self.sem.is_null() {
            unsafe { libc::sem_close(self.sem) };
        }
    }
}
