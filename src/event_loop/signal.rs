// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Signal delivery via a self-pipe: the signal handler only sets a flag and
// writes one byte (the only things async-signal-safe code is allowed to
// do); everything else runs later, on the loop's own thread, when the fd
// source notices the pipe is readable.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::platform::posix::SelfPipe;

use super::job::Level;
use super::Priority;

const MAX_SIGNUM: usize = 64;

static PENDING: [AtomicBool; MAX_SIGNUM] = {
    const FALSE: AtomicBool = AtomicBool::new(false);
    [FALSE; MAX_SIGNUM]
};
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handler(signum: libc::c_int) {
    let idx = signum as usize;
    if idx < MAX_SIGNUM {
        PENDING[idx].store(true, Ordering::SeqCst);
    }
    let fd = WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

struct SignalEntry {
    signum: i32,
    priority: Priority,
    callback: Rc<RefCell<Box<dyn FnMut()>>>,
}

/// Only one `SignalSource` per process should be active at a time: the
/// handler writes to whichever pipe `WRITE_FD` currently names, matching
/// the single `default_instance` assumption the rest of this module's
/// donor made for its global loop.
pub(crate) struct SignalSource {
    pipe: SelfPipe,
    entries: Vec<SignalEntry>,
}

impl SignalSource {
    pub(crate) fn new() -> io::Result<Self> {
        let pipe = SelfPipe::new()?;
        WRITE_FD.store(pipe.write_fd, Ordering::SeqCst);
        Ok(Self {
            pipe,
            entries: Vec::new(),
        })
    }

    pub(crate) fn self_pipe_fd(&self) -> i32 {
        self.pipe.read_fd
    }

    pub(crate) fn add(
        &mut self,
        signum: i32,
        priority: Priority,
        callback: Box<dyn FnMut()>,
    ) -> io::Result<()> {
        if signum <= 0 || signum as usize >= MAX_SIGNUM {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut sa.sa_mask) };
        if unsafe { libc::sigaction(signum, &sa, std::ptr::null_mut()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        self.entries.push(SignalEntry {
            signum,
            priority,
            callback: Rc::new(RefCell::new(callback)),
        });
        Ok(())
    }

    /// Drain the self-pipe, then promote any pending registered signal
    /// straight to its level's ready queue (bypassing `wait`, like timers).
    /// Returns how many signals fired.
    pub(crate) fn dispatch_pending(&mut self, levels: &[RefCell<Level>; 3]) -> i32 {
        self.pipe.drain();
        let mut n = 0;
        for entry in &self.entries {
            let idx = entry.signum as usize;
            if idx < MAX_SIGNUM && PENDING[idx].swap(false, Ordering::SeqCst) {
                let cb = entry.callback.clone();
                levels[entry.priority as usize]
                    .borrow_mut()
                    .push_ready(Box::new(move || (*cb.borrow_mut())()));
                n += 1;
            }
        }
        n
    }
}
