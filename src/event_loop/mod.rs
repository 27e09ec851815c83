// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cooperative, single-threaded, priority-based event loop: fds, one-shot
// jobs, one-shot timers, and unix signals, all dispatched on one thread so a
// connection's state machine never needs its own lock.

mod job;
mod poll;
mod signal;
mod timer;

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use job::Level;

pub use poll::FdEvents;
pub use timer::TimerHandle;

/// Dispatch priority. Mirrors the reference implementation's three-level
/// scheme: within one loop iteration `High` always gets to run, `Medium`
/// runs two iterations out of three, and `Low` runs one in three (see
/// `EventLoop::run`'s `p_stop` rotation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
}

const PRIORITIES_HIGH_TO_LOW: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

thread_local! {
    static DEFAULT_LOOP: RefCell<Option<Rc<EventLoop>>> = const { RefCell::new(None) };
}

/// A cooperative event loop. Not `Send`/`Sync` — it runs, and is driven
/// from, exactly one thread; share it across closures within that thread
/// via `Rc::clone`.
pub struct EventLoop {
    levels: [RefCell<Level>; 3],
    stop_requested: Cell<bool>,
    timer_source: RefCell<timer::TimerSource>,
    fd_source: RefCell<poll::FdSource>,
    signal_source: RefCell<signal::SignalSource>,
}

impl EventLoop {
    pub fn new() -> io::Result<Rc<Self>> {
        let levels = [
            RefCell::new(Level::new()),
            RefCell::new(Level::new()),
            RefCell::new(Level::new()),
        ];
        let fd_source = RefCell::new(poll::FdSource::new()?);
        let signal_source = RefCell::new(signal::SignalSource::new()?);
        let timer_source = RefCell::new(timer::TimerSource::new());

        let lp = Rc::new(Self {
            levels,
            stop_requested: Cell::new(false),
            timer_source,
            fd_source,
            signal_source,
        });

        // Wire the signal source's self-pipe into the fd source so signal
        // delivery rides the same dispatch path as any other fd readiness,
        // without the main loop needing to poll it separately.
        let self_pipe_fd = lp.signal_source.borrow().self_pipe_fd();
        let weak: Weak<Self> = Rc::downgrade(&lp);
        lp.fd_source.borrow_mut().add(
            self_pipe_fd,
            FdEvents::READ,
            Priority::High,
            Box::new(move |_revents| {
                if let Some(lp) = weak.upgrade() {
                    lp.signal_source.borrow_mut().dispatch_pending(&lp.levels);
                }
            }),
        )?;

        Ok(lp)
    }

    /// The process's default loop: created on first call, from whichever
    /// thread calls first, and reused by every later call from that same
    /// thread. Mirrors the reference implementation's lazily-created
    /// singleton default loop; most callers should still construct and
    /// thread through their own `EventLoop` explicitly, since this one is
    /// thread-local rather than truly process-global (the loop itself is
    /// `!Send`, so a real process-global instance isn't possible anyway).
    pub fn default_loop() -> io::Result<Rc<Self>> {
        DEFAULT_LOOP.with(|cell| {
            if let Some(lp) = cell.borrow().as_ref() {
                return Ok(lp.clone());
            }
            let lp = Self::new()?;
            *cell.borrow_mut() = Some(lp.clone());
            Ok(lp)
        })
    }

    /// Queue a one-shot job. Runs on a later iteration of `run`, never
    /// re-entrantly within the call that added it.
    pub fn job_add(&self, priority: Priority, job: impl FnOnce() + 'static) {
        self.levels[priority as usize]
            .borrow_mut()
            .add(Box::new(job));
    }

    /// Arm a one-shot timer; `callback` fires once `duration` has elapsed.
    pub fn timer_add(
        &self,
        priority: Priority,
        duration: Duration,
        callback: impl FnOnce() + 'static,
    ) -> TimerHandle {
        self.timer_source
            .borrow_mut()
            .add(priority, duration, Box::new(callback))
    }

    /// Cancel a timer. Returns `false` if it already fired or never existed.
    pub fn timer_del(&self, handle: TimerHandle) -> bool {
        self.timer_source.borrow_mut().del(handle)
    }

    /// Milliseconds until `handle` next fires, relative to now, or `None` if
    /// it already fired or was cancelled.
    pub fn timer_expire_ms(&self, handle: TimerHandle) -> Option<u64> {
        let expire = self.timer_source.borrow().expire_time(handle)?;
        Some(expire.saturating_duration_since(std::time::Instant::now()).as_millis() as u64)
    }

    /// Register interest in `fd`'s readiness. `callback` is invoked with the
    /// observed event mask (`libc::POLLIN`/`EPOLLIN`-style bits) each time
    /// the fd becomes ready, until `fd_del` is called.
    pub fn fd_add(
        &self,
        fd: RawFd,
        events: FdEvents,
        priority: Priority,
        callback: impl FnMut(u32) + 'static,
    ) -> io::Result<()> {
        self.fd_source
            .borrow_mut()
            .add(fd, events, priority, Box::new(callback))
    }

    pub fn fd_del(&self, fd: RawFd) {
        self.fd_source.borrow_mut().del(fd);
    }

    /// Run `callback` every time `signum` is delivered to this process.
    /// Only one `EventLoop` per process may use this at a time (see
    /// `signal::SignalSource`).
    pub fn signal_add(
        &self,
        signum: i32,
        priority: Priority,
        callback: impl FnMut() + 'static,
    ) -> io::Result<()> {
        self.signal_source
            .borrow_mut()
            .add(signum, priority, Box::new(callback))
    }

    /// Ask `run` to return after it finishes dispatching the job currently
    /// in flight (or immediately, if called from outside a dispatch).
    pub fn stop(&self) {
        self.stop_requested.set(true);
    }

    /// Run until `stop` is called. Each iteration: promote waiting jobs and
    /// fired timers into their levels' ready queues, compute how long to
    /// block in the fd poll, poll, then dispatch up to `to_process` ready
    /// jobs per level from `High` down to `p_stop`.
    pub fn run(self: &Rc<Self>) {
        self.stop_requested.set(false);
        let mut p_stop = Priority::Low;
        let mut remaining_todo: i32 = 0;

        loop {
            p_stop = match p_stop {
                Priority::Low => Priority::High,
                Priority::Medium => Priority::Low,
                Priority::High => Priority::Medium,
            };

            let mut job_todo = 0;
            for level in &self.levels {
                job_todo += level.borrow_mut().get_more_jobs();
            }

            let timer_todo = self.timer_source.borrow_mut().expire_due(&self.levels);

            let ms_timeout = if remaining_todo > 0 || timer_todo > 0 {
                0
            } else if job_todo > 0 {
                // Jobs can spin out of control if something keeps re-adding
                // them; don't let that starve the fd poll entirely.
                50
            } else {
                self.timer_source.borrow().msec_duration_to_expire()
            };

            if let Err(e) = self.fd_source.borrow_mut().poll(ms_timeout, &self.levels) {
                log::warn!("event loop fd poll failed: {e}");
            }

            remaining_todo = 0;
            for &p in &PRIORITIES_HIGH_TO_LOW {
                if p >= p_stop {
                    self.run_level(p);
                    if self.stop_requested.get() {
                        return;
                    }
                }
                remaining_todo += self.levels[p as usize].borrow().todo;
            }

            if self.stop_requested.get() {
                return;
            }
        }
    }

    fn run_level(&self, p: Priority) {
        let to_process = self.levels[p as usize].borrow().to_process;
        let mut processed = 0;
        loop {
            let job = self.levels[p as usize].borrow_mut().pop_ready();
            let Some(job) = job else {
                return;
            };
            job();
            processed += 1;
            if self.stop_requested.get() || processed >= to_process {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn default_loop_is_reused_per_thread() {
        let a = EventLoop::default_loop().unwrap();
        let b = EventLoop::default_loop().unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn job_runs_and_stops() {
        let lp = EventLoop::new().unwrap();
        let hits = Arc::new(AtomicI32::new(0));
        let h = hits.clone();
        let lp2 = lp.clone();
        lp.job_add(Priority::Low, move || {
            h.fetch_add(1, Ordering::SeqCst);
            lp2.stop();
        });
        lp.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timer_fires_once() {
        let lp = EventLoop::new().unwrap();
        let hits = Arc::new(AtomicI32::new(0));
        let h = hits.clone();
        let lp2 = lp.clone();
        lp.timer_add(Priority::Medium, Duration::from_millis(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
            lp2.stop();
        });
        lp.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn higher_priority_job_runs_first_within_an_iteration() {
        let lp = EventLoop::new().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        lp.job_add(Priority::Low, move || o1.lock().unwrap().push("low"));
        let o2 = order.clone();
        let lp2 = lp.clone();
        lp.job_add(Priority::High, move || {
            o2.lock().unwrap().push("high");
            lp2.stop();
        });
        lp.run();
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[test]
    fn fd_readiness_dispatches_job() {
        let lp = EventLoop::new().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let hits = Arc::new(AtomicI32::new(0));
        let h = hits.clone();
        let lp2 = lp.clone();
        lp.fd_add(read_fd, FdEvents::READ, Priority::High, move |_revents| {
            let mut buf = [0u8; 1];
            unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
            h.fetch_add(1, Ordering::SeqCst);
            lp2.stop();
        })
        .unwrap();

        unsafe {
            let byte = 1u8;
            libc::write(write_fd, &byte as *const u8 as *const libc::c_void, 1);
        }

        lp.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        lp.fd_del(read_fd);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
