// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fd readiness source. `epoll` on Linux, portable `poll(2)` elsewhere;
// either way a readiness hit is turned into a job pushed straight onto its
// level's ready queue, the same "bypass wait" treatment as timers, since the
// event already happened this iteration.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::platform::posix;

use super::job::Level;
use super::Priority;

/// Readiness mask a caller registers a callback for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdEvents(u32);

impl FdEvents {
    pub const READ: FdEvents = FdEvents(1 << 0);
    pub const WRITE: FdEvents = FdEvents(1 << 1);

    fn contains(self, other: FdEvents) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for FdEvents {
    type Output = FdEvents;
    fn bitor(self, rhs: FdEvents) -> FdEvents {
        FdEvents(self.0 | rhs.0)
    }
}

struct FdEntry {
    // Read back by the portable `poll(2)` backend on each iteration; the
    // Linux `epoll` backend only needs it once, at `add` time.
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    events: FdEvents,
    priority: Priority,
    callback: Rc<RefCell<Box<dyn FnMut(u32)>>>,
}

#[cfg(target_os = "linux")]
pub(crate) struct FdSource {
    epoll: posix::Epoll,
    entries: HashMap<RawFd, FdEntry>,
}

#[cfg(target_os = "linux")]
impl FdSource {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            epoll: posix::Epoll::new()?,
            entries: HashMap::new(),
        })
    }

    pub(crate) fn add(
        &mut self,
        fd: RawFd,
        events: FdEvents,
        priority: Priority,
        callback: Box<dyn FnMut(u32)>,
    ) -> io::Result<()> {
        self.epoll.add(fd, to_epoll_mask(events), fd as u64)?;
        self.entries.insert(
            fd,
            FdEntry {
                events,
                priority,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        Ok(())
    }

    pub(crate) fn del(&mut self, fd: RawFd) {
        let _ = self.epoll.del(fd);
        self.entries.remove(&fd);
    }

    pub(crate) fn poll(&mut self, ms_timeout: i32, levels: &[RefCell<Level>; 3]) -> io::Result<i32> {
        let mut buf = [libc::epoll_event { events: 0, u64: 0 }; 64];
        let ready = self.epoll.wait(&mut buf, ms_timeout)?;
        let mut n = 0;
        for (token, revents) in ready {
            let fd = token as RawFd;
            if let Some(entry) = self.entries.get(&fd) {
                let cb = entry.callback.clone();
                levels[entry.priority as usize]
                    .borrow_mut()
                    .push_ready(Box::new(move || (*cb.borrow_mut())(revents)));
                n += 1;
            }
        }
        Ok(n)
    }
}

#[cfg(target_os = "linux")]
fn to_epoll_mask(events: FdEvents) -> u32 {
    let mut mask = 0u32;
    if events.contains(FdEvents::READ) {
        mask |= libc::EPOLLIN as u32;
    }
    if events.contains(FdEvents::WRITE) {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

#[cfg(not(target_os = "linux"))]
pub(crate) struct FdSource {
    entries: HashMap<RawFd, FdEntry>,
}

#[cfg(not(target_os = "linux"))]
impl FdSource {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            entries: HashMap::new(),
        })
    }

    pub(crate) fn add(
        &mut self,
        fd: RawFd,
        events: FdEvents,
        priority: Priority,
        callback: Box<dyn FnMut(u32)>,
    ) -> io::Result<()> {
        self.entries.insert(
            fd,
            FdEntry {
                events,
                priority,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        Ok(())
    }

    pub(crate) fn del(&mut self, fd: RawFd) {
        self.entries.remove(&fd);
    }

    pub(crate) fn poll(&mut self, ms_timeout: i32, levels: &[RefCell<Level>; 3]) -> io::Result<i32> {
        let fds: Vec<RawFd> = self.entries.keys().copied().collect();
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&fd| {
                let events = self.entries[&fd].events;
                libc::pollfd {
                    fd,
                    events: to_poll_mask(events),
                    revents: 0,
                }
            })
            .collect();

        posix::poll_fds(&mut pollfds, ms_timeout)?;

        let mut n = 0;
        for (i, pfd) in pollfds.iter().enumerate() {
            if pfd.revents == 0 {
                continue;
            }
            let fd = fds[i];
            if let Some(entry) = self.entries.get(&fd) {
                let cb = entry.callback.clone();
                let revents = pfd.revents as u32;
                levels[entry.priority as usize]
                    .borrow_mut()
                    .push_ready(Box::new(move || (*cb.borrow_mut())(revents)));
                n += 1;
            }
        }
        Ok(n)
    }
}

#[cfg(not(target_os = "linux"))]
fn to_poll_mask(events: FdEvents) -> libc::c_short {
    let mut mask = 0;
    if events.contains(FdEvents::READ) {
        mask |= libc::POLLIN;
    }
    if events.contains(FdEvents::WRITE) {
        mask |= libc::POLLOUT;
    }
    mask as libc::c_short
}
