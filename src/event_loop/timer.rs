// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One-shot millisecond timers, ordered by expiry.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use super::job::Level;
use super::Priority;

/// Handle to a pending timer, returned by `TimerSource::add`. Passing it to
/// `del` cancels the timer if it hasn't already fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry {
    expire: Instant,
    priority: Priority,
    callback: Box<dyn FnOnce()>,
}

/// Timer source: a min-heap of `(expiry, id)` plus a side table of live
/// entries. Deleting a timer just removes it from the side table; the stale
/// heap entry is skipped (and dropped) the next time it's popped.
pub(crate) struct TimerSource {
    next_id: u64,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Entry>,
}

impl TimerSource {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
        }
    }

    pub(crate) fn add(
        &mut self,
        priority: Priority,
        duration: Duration,
        callback: Box<dyn FnOnce()>,
    ) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let expire = Instant::now() + duration;
        self.entries.insert(
            id,
            Entry {
                expire,
                priority,
                callback,
            },
        );
        self.heap.push(Reverse((expire, id)));
        TimerHandle(id)
    }

    pub(crate) fn del(&mut self, handle: TimerHandle) -> bool {
        self.entries.remove(&handle.0).is_some()
    }

    pub(crate) fn expire_time(&self, handle: TimerHandle) -> Option<Instant> {
        self.entries.get(&handle.0).map(|e| e.expire)
    }

    /// Move every timer due by now straight into its level's ready queue
    /// (bypassing `wait`, mirroring `make_job_from_tmo`). Returns the count
    /// of timers that fired.
    pub(crate) fn expire_due(&mut self, levels: &[RefCell<Level>; 3]) -> i32 {
        let now = Instant::now();
        let mut fired = 0;
        while let Some(&Reverse((expire, id))) = self.heap.peek() {
            if expire > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.entries.remove(&id) {
                levels[entry.priority as usize]
                    .borrow_mut()
                    .push_ready(entry.callback);
                fired += 1;
            }
            // Cancelled timer (removed from `entries` already): drop the
            // stale heap entry and keep scanning.
        }
        fired
    }

    /// Milliseconds until the next timer expires, clamped the way
    /// `qb_loop_timer_msec_duration_to_expire` clamps its `uint64_t`
    /// duration into an `int32_t` result. `-1` means "no timer pending".
    pub(crate) fn msec_duration_to_expire(&self) -> i32 {
        match self.heap.peek() {
            None => -1,
            Some(&Reverse((expire, _))) => {
                let now = Instant::now();
                if expire <= now {
                    0
                } else {
                    let ms = (expire - now).as_millis();
                    if ms > i32::MAX as u128 {
                        i32::MAX - 1
                    } else {
                        ms as i32
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_expiry_order() {
        let levels = [
            RefCell::new(Level::new()),
            RefCell::new(Level::new()),
            RefCell::new(Level::new()),
        ];
        let mut ts = TimerSource::new();
        let order = std::rc::Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        ts.add(
            Priority::Low,
            Duration::from_millis(20),
            Box::new(move || o1.borrow_mut().push(2)),
        );
        let o2 = order.clone();
        ts.add(
            Priority::Low,
            Duration::from_millis(1),
            Box::new(move || o2.borrow_mut().push(1)),
        );

        std::thread::sleep(Duration::from_millis(30));
        let fired = ts.expire_due(&levels);
        assert_eq!(fired, 2);

        while let Some(job) = levels[Priority::Low as usize].borrow_mut().pop_ready() {
            job();
        }
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn del_cancels_before_fire() {
        let levels = [
            RefCell::new(Level::new()),
            RefCell::new(Level::new()),
            RefCell::new(Level::new()),
        ];
        let mut ts = TimerSource::new();
        let fired = std::rc::Rc::new(RefCell::new(false));
        let f = fired.clone();
        let handle = ts.add(
            Priority::Medium,
            Duration::from_millis(5),
            Box::new(move || *f.borrow_mut() = true),
        );
        assert!(ts.del(handle));

        std::thread::sleep(Duration::from_millis(15));
        ts.expire_due(&levels);
        assert!(!*fired.borrow());
    }

    #[test]
    fn no_timers_reports_negative_one() {
        let ts = TimerSource::new();
        assert_eq!(ts.msec_duration_to_expire(), -1);
    }
}
