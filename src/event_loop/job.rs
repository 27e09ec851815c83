// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One-shot job queue for a single priority level.

use std::collections::VecDeque;

pub(crate) type Job = Box<dyn FnOnce() + 'static>;

/// A priority tier's job queue. Jobs land in `wait` and are only spliced
/// into `ready` once per loop iteration (`get_more_jobs`), so a job that
/// enqueues more work doesn't let that work run in the same iteration.
/// Timer and signal dispatch skip `wait` entirely and push straight into
/// `ready`, since their event already happened this iteration.
pub(crate) struct Level {
    pub(crate) to_process: i32,
    pub(crate) todo: i32,
    wait: VecDeque<Job>,
    ready: VecDeque<Job>,
}

impl Level {
    pub(crate) fn new() -> Self {
        Self {
            to_process: 4,
            todo: 0,
            wait: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    pub(crate) fn add(&mut self, job: Job) {
        self.wait.push_back(job);
    }

    pub(crate) fn push_ready(&mut self, job: Job) {
        self.ready.push_back(job);
    }

    /// Splice `wait` into `ready`, returning how many jobs moved.
    pub(crate) fn get_more_jobs(&mut self) -> i32 {
        let n = self.wait.len() as i32;
        if n > 0 {
            self.todo += n;
            self.ready.extend(self.wait.drain(..));
        }
        n
    }

    /// Pop the next ready job, if any, decrementing `todo`.
    pub(crate) fn pop_ready(&mut self) -> Option<Job> {
        let job = self.ready.pop_front();
        if job.is_some() {
            self.todo -= 1;
        }
        job
    }
}
