// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Generational arena for server-side connection handles. Ports the `hdb`
// `{check, index}` packed-handle idea (SPEC_FULL §9) as a 32-bit index plus
// a 32-bit generation cookie, both returned to the caller and validated on
// every lookup so a reused slot can't be mistaken for the connection that
// used to live there.

use std::cell::UnsafeCell;

use crate::SpinLock;

/// An opaque reference to a slot in a `HandleTable`. Cheap to copy, safe to
/// hold across a `disconnect`/reconnect cycle — a stale handle just fails
/// `get`/`remove` instead of aliasing a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle {
    index: u32,
    generation: u32,
}

enum Slot<T> {
    Empty { next_free: Option<u32> },
    Occupied { generation: u32, value: T },
}

/// A generational slot table, guarded by a spin lock so it can be shared
/// behind an `Rc` the way the service and its connections both need to.
pub struct HandleTable<T> {
    lock: SpinLock,
    slots: UnsafeCell<Vec<Slot<T>>>,
    free_head: UnsafeCell<Option<u32>>,
    next_generation: UnsafeCell<u32>,
}

// Safety: all access to the interior-mutable fields goes through `lock`.
unsafe impl<T: Send> Send for HandleTable<T> {}
unsafe impl<T: Send> Sync for HandleTable<T> {}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            slots: UnsafeCell::new(Vec::new()),
            free_head: UnsafeCell::new(None),
            next_generation: UnsafeCell::new(1),
        }
    }

    /// Insert a value, returning a handle that validates future lookups
    /// against this specific insertion.
    pub fn insert(&self, value: T) -> Handle {
        self.lock.lock();
        let generation = unsafe {
            let g = *self.next_generation.get();
            *self.next_generation.get() = g.wrapping_add(1).max(1);
            g
        };
        let slots = unsafe { &mut *self.slots.get() };
        let free_head = unsafe { &mut *self.free_head.get() };
        let handle = if let Some(index) = free_head.take() {
            let next_free = match &slots[index as usize] {
                Slot::Empty { next_free } => *next_free,
                Slot::Occupied { .. } => unreachable!("free list pointed at occupied slot"),
            };
            *free_head = next_free;
            slots[index as usize] = Slot::Occupied { generation, value };
            Handle { index, generation }
        } else {
            let index = slots.len() as u32;
            slots.push(Slot::Occupied { generation, value });
            Handle { index, generation }
        };
        self.lock.unlock();
        handle
    }

    /// Look up the value for `handle`, if it's still live and hasn't been
    /// superseded by a later insertion into the same slot.
    pub fn get<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock.lock();
        let slots = unsafe { &*self.slots.get() };
        let result = match slots.get(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(f(value))
            }
            _ => None,
        };
        self.lock.unlock();
        result
    }

    pub fn get_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock.lock();
        let slots = unsafe { &mut *self.slots.get() };
        let result = match slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(f(value))
            }
            _ => None,
        };
        self.lock.unlock();
        result
    }

    /// Remove and return the value for `handle`, if still live.
    pub fn remove(&self, handle: Handle) -> Option<T> {
        self.lock.lock();
        let slots = unsafe { &mut *self.slots.get() };
        let free_head = unsafe { &mut *self.free_head.get() };
        let removed = match slots.get(handle.index as usize) {
            Some(Slot::Occupied { generation, .. }) if *generation == handle.generation => {
                let old = std::mem::replace(
                    &mut slots[handle.index as usize],
                    Slot::Empty {
                        next_free: *free_head,
                    },
                );
                *free_head = Some(handle.index);
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Empty { .. } => None,
                }
            }
            _ => None,
        };
        self.lock.unlock();
        removed
    }

    /// Apply `f` to every live value, in slot order.
    pub fn for_each(&self, mut f: impl FnMut(Handle, &T)) {
        self.lock.lock();
        let slots = unsafe { &*self.slots.get() };
        for (index, slot) in slots.iter().enumerate() {
            if let Slot::Occupied { generation, value } = slot {
                f(
                    Handle {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                );
            }
        }
        self.lock.unlock();
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
