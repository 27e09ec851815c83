// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Platform-specific primitives. This crate targets POSIX-like hosts only.

pub mod posix;

pub use posix::{PlatformMutex, PlatformShm};
