// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Errno-centric predicates shared by the ring buffer, notifier, and IPC
// transport/service code. No separate error enum is introduced: fallible
// operations return `std::io::Result<T>`, matching the donor crate's
// existing convention; these helpers classify an `io::Error` against the
// taxonomy described in the spec's error-handling section.

use std::io;

/// Build an `io::Error` from a raw POSIX errno, matching the convention
/// used throughout this crate for OS-boundary failures.
pub fn from_errno(eno: i32) -> io::Error {
    io::Error::from_raw_os_error(eno)
}

/// `true` for the transient/retryable class: the caller may retry the same
/// call, possibly after waiting.
pub fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ETIMEDOUT)
    )
}

/// `true` for the disconnect class: the connection's `is_connected` flag
/// must flip to false and the error propagate to the caller.
pub fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOTCONN) | Some(libc::EPIPE) | Some(libc::ECONNRESET) | Some(libc::ESHUTDOWN)
    )
}

/// `EINTR` specifically — the only retryable error this crate retries
/// silently *inside* a single call rather than surfacing to the caller.
pub fn is_eintr(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINTR)
}

/// Caller-provided buffer too small for the next chunk (`ENOBUFS`).
pub fn too_small() -> io::Error {
    from_errno(libc::ENOBUFS)
}

/// A send exceeds the connection's negotiated `max_msg_size` (`EMSGSIZE`).
pub fn msg_too_large() -> io::Error {
    from_errno(libc::EMSGSIZE)
}

/// Ring full / would block, in non-overwrite mode (`EAGAIN`).
pub fn would_block() -> io::Error {
    from_errno(libc::EAGAIN)
}

/// No data arrived within the requested window (`ETIMEDOUT`).
pub fn timed_out() -> io::Error {
    from_errno(libc::ETIMEDOUT)
}

/// Fatal ring-buffer corruption: a chunk's magic word didn't match. This is
/// a contract violation, not a recoverable runtime condition.
pub fn corrupt_chunk() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "ring buffer chunk magic mismatch")
}
