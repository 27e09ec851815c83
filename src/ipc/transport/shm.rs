// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// SHM IPC transport (§4.5): three ring buffers per connection — request
// (client -> server), response and event (server -> client, event
// overwrite-on-full). Flow control is a 4-byte atomic word living in the
// request ring's user-data region, set by the server and polled by the
// client.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::notifier::{Notifier, NotifierKind};
use crate::ringbuffer::{RbFlags, RingBuffer};

/// Which of the three rings a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Request,
    Response,
    Event,
}

const FC_WORD_BYTES: usize = 4;

pub struct ShmTransport {
    request: RingBuffer,
    response: RingBuffer,
    event: RingBuffer,
}

impl ShmTransport {
    /// Server side: create all three backing rings fresh.
    pub fn create(base_name: &str, bytes_per_ring: usize) -> io::Result<Self> {
        let request = RingBuffer::open_with_user_data(
            &format!("{base_name}-request"),
            bytes_per_ring,
            RbFlags::CREATE,
            NotifierKind::EventFdPair,
            FC_WORD_BYTES,
        )?;
        let response = RingBuffer::open(
            &format!("{base_name}-response"),
            bytes_per_ring,
            RbFlags::CREATE,
            NotifierKind::EventFdPair,
        )?;
        let event = RingBuffer::open(
            &format!("{base_name}-event"),
            bytes_per_ring,
            RbFlags::CREATE | RbFlags::OVERWRITE,
            NotifierKind::EventFdPair,
        )?;
        Ok(Self {
            request,
            response,
            event,
        })
    }

    /// Client side, when the notifier backend is nameable on its own (the
    /// `PosixSemPshared` fallback `EventFdPair` takes off-Linux): attach to
    /// the three rings the server already created, named in the setup
    /// response, reconstructing each notifier by name rather than needing
    /// anything passed over the setup socket.
    pub fn open(request_name: &str, response_name: &str, event_name: &str) -> io::Result<Self> {
        let request = RingBuffer::open_with_user_data(
            request_name,
            0,
            RbFlags(0),
            NotifierKind::EventFdPair,
            FC_WORD_BYTES,
        )?;
        let response = RingBuffer::open(response_name, 0, RbFlags(0), NotifierKind::EventFdPair)?;
        let event = RingBuffer::open(event_name, 0, RbFlags(0), NotifierKind::EventFdPair)?;
        Ok(Self {
            request,
            response,
            event,
        })
    }

    /// Client side on Linux: like `open`, but each ring's notifier is
    /// reconstructed from descriptors received over `SCM_RIGHTS` during the
    /// setup handshake (`Notifier::from_eventfd_pair`) rather than built by
    /// name — eventfds have no name a second process could look up.
    pub fn open_with_notifiers(
        request_name: &str,
        response_name: &str,
        event_name: &str,
        request_notifier: Notifier,
        response_notifier: Notifier,
        event_notifier: Notifier,
    ) -> io::Result<Self> {
        let request = RingBuffer::open_with_notifier(
            request_name,
            0,
            RbFlags(0),
            FC_WORD_BYTES,
            request_notifier,
        )?;
        let response =
            RingBuffer::open_with_notifier(response_name, 0, RbFlags(0), 0, response_notifier)?;
        let event = RingBuffer::open_with_notifier(event_name, 0, RbFlags(0), 0, event_notifier)?;
        Ok(Self {
            request,
            response,
            event,
        })
    }

    /// Server side: the three notifiers' raw fds, flattened as
    /// `[request_write, request_read, response_write, response_read,
    /// event_write, event_read]`, for the SCM_RIGHTS handshake payload.
    /// `None` unless every ring actually has an fd-backed notifier (Linux
    /// eventfd-pair) — callers fall back to plain `open` on the client
    /// when this is `None`.
    #[cfg(target_os = "linux")]
    pub fn notifier_fds(&self) -> Option<[i32; 6]> {
        let (rw, rr) = self.request.notifier().eventfd_pair()?;
        let (sw, sr) = self.response.notifier().eventfd_pair()?;
        let (ew, er) = self.event.notifier().eventfd_pair()?;
        Some([rw, rr, sw, sr, ew, er])
    }

    #[cfg(not(target_os = "linux"))]
    pub fn notifier_fds(&self) -> Option<[i32; 6]> {
        None
    }

    fn ring(&self, channel: Channel) -> &RingBuffer {
        match channel {
            Channel::Request => &self.request,
            Channel::Response => &self.response,
            Channel::Event => &self.event,
        }
    }

    pub fn send(&self, channel: Channel, buf: &[u8]) -> io::Result<usize> {
        self.ring(channel).chunk_write(buf)
    }

    pub fn recv(&self, channel: Channel, buf: &mut [u8], timeout_ms: Option<u64>) -> io::Result<usize> {
        self.ring(channel).chunk_read(buf, timeout_ms)
    }

    pub fn q_len_get(&self, channel: Channel) -> io::Result<i64> {
        self.ring(channel).chunks_used()
    }

    /// The fd to register with the event loop for request-readiness, if
    /// the notifier supports fd-based wakeup (Linux eventfd-pair). `None`
    /// elsewhere — the service instead polls from a recurring low-priority
    /// job.
    pub fn request_raw_fd(&self) -> Option<i32> {
        self.request.notifier().raw_fd()
    }

    fn fc_word(&self) -> &AtomicU32 {
        unsafe { &*(self.request.user_data_ptr() as *const AtomicU32) }
    }

    /// Server: set the flow-control level (0 = off, 1/2 = throttled).
    pub fn fc_set(&self, level: u32) {
        self.fc_word().store(level, Ordering::Release);
    }

    /// Client: read the current flow-control level.
    pub fn fc_get(&self) -> u32 {
        self.fc_word().load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a client attached to `server`'s rings the way a real
    /// cross-process client would after receiving `server`'s notifier fds
    /// over `SCM_RIGHTS` — here the fds are simply still valid in this same
    /// process, so no socket round trip is needed to exercise the same
    /// `open_with_notifiers` path.
    #[cfg(target_os = "linux")]
    fn attach_client(server: &ShmTransport, base: &str) -> ShmTransport {
        let fds = server
            .notifier_fds()
            .expect("eventfd-backed notifiers on linux");
        ShmTransport::open_with_notifiers(
            &format!("{base}-request"),
            &format!("{base}-response"),
            &format!("{base}-event"),
            Notifier::from_eventfd_pair(fds[0], fds[1]),
            Notifier::from_eventfd_pair(fds[2], fds[3]),
            Notifier::from_eventfd_pair(fds[4], fds[5]),
        )
        .unwrap()
    }

    #[cfg(not(target_os = "linux"))]
    fn attach_client(_server: &ShmTransport, base: &str) -> ShmTransport {
        ShmTransport::open(
            &format!("{base}-request"),
            &format!("{base}-response"),
            &format!("{base}-event"),
        )
        .unwrap()
    }

    #[test]
    fn server_client_echo_roundtrip() {
        let base = format!("qb-shmt-test-{}", std::process::id());
        let server = ShmTransport::create(&base, 4096).unwrap();
        let client = attach_client(&server, &base);

        client.send(Channel::Request, b"hello").unwrap();
        let mut buf = [0u8; 64];
        let n = server.recv(Channel::Request, &mut buf, Some(100)).unwrap();
        assert_eq!(&buf[..n], b"hello");

        server.send(Channel::Response, b"ACK 5 bytes").unwrap();
        let n = client.recv(Channel::Response, &mut buf, Some(100)).unwrap();
        assert_eq!(&buf[..n], b"ACK 5 bytes");
    }

    #[test]
    fn flow_control_word_is_shared() {
        let base = format!("qb-shmt-fc-{}", std::process::id());
        let server = ShmTransport::create(&base, 4096).unwrap();
        let client = ShmTransport::open(
            &format!("{base}-request"),
            &format!("{base}-response"),
            &format!("{base}-event"),
        )
        .unwrap();

        assert_eq!(client.fc_get(), 0);
        server.fc_set(1);
        assert_eq!(client.fc_get(), 1);
    }
}
