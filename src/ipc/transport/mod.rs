// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transport dispatch: a sealed sum type over the two wire formats a
// connection can negotiate, rather than a vtable of function pointers
// (SPEC_FULL §9's "dynamic dispatch over transports" note) — Rust's
// exhaustive `match` gives the same dispatch with compile-time coverage of
// every variant.

pub mod shm;
pub mod socket;

use std::io;
use std::os::unix::io::RawFd;

use crate::ipc::wire::TransportType;

pub enum Transport {
    Shm(shm::ShmTransport),
    Socket(socket::SocketTransport),
}

impl Transport {
    pub fn transport_type(&self) -> TransportType {
        match self {
            Transport::Shm(_) => TransportType::Shm,
            Transport::Socket(_) => TransportType::Socket,
        }
    }

    /// Send a request (client -> server).
    pub fn send_request(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Shm(t) => t.send(shm::Channel::Request, buf),
            Transport::Socket(t) => t.send(socket::Channel::Request, crate::ipc::wire::MSG_NEW_MESSAGE, buf),
        }
    }

    /// Receive a request (server side). Returns the payload length.
    pub fn recv_request(&self, buf: &mut [u8], timeout_ms: Option<u64>) -> io::Result<usize> {
        match self {
            Transport::Shm(t) => t.recv(shm::Channel::Request, buf, timeout_ms),
            Transport::Socket(t) => t.recv(socket::Channel::Request, buf, timeout_ms).map(|(_, n)| n),
        }
    }

    /// Send a response (server -> client).
    pub fn send_response(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Shm(t) => t.send(shm::Channel::Response, buf),
            Transport::Socket(t) => t.send(socket::Channel::Response, crate::ipc::wire::MSG_NEW_MESSAGE, buf),
        }
    }

    /// Receive a response (client side).
    pub fn recv_response(&self, buf: &mut [u8], timeout_ms: Option<u64>) -> io::Result<usize> {
        match self {
            Transport::Shm(t) => t.recv(shm::Channel::Response, buf, timeout_ms),
            Transport::Socket(t) => t.recv(socket::Channel::Response, buf, timeout_ms).map(|(_, n)| n),
        }
    }

    /// Send an event (server -> client, fire-and-forget).
    pub fn send_event(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Shm(t) => t.send(shm::Channel::Event, buf),
            Transport::Socket(t) => t.send(socket::Channel::Event, crate::ipc::wire::MSG_NEW_MESSAGE, buf),
        }
    }

    /// Receive an event (client side).
    pub fn recv_event(&self, buf: &mut [u8], timeout_ms: Option<u64>) -> io::Result<usize> {
        match self {
            Transport::Shm(t) => t.recv(shm::Channel::Event, buf, timeout_ms),
            Transport::Socket(t) => t.recv(socket::Channel::Event, buf, timeout_ms).map(|(_, n)| n),
        }
    }

    /// Number of requests enqueued but not yet drained (used by the
    /// service's `min(q_len, 50)` dispatch-drain loop, §4.7).
    pub fn request_q_len(&self) -> i64 {
        match self {
            Transport::Shm(t) => t.q_len_get(shm::Channel::Request).unwrap_or(0),
            Transport::Socket(t) => t.q_len_get(socket::Channel::Request),
        }
    }

    /// Server: set the request channel's flow-control level.
    pub fn fc_set(&self, level: u32) {
        match self {
            Transport::Shm(t) => t.fc_set(level),
            Transport::Socket(t) => t.fc_set(socket::Channel::Request, level),
        }
    }

    /// Client: read the request channel's flow-control level.
    pub fn fc_get(&self) -> u32 {
        match self {
            Transport::Shm(t) => t.fc_get(),
            Transport::Socket(t) => t.fc_get(socket::Channel::Request),
        }
    }

    /// The fd to register with the event loop for request readiness
    /// (server side). `None` for the SHM transport on a non-Linux host,
    /// where the notifier has no pollable fd and the service instead
    /// polls from a recurring low-priority job.
    pub fn request_raw_fd(&self) -> Option<RawFd> {
        match self {
            Transport::Shm(t) => t.request_raw_fd(),
            Transport::Socket(t) => Some(t.raw_fd(socket::Channel::Request)),
        }
    }
}
