// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unix-domain-socket IPC transport (§4.6): three datagram sockets (request,
// response, event) plus a shared control page of three `{sent,
// flow_control}` pairs, so both ends can read queue length and flow
// control without a round trip. Each channel has one bound (receiving)
// side and one lazy-connecting (sending) side, matching the direction
// data actually flows: the server binds `request` and receives client ->
// server traffic there; the client binds `response`/`event` and receives
// server -> client traffic there. The non-receiving side only connects on
// its first send, so neither end has to wait on the other to create its
// socket first.

use std::cell::Cell;
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::platform::posix::PlatformShm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Request = 0,
    Response = 1,
    Event = 2,
}

#[repr(C)]
struct ChannelCtl {
    sent: AtomicU32,
    flow_control: AtomicU32,
}

/// A single unix datagram socket, optionally not yet connected to its peer
/// (lazy-connect — see module docs).
struct DgramSocket {
    fd: RawFd,
    peer_path: Option<String>,
    connected: Cell<bool>,
}

impl DgramSocket {
    fn bind(path: &str, max_msg_size: u32) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK, 0) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        if let Err(e) = raise_buffers(fd, max_msg_size) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let addr = unix_sockaddr(path)?;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr.0 as *const _ as *const libc::sockaddr,
                addr.1 as libc::socklen_t,
            )
        };
        if rc == -1 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(Self {
            fd,
            peer_path: None,
            connected: Cell::new(false),
        })
    }

    fn unconnected(peer_path: String, max_msg_size: u32) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK, 0) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        if let Err(e) = raise_buffers(fd, max_msg_size) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(Self {
            fd,
            peer_path: Some(peer_path),
            connected: Cell::new(false),
        })
    }

    fn ensure_connected(&self) -> io::Result<()> {
        if self.connected.get() {
            return Ok(());
        }
        let path = self
            .peer_path
            .as_deref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let addr = unix_sockaddr(path)?;
        let rc = unsafe {
            libc::connect(
                self.fd,
                &addr.0 as *const _ as *const libc::sockaddr,
                addr.1 as libc::socklen_t,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        self.connected.set(true);
        Ok(())
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_connected()?;
        let rc = unsafe {
            libc::send(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn recv(&self, buf: &mut [u8], timeout_ms: Option<u64>) -> io::Result<usize> {
        wait_readable(self.fd, timeout_ms)?;
        let rc = unsafe {
            libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for DgramSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Block (up to `timeout_ms`) until `fd` is readable. `None` waits
/// indefinitely, `Some(0)` polls once, `Some(ms)` is a relative timeout.
/// The socket itself stays `SOCK_NONBLOCK` throughout; this is purely a
/// readiness gate in front of the nonblocking `recv` above.
fn wait_readable(fd: RawFd, timeout_ms: Option<u64>) -> io::Result<()> {
    let poll_timeout = match timeout_ms {
        None => -1,
        Some(ms) => ms as libc::c_int,
    };
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, poll_timeout) };
        if rc > 0 {
            return Ok(());
        }
        if rc == 0 {
            return Err(crate::error::timed_out());
        }
        let e = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::EINTR) {
            return Err(e);
        }
    }
}

/// Raise `SO_SNDBUF`/`SO_RCVBUF` to `max_msg_size`. On BSD-like kernels that
/// return `ENOBUFS` for an oversized request rather than silently clamping,
/// bisect down to the largest size the kernel actually accepts.
fn raise_buffers(fd: RawFd, max_msg_size: u32) -> io::Result<()> {
    set_buf_size(fd, libc::SO_SNDBUF, max_msg_size as usize)?;
    set_buf_size(fd, libc::SO_RCVBUF, max_msg_size as usize)?;
    Ok(())
}

fn set_buf_size(fd: RawFd, optname: libc::c_int, requested: usize) -> io::Result<usize> {
    if try_set_buf_size(fd, optname, requested)? {
        return Ok(requested);
    }
    let (mut lo, mut hi) = (0usize, requested);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if try_set_buf_size(fd, optname, mid)? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    try_set_buf_size(fd, optname, lo)?;
    Ok(lo)
}

/// `Ok(true)` on success, `Ok(false)` on `ENOBUFS` (too big for this
/// kernel), the error for anything else.
fn try_set_buf_size(fd: RawFd, optname: libc::c_int, size: usize) -> io::Result<bool> {
    let val = size as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            &val as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        return Ok(true);
    }
    let e = io::Error::last_os_error();
    if e.raw_os_error() == Some(libc::ENOBUFS) {
        return Ok(false);
    }
    Err(e)
}

fn unix_sockaddr(path: &str) -> io::Result<(libc::sockaddr_un, usize)> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
    }
    for (dst, &b) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = b as libc::c_char;
    }
    let len = size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len))
}

fn socket_path(base: &str, channel: Channel) -> String {
    let suffix = match channel {
        Channel::Request => "req",
        Channel::Response => "rsp",
        Channel::Event => "evt",
    };
    format!("{base}-{suffix}.sock")
}

pub struct SocketTransport {
    request: DgramSocket,
    response: DgramSocket,
    event: DgramSocket,
    ctl: PlatformShm,
}

impl SocketTransport {
    /// Server side: bind the request socket (the server is the receiver
    /// for client -> server traffic) and prepare response/event as
    /// lazy-connecting senders to the names the client will bind.
    pub fn create(base_name: &str, control_name: &str, max_msg_size: u32) -> io::Result<Self> {
        let request = DgramSocket::bind(&socket_path(base_name, Channel::Request), max_msg_size)?;
        let response =
            DgramSocket::unconnected(socket_path(base_name, Channel::Response), max_msg_size)?;
        let event = DgramSocket::unconnected(socket_path(base_name, Channel::Event), max_msg_size)?;
        let ctl = PlatformShm::acquire(
            control_name,
            size_of::<ChannelCtl>() * 3,
            crate::platform::posix::ShmMode::Create,
        )?;
        unsafe {
            std::ptr::write_bytes(ctl.as_mut_ptr(), 0, ctl.user_size());
        }
        Ok(Self {
            request,
            response,
            event,
            ctl,
        })
    }

    /// Client side: bind response/event (the client is the receiver for
    /// server -> client traffic) and prepare request as a lazy-connecting
    /// sender to the name the server bound.
    pub fn open(base_name: &str, control_name: &str, max_msg_size: u32) -> io::Result<Self> {
        let request =
            DgramSocket::unconnected(socket_path(base_name, Channel::Request), max_msg_size)?;
        let response = DgramSocket::bind(&socket_path(base_name, Channel::Response), max_msg_size)?;
        let event = DgramSocket::bind(&socket_path(base_name, Channel::Event), max_msg_size)?;
        let ctl = PlatformShm::acquire(
            control_name,
            size_of::<ChannelCtl>() * 3,
            crate::platform::posix::ShmMode::Open,
        )?;
        Ok(Self {
            request,
            response,
            event,
            ctl,
        })
    }

    fn socket(&self, channel: Channel) -> &DgramSocket {
        match channel {
            Channel::Request => &self.request,
            Channel::Response => &self.response,
            Channel::Event => &self.event,
        }
    }

    fn ctl_entry(&self, channel: Channel) -> &ChannelCtl {
        unsafe { &*(self.ctl.as_mut_ptr() as *const ChannelCtl).add(channel as usize) }
    }

    /// Send one framed message: an 8-byte `{id, size}` header followed by
    /// the payload.
    pub fn send(&self, channel: Channel, id: u32, payload: &[u8]) -> io::Result<usize> {
        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        let n = self.socket(channel).send(&buf)?;
        self.ctl_entry(channel).sent.fetch_add(1, Ordering::AcqRel);
        Ok(n)
    }

    /// Receive one framed message into `payload_buf`. Returns `(id, len)`.
    /// `timeout_ms` is the same convention as `Notifier::timedwait`: `None`
    /// blocks indefinitely, `Some(0)` polls, `Some(ms)` is a relative
    /// timeout.
    pub fn recv(
        &self,
        channel: Channel,
        payload_buf: &mut [u8],
        timeout_ms: Option<u64>,
    ) -> io::Result<(u32, usize)> {
        let mut framed = vec![0u8; 8 + payload_buf.len()];
        let n = self.socket(channel).recv(&mut framed, timeout_ms)?;
        if n < 8 {
            return Err(io::Error::from_raw_os_error(libc::EBADMSG));
        }
        let id = u32::from_le_bytes(framed[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(framed[4..8].try_into().unwrap()) as usize;
        if n < 8 + size || payload_buf.len() < size {
            return Err(crate::error::too_small());
        }
        payload_buf[..size].copy_from_slice(&framed[8..8 + size]);
        Ok((id, size))
    }

    pub fn q_len_get(&self, channel: Channel) -> i64 {
        self.ctl_entry(channel).sent.load(Ordering::Acquire) as i64
    }

    pub fn fc_set(&self, channel: Channel, level: u32) {
        self.ctl_entry(channel).flow_control.store(level, Ordering::Release);
    }

    pub fn fc_get(&self, channel: Channel) -> u32 {
        self.ctl_entry(channel).flow_control.load(Ordering::Acquire)
    }

    /// The fd to register with the event loop for readiness on `channel`'s
    /// receiving side (request on the server, response/event on the
    /// client — see module docs for the bind/connect direction).
    pub fn raw_fd(&self, channel: Channel) -> RawFd {
        self.socket(channel).raw_fd()
    }
}
