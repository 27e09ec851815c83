// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Connection state: the client's `IpcConnection` (performs the setup
// handshake and owns the negotiated transport) and the server's
// `IpcsConnection` (what `IpcService` keeps per accepted peer, §4.7).

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::net::UnixStream;

use crate::buffer::IpcBuffer;
use crate::config::Config;
use crate::ipc::handle::Handle;
use crate::ipc::transport::shm::ShmTransport;
use crate::ipc::transport::socket::SocketTransport;
use crate::ipc::transport::Transport;
use crate::ipc::wire::{
    pack_shm_names, pack_socket_names, unpack_shm_names, unpack_socket_names, SetupRequest,
    SetupResponse, TransportType,
};
use crate::platform::posix::{peer_credentials, recv_with_fds, send_with_fds, PeerCred};

/// Server-side connection lifecycle, mirroring `qb_ipcs_connection_state`
/// (`ipcs.c`): a connection is only live traffic once `Established`, and a
/// disconnect may have to wait in `ShuttingDown` for the owning service's
/// `connection_closed` callback to agree to let go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Inactive,
    Active,
    Established,
    ShuttingDown,
}

/// Default flow-control threshold a client applies to the server's FC
/// level, matching `qb_ipcc_connect`'s `c->fc_enable_max = 1`: only FC
/// level 1 (not 2) turns into `EAGAIN` until the client raises it via
/// `fc_enable_max_set`.
pub const DEFAULT_FC_ENABLE_MAX: u32 = 1;

/// What the server keeps per accepted connection.
pub struct IpcsConnection {
    pub handle: Handle,
    pub transport: Transport,
    /// Kept open for the lifetime of the connection purely so the fd isn't
    /// leaked; closing it is how the client notices the server has gone
    /// away if the transport itself gives no other signal.
    setup: UnixStream,
    pub state: Cell<ConnectionState>,
    pub peer: PeerCred,
    pub max_msg_size: u32,
    pub receive_buf: RefCell<IpcBuffer>,
    pub description: String,
    pub fc_enable_max: u32,
    pub refcount: Cell<u32>,
}

impl IpcsConnection {
    pub fn new(
        handle: Handle,
        transport: Transport,
        setup: UnixStream,
        peer: PeerCred,
        max_msg_size: u32,
        description: String,
    ) -> Self {
        let mut receive_buf = IpcBuffer::new();
        receive_buf.reserve(max_msg_size as usize);
        Self {
            handle,
            transport,
            setup,
            state: Cell::new(ConnectionState::Active),
            peer,
            max_msg_size,
            receive_buf: RefCell::new(receive_buf),
            description,
            fc_enable_max: DEFAULT_FC_ENABLE_MAX,
            refcount: Cell::new(1),
        }
    }

    pub fn ref_inc(&self) {
        self.refcount.set(self.refcount.get() + 1);
    }

    /// Drop a reference; `true` once it reaches zero and the connection can
    /// actually be freed from the handle table.
    pub fn ref_dec(&self) -> bool {
        let n = self.refcount.get().saturating_sub(1);
        self.refcount.set(n);
        n == 0
    }

    /// Requests queued but not yet drained, clamped the way
    /// `_request_q_len_get` clamps per dispatch priority (§4.7): 50 at
    /// high priority, 5 at medium, 1 at low.
    pub fn request_q_len(&self, max: i64) -> i64 {
        self.transport.request_q_len().min(max)
    }
}

/// Client-side connection: owns the negotiated transport plus the scratch
/// buffer sized to the negotiated `max_msg_size`.
pub struct IpcConnection {
    transport: Transport,
    setup: UnixStream,
    max_msg_size: u32,
    receive_buf: RefCell<IpcBuffer>,
    connected: Cell<bool>,
    server_pid: u32,
    fc_enable_max: Cell<u32>,
}

impl IpcConnection {
    /// Connect to a server listening on `name`'s setup socket
    /// (`{socket_dir}/{name}.socket`). Sends `SetupRequest`, reads
    /// `SetupResponse`, and attaches to whichever transport the server
    /// chose.
    pub fn connect(name: &str, requested_max_msg_size: u32, cfg: &Config) -> io::Result<Self> {
        let setup_path = cfg.socket_dir.join(format!("{name}.socket"));
        let setup = UnixStream::connect(&setup_path)?;
        let setup_fd = std::os::unix::io::AsRawFd::as_raw_fd(&setup);

        let req = SetupRequest {
            max_msg_size: requested_max_msg_size,
        };
        send_with_fds(setup_fd, &req.to_bytes(), &[])?;

        // The server writes the whole response (header + names blob) with a
        // single `sendmsg`, ancillary fds attached; read it back in one
        // `recvmsg` rather than splitting header and body across two reads,
        // since SCM_RIGHTS is only guaranteed to surface on the recvmsg call
        // that consumes the bytes it rode in with.
        let mut raw = vec![0u8; 512];
        let (n, fds) = recv_with_fds(setup_fd, &mut raw, 6)?;
        if n < crate::ipc::wire::HEADER_LEN {
            return Err(io::Error::from_raw_os_error(libc::EBADMSG));
        }
        raw.truncate(n);
        let resp = SetupResponse::from_bytes(&raw)?;
        if resp.error != 0 {
            return Err(io::Error::from_raw_os_error(resp.error as i32));
        }

        let transport = match resp.transport_type {
            TransportType::Shm => {
                let (request_name, response_name, event_name) = unpack_shm_names(&resp.names)?;
                let shm = if fds.len() == 6 {
                    Transport::Shm(ShmTransport::open_with_notifiers(
                        &request_name,
                        &response_name,
                        &event_name,
                        crate::notifier::Notifier::from_eventfd_pair(fds[0], fds[1]),
                        crate::notifier::Notifier::from_eventfd_pair(fds[2], fds[3]),
                        crate::notifier::Notifier::from_eventfd_pair(fds[4], fds[5]),
                    )?)
                } else {
                    Transport::Shm(ShmTransport::open(&request_name, &response_name, &event_name)?)
                };
                shm
            }
            TransportType::Socket => {
                let (control_name, base_name) = unpack_socket_names(&resp.names)?;
                Transport::Socket(SocketTransport::open(&base_name, &control_name, resp.max_msg_size)?)
            }
        };

        let peer = peer_credentials(setup_fd).unwrap_or_default();
        let mut receive_buf = IpcBuffer::new();
        receive_buf.reserve(resp.max_msg_size as usize);

        Ok(Self {
            transport,
            setup,
            max_msg_size: resp.max_msg_size,
            receive_buf: RefCell::new(receive_buf),
            connected: Cell::new(true),
            server_pid: peer.pid,
            fc_enable_max: Cell::new(DEFAULT_FC_ENABLE_MAX),
        })
    }

    /// Adjust how aggressively this connection backs off under server flow
    /// control (`qb_ipcc_fc_enable_max_set`: valid range `0..=2`).
    pub fn fc_enable_max_set(&self, max: u32) -> io::Result<()> {
        if max > 2 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.fc_enable_max.set(max);
        Ok(())
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.max_msg_size as usize {
            return Err(crate::error::msg_too_large());
        }
        let fc = self.transport.fc_get();
        if fc > 0 && fc <= self.fc_enable_max.get() {
            return Err(crate::error::would_block());
        }
        self.transport.send_request(buf).inspect_err(|e| {
            if crate::error::is_disconnect(e) {
                self.connected.set(false);
            }
        })
    }

    pub fn recv(&self, timeout_ms: Option<u64>) -> io::Result<IpcBuffer> {
        let mut scratch = vec![0u8; self.max_msg_size as usize];
        let n = self
            .transport
            .recv_response(&mut scratch, timeout_ms)
            .inspect_err(|e| {
                if crate::error::is_disconnect(e) {
                    self.connected.set(false);
                }
            })?;
        scratch.truncate(n);
        let mut guard = self.receive_buf.borrow_mut();
        *guard = IpcBuffer::from_vec(scratch);
        Ok(guard.clone())
    }

    pub fn recv_event(&self, timeout_ms: Option<u64>) -> io::Result<IpcBuffer> {
        let mut scratch = vec![0u8; self.max_msg_size as usize];
        let n = self.transport.recv_event(&mut scratch, timeout_ms)?;
        scratch.truncate(n);
        Ok(IpcBuffer::from_vec(scratch))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub fn server_pid(&self) -> u32 {
        self.server_pid
    }

    pub fn fc_get(&self) -> u32 {
        self.transport.fc_get()
    }

    /// Tell the server to tear the connection down: a bare
    /// `MSG_DISCONNECT` header over the request channel, which `dispatch`
    /// recognizes the same way it recognizes any other reserved message id
    /// before ever reaching `msg_process`. Idempotent.
    pub fn disconnect(&self) {
        if !self.connected.replace(false) {
            return;
        }
        let hdr = crate::ipc::wire::Header::new(
            crate::ipc::wire::MSG_DISCONNECT,
            crate::ipc::wire::HEADER_LEN as u32,
        );
        let _ = self.transport.send_request(&hdr.to_bytes());
    }
}

impl Drop for IpcConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Pack the names a server hands back in `SetupResponse` for a freshly
/// created SHM transport.
pub fn shm_setup_names(base_name: &str) -> Vec<u8> {
    pack_shm_names(
        &format!("{base_name}-request"),
        &format!("{base_name}-response"),
        &format!("{base_name}-event"),
    )
}

/// Pack the names a server hands back in `SetupResponse` for a freshly
/// created unix-socket transport.
pub fn socket_setup_names(control_name: &str, base_name: &str) -> Vec<u8> {
    pack_socket_names(control_name, base_name)
}
