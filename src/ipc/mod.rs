// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Service/connection protocol atop the shared-memory ring buffer and
// cooperative event loop: setup handshake, transport negotiation (SHM or
// unix-socket), request/response/event dispatch (§3-§4.7 of the design
// document this crate implements).

pub mod connection;
pub mod handle;
pub mod transport;
pub mod wire;

mod service;

pub use connection::{ConnectionState, IpcConnection, IpcsConnection};
pub use handle::{Handle, HandleTable};
pub use service::{IpcService, ServiceHandlers};
pub use transport::Transport;
