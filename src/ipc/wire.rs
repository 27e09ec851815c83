// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// On-wire message headers and the setup handshake payloads (§6.1). All
// integers are little-endian; header layout is fixed so a peer never has to
// guess field order.

use std::io;

/// Reserved message ids every transport understands before user traffic
/// starts (`QB_IPC_MSG_*` in the reference implementation).
pub const MSG_AUTHENTICATE: u32 = 1;
pub const MSG_NEW_MESSAGE: u32 = 2;
pub const MSG_DISCONNECT: u32 = 3;
pub const MSG_USER_START: u32 = 1000;

pub const HEADER_LEN: usize = 16;

/// Common request/response header: `size | id | error | reserved`, all u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub size: u32,
    pub id: u32,
    pub error: u32,
    pub reserved: u32,
}

impl Header {
    pub fn new(id: u32, size: u32) -> Self {
        Self {
            size,
            id,
            error: 0,
            reserved: 0,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.error.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(Self {
            size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            id: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            error: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            reserved: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// Which transport a connection negotiated during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Shm = 0,
    Socket = 1,
}

impl TransportType {
    pub fn from_u32(v: u32) -> io::Result<Self> {
        match v {
            0 => Ok(TransportType::Shm),
            1 => Ok(TransportType::Socket),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }
}

/// The single message sent by a client over the setup stream socket
/// (`hdr{id=MSG_AUTHENTICATE, size=24}, max_msg_size, reserved`).
pub struct SetupRequest {
    pub max_msg_size: u32,
}

impl SetupRequest {
    pub const WIRE_LEN: usize = HEADER_LEN + 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        let hdr = Header::new(MSG_AUTHENTICATE, Self::WIRE_LEN as u32);
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&hdr.to_bytes());
        buf.extend_from_slice(&self.max_msg_size.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let hdr = Header::from_bytes(buf)?;
        if hdr.id != MSG_AUTHENTICATE || buf.len() < Self::WIRE_LEN {
            return Err(io::Error::from_raw_os_error(libc::EBADMSG));
        }
        let max_msg_size = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        Ok(Self { max_msg_size })
    }
}

/// The fixed-size part of the server's setup response; transport-specific
/// names/paths follow as a length-prefixed byte string (a deliberate
/// simplification of the reference implementation's fixed `NAME_MAX`/
/// `PATH_MAX` buffers, recorded in `DESIGN.md`).
pub struct SetupResponse {
    pub error: u32,
    pub connection_cookie: u64,
    pub transport_type: TransportType,
    pub max_msg_size: u32,
    pub names: Vec<u8>,
}

impl SetupResponse {
    pub const FIXED_LEN: usize = HEADER_LEN + 8 + 4 + 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let hdr = Header {
            size: (Self::FIXED_LEN + 4 + self.names.len()) as u32,
            id: MSG_AUTHENTICATE,
            error: self.error,
            reserved: 0,
        };
        let mut buf = Vec::with_capacity(hdr.size as usize);
        buf.extend_from_slice(&hdr.to_bytes());
        buf.extend_from_slice(&self.connection_cookie.to_le_bytes());
        buf.extend_from_slice(&(self.transport_type as u32).to_le_bytes());
        buf.extend_from_slice(&self.max_msg_size.to_le_bytes());
        buf.extend_from_slice(&(self.names.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.names);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let hdr = Header::from_bytes(buf)?;
        if buf.len() < Self::FIXED_LEN + 4 {
            return Err(io::Error::from_raw_os_error(libc::EBADMSG));
        }
        let connection_cookie = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let transport_type = TransportType::from_u32(u32::from_le_bytes(buf[24..28].try_into().unwrap()))?;
        let max_msg_size = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        let names_len = u32::from_le_bytes(buf[32..36].try_into().unwrap()) as usize;
        let names = buf
            .get(36..36 + names_len)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADMSG))?
            .to_vec();
        Ok(Self {
            error: hdr.error,
            connection_cookie,
            transport_type,
            max_msg_size,
            names,
        })
    }
}

/// Pack the three SHM transport names (`request`, `response`, `event`) into
/// the `SetupResponse::names` blob: each length-prefixed (u16) in order.
pub fn pack_shm_names(request: &str, response: &str, event: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    for s in [request, response, event] {
        buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }
    buf
}

pub fn unpack_shm_names(buf: &[u8]) -> io::Result<(String, String, String)> {
    let bad = || io::Error::from_raw_os_error(libc::EBADMSG);
    let mut names = Vec::with_capacity(3);
    let mut pos = 0;
    for _ in 0..3 {
        let len_bytes: [u8; 2] = buf.get(pos..pos + 2).ok_or_else(bad)?.try_into().unwrap();
        let len = u16::from_le_bytes(len_bytes) as usize;
        pos += 2;
        let s = std::str::from_utf8(buf.get(pos..pos + len).ok_or_else(bad)?)
            .map_err(|_| bad())?
            .to_string();
        pos += len;
        names.push(s);
    }
    Ok((names.remove(0), names.remove(0), names.remove(0)))
}

/// Pack the unix-socket transport's two names (`control` mmap path, socket
/// base name) the same way.
pub fn pack_socket_names(control: &str, base: &str) -> Vec<u8> {
    pack_shm_names(control, base, "")
}

pub fn unpack_socket_names(buf: &[u8]) -> io::Result<(String, String)> {
    let (control, base, _) = unpack_shm_names(buf)?;
    Ok((control, base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = Header::new(MSG_NEW_MESSAGE, 42);
        let bytes = h.to_bytes();
        let back = Header::from_bytes(&bytes).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn setup_request_roundtrip() {
        let req = SetupRequest { max_msg_size: 65536 };
        let bytes = req.to_bytes();
        let back = SetupRequest::from_bytes(&bytes).unwrap();
        assert_eq!(back.max_msg_size, 65536);
    }

    #[test]
    fn setup_response_roundtrip_with_names() {
        let names = pack_shm_names("/dev/shm/qb-x-request", "/dev/shm/qb-x-response", "/dev/shm/qb-x-event");
        let resp = SetupResponse {
            error: 0,
            connection_cookie: 0xdead_beef,
            transport_type: TransportType::Shm,
            max_msg_size: 1 << 20,
            names,
        };
        let bytes = resp.to_bytes();
        let back = SetupResponse::from_bytes(&bytes).unwrap();
        assert_eq!(back.connection_cookie, 0xdead_beef);
        assert_eq!(back.transport_type, TransportType::Shm);
        let (req, rsp, ev) = unpack_shm_names(&back.names).unwrap();
        assert_eq!(req, "/dev/shm/qb-x-request");
        assert_eq!(rsp, "/dev/shm/qb-x-response");
        assert_eq!(ev, "/dev/shm/qb-x-event");
    }
}
