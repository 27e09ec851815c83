// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A shared-memory segment mapped twice back to back, so that a ring buffer
// built on top of it can treat every byte offset as if it had infinite,
// contiguous forward runway: a read or write that wraps past the end of the
// segment lands on the same bytes as if it had started over at the
// beginning, without any code having to special-case the wraparound.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::shm_name;

/// A POSIX shared-memory segment, mapped twice at adjacent virtual
/// addresses (`addr` and `addr + len`), both backed by the same file
/// descriptor. A pointer offset anywhere in `[0, 2*len)` is valid and the
/// second half mirrors the first.
pub struct Sms {
    addr: *mut u8,
    len: usize,
    name: String,
    owner: bool,
}

// Safety: the segment is designed for concurrent cross-process access;
// callers are responsible for synchronizing their own reads/writes.
unsafe impl Send for Sms {}
unsafe impl Sync for Sms {}

impl Sms {
    /// Create a new named segment of `len` bytes, rounded up to the system
    /// page size. Fails with `EEXIST` if a segment with this name already
    /// exists.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        Self::open_with(name, len, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, true)
    }

    /// Open an existing named segment, sized to its current backing file.
    pub fn open(name: &str, len: usize) -> io::Result<Self> {
        Self::open_with(name, len, libc::O_RDWR, false)
    }

    fn open_with(name: &str, len: usize, oflag: libc::c_int, owner: bool) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "len is 0"));
        }
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let real_len = round_up(len, page_size);

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0o666) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::fchmod(fd, 0o666) };

        if owner {
            if unsafe { libc::ftruncate(fd, real_len as libc::off_t) } != 0 {
                let e = io::Error::last_os_error();
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(e);
            }
        }

        let addr = match double_map(fd, real_len) {
            Ok(a) => a,
            Err(e) => {
                unsafe { libc::close(fd) };
                if owner {
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
                return Err(e);
            }
        };

        unsafe { libc::close(fd) };

        Ok(Self {
            addr,
            len: real_len,
            name: posix_name,
            owner,
        })
    }

    /// Base address of the first mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.addr
    }

    /// Mutable base address of the first mapping.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Size of a single mapping, in bytes (page-rounded).
    pub fn len(&self) -> usize {
        self.len
    }

    /// POSIX name of the backing segment (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unlink the backing file. The mapping remains valid until dropped.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for Sms {
    fn drop(&mut self) {
        if !self.addr.is_null() {
            unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len * 2) };
        }
        if self.owner {
            self.unlink();
        }
    }
}

fn round_up(size: usize, align: usize) -> usize {
    ((size + align - 1) / align) * align
}

/// Reserve `2*len` bytes of address space, then map `fd` twice into the
/// first and second half with `MAP_FIXED | MAP_SHARED`.
fn double_map(fd: i32, len: usize) -> io::Result<*mut u8> {
    let reserve = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len * 2,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if reserve == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    let first = unsafe {
        libc::mmap(
            reserve,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if first != reserve {
        unsafe { libc::munmap(reserve, len * 2) };
        return Err(io::Error::last_os_error());
    }

    let second_addr = unsafe { (reserve as *mut u8).add(len) } as *mut libc::c_void;
    let second = unsafe {
        libc::mmap(
            second_addr,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if second != second_addr {
        unsafe { libc::munmap(reserve, len * 2) };
        return Err(io::Error::last_os_error());
    }

    Ok(reserve as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraparound_mirrors_first_half() {
        let name = format!("/qb-sms-test-{}", std::process::id());
        let sms = Sms::create(&name, 4096).unwrap();
        unsafe {
            *sms.as_mut_ptr() = 0x42;
            assert_eq!(*sms.as_mut_ptr().add(sms.len()), 0x42);
            *sms.as_mut_ptr().add(sms.len()) = 0x43;
            assert_eq!(*sms.as_mut_ptr(), 0x43);
        }
    }

    #[test]
    fn create_twice_fails_with_eexist() {
        let name = format!("/qb-sms-test-dup-{}", std::process::id());
        let _a = Sms::create(&name, 4096).unwrap();
        let b = Sms::create(&name, 4096);
        assert!(b.is_err());
    }
}
