// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Environment-driven configuration. Read once via `Config::from_env()`
// rather than scattering `std::env::var` calls through the transport and
// service code.

use std::path::PathBuf;

/// Runtime configuration toggles, read from the environment once at
/// startup. All fields have defaults matching a vanilla Linux host with a
/// writable `/dev/shm`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fallback directory for socket/mmap backing files when `/dev/shm` is
    /// unusable. Corresponds to `SOCKETDIR`.
    pub socket_dir: PathBuf,
    /// Force filesystem-bound unix sockets even on Linux (where abstract
    /// socket names would otherwise be used). Corresponds to
    /// `FORCESOCKETSFILE`.
    pub force_sockets_file: bool,
    /// Disable the SHM transport entirely, always negotiating the unix
    /// socket transport instead. Corresponds to the reference
    /// implementation's build-time `DISABLE_IPC_SHM`, expressed here as a
    /// runtime toggle since this crate has no separate build-time
    /// configuration mechanism.
    pub disable_shm: bool,
}

impl Config {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            socket_dir: std::env::var_os("QB_SOCKETDIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_socket_dir),
            force_sockets_file: std::env::var_os("QB_FORCESOCKETSFILE").is_some(),
            disable_shm: std::env::var("QB_DISABLE_SHM")
                .map(|v| v != "0" && !v.is_empty())
                .unwrap_or(false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_socket_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        return shm;
    }
    std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        std::env::remove_var("QB_SOCKETDIR");
        std::env::remove_var("QB_FORCESOCKETSFILE");
        std::env::remove_var("QB_DISABLE_SHM");
        let cfg = Config::from_env();
        assert!(!cfg.force_sockets_file);
        assert!(!cfg.disable_shm);
    }
}
