use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapOptions;
use thiserror::Error;

use crate::procfs::{self, BackingKind};

/// Canonical identity of a filesystem object: the device/inode pair the
/// kernel's mapping subsystem reports for it.
///
/// Two mappings backed by the same object carry equal identities no matter
/// which path or mount layer they were reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectIdentity {
    /// Device number in kernel dev_t layout: `(major << 20) | minor`.
    pub volume_id: u32,
    /// Inode number on that device.
    pub object_id: u64,
}

impl ObjectIdentity {
    /// Canonical byte form hashed by the index: little-endian volume id
    /// followed by little-endian object id.
    pub fn as_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&self.volume_id.to_le_bytes());
        bytes[4..].copy_from_slice(&self.object_id.to_le_bytes());
        bytes
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Same shape as the dev:inode columns of /proc/*/maps.
        write!(
            f,
            "{:02x}:{:02x}/{}",
            self.volume_id >> 20,
            self.volume_id & 0xfffff,
            self.object_id
        )
    }
}

/// Why a target path could not be resolved to an identity.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("{}: no such file", .path.display())]
    NotFound { path: PathBuf },
    #[error("{}: permission denied", .path.display())]
    AccessDenied { path: PathBuf },
    #[error("opening {}: {source}", .path.display())]
    OpenFailed { path: PathBuf, source: io::Error },
    #[error("mapping a probe page of {}: {source}", .path.display())]
    MapFailed { path: PathBuf, source: io::Error },
    #[error("reading own mapping table for {}: {source}", .path.display())]
    SelfScanFailed { path: PathBuf, source: io::Error },
    #[error("probe mapping of {} not present in own mapping table", .path.display())]
    IdentityUnresolved { path: PathBuf },
}

/// Resolve `path` to the identity other processes' mappings of the same
/// object carry.
///
/// Asking the path itself (`stat`) is not reliable: overlay/union mounts
/// synthesize a per-mount device id for merged paths, while `/proc/*/maps`
/// reports the real backing file. So we ask the mapping subsystem instead:
/// map one page of the file into our own address space, then read back what
/// `/proc/self/maps` says is backing that page. The probe mapping and the
/// file handle are dropped on every exit path.
pub fn resolve(path: &Path) -> Result<ObjectIdentity, ResolutionError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ResolutionError::NotFound {
            path: path.to_path_buf(),
        },
        io::ErrorKind::PermissionDenied => ResolutionError::AccessDenied {
            path: path.to_path_buf(),
        },
        _ => ResolutionError::OpenFailed {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    let probe = unsafe { MmapOptions::new().len(page_size()).map(&file) }.map_err(|e| {
        ResolutionError::MapFailed {
            path: path.to_path_buf(),
            source: e,
        }
    })?;
    let start = probe.as_ptr() as usize;

    let mappings =
        procfs::read_self_mappings().map_err(|source| ResolutionError::SelfScanFailed {
            path: path.to_path_buf(),
            source,
        })?;

    mappings
        .iter()
        .find(|m| m.start == start && m.backing == BackingKind::File)
        .map(|m| m.identity)
        .ok_or_else(|| ResolutionError::IdentityUnresolved {
            path: path.to_path_buf(),
        })
}

/// One page, the smallest granularity the probe can map.
fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}
