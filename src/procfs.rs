//! The narrow /proc windows the engine needs: the process list and
//! per-process mapping tables.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;

use crate::identity::ObjectIdentity;

/// One running process, as much of it as the report needs.
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: u32,
    pub comm: String,
    /// Inode of `/proc/<pid>/ns/pid`; 0 when unreadable.
    pub ns_id: u64,
}

/// What a mapping is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    /// A regular file on some volume.
    File,
    /// Anonymous memory.
    Anonymous,
    /// A device node.
    Device,
    /// Kernel pseudo-entries like `[stack]` or `[vdso]`.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

/// One line of a mapping table.
#[derive(Debug, Clone, Copy)]
pub struct MappingRecord {
    /// Start address of the region in the owning process's address space.
    pub start: usize,
    pub perms: Permissions,
    pub backing: BackingKind,
    /// Zeroed for anonymous and pseudo entries.
    pub identity: ObjectIdentity,
}

/// Enumerate every process visible under /proc. Failure to read the
/// directory itself is fatal to the caller; there is no result to report
/// without the process list.
pub fn list_processes() -> io::Result<Vec<Process>> {
    let mut processes = Vec::new();
    for entry in fs::read_dir("/proc")?.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        processes.push(read_process(pid));
    }
    Ok(processes)
}

fn read_process(pid: u32) -> Process {
    let comm = fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| "?".to_string());
    let ns_id = fs::metadata(format!("/proc/{pid}/ns/pid"))
        .map(|m| m.ino())
        .unwrap_or(0);
    Process { pid, comm, ns_id }
}

/// Read the mapping table of `pid`. Races with process exit and
/// permission walls both surface as errors here; the caller decides how
/// loudly to care.
pub fn read_mappings(pid: u32) -> io::Result<Vec<MappingRecord>> {
    let content = fs::read_to_string(format!("/proc/{pid}/maps"))?;
    Ok(parse_maps(&content))
}

/// Read our own mapping table, the other half of the identity probe.
pub fn read_self_mappings() -> io::Result<Vec<MappingRecord>> {
    let content = fs::read_to_string("/proc/self/maps")?;
    Ok(parse_maps(&content))
}

fn parse_maps(content: &str) -> Vec<MappingRecord> {
    content.lines().filter_map(parse_maps_line).collect()
}

/// Parse one maps line:
/// `start-end perms offset dev:inode      pathname`.
/// Fields are single-space separated; the pathname is padded and may be
/// absent. Lines that do not fit the shape are dropped.
fn parse_maps_line(line: &str) -> Option<MappingRecord> {
    let mut fields = line.splitn(6, ' ');
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let dev = fields.next()?;
    let inode = fields.next()?;
    let path = fields.next().map(str::trim_start).unwrap_or("").trim_end();

    let start = usize::from_str_radix(range.split('-').next()?, 16).ok()?;

    let perms = perms.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    let perms = Permissions {
        read: perms[0] == b'r',
        write: perms[1] == b'w',
        execute: perms[2] == b'x',
    };

    let (major, minor) = dev.split_once(':')?;
    let major = u32::from_str_radix(major, 16).ok()?;
    let minor = u32::from_str_radix(minor, 16).ok()?;
    let object_id: u64 = inode.parse().ok()?;

    // /dev/shm is a tmpfs mount: entries under it are regular files with
    // real identities, not device nodes.
    let backing = if path.starts_with('[') {
        BackingKind::Other
    } else if path.starts_with("/dev/") && !path.starts_with("/dev/shm/") {
        BackingKind::Device
    } else if object_id != 0 {
        BackingKind::File
    } else {
        BackingKind::Anonymous
    };

    Some(MappingRecord {
        start,
        perms,
        backing,
        identity: ObjectIdentity {
            volume_id: device_id(major, minor),
            object_id,
        },
    })
}

/// Kernel dev_t layout: 12 bits of major above 20 bits of minor.
fn device_id(major: u32, minor: u32) -> u32 {
    (major << 20) | minor
}
