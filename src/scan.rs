use std::io;
use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;
use thiserror::Error;

use crate::identity;
use crate::index::{IdentityIndex, TargetEntry};
use crate::procfs::{self, BackingKind, MappingRecord, Process};

/// One process that holds an executable mapping of a target.
#[derive(Debug, Clone, Serialize)]
pub struct MatchRecord {
    pub pid: u32,
    pub ns_id: u64,
    pub comm: String,
    /// The target path the match was found for, as the user supplied it.
    pub path: PathBuf,
}

/// Everything a run produces: the matches plus the targets that could not
/// be resolved and were skipped.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub matches: Vec<MatchRecord>,
    pub unresolved: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("mapping table unavailable: {0}")]
    MappingUnavailable(#[from] io::Error),
}

/// Walks one process's mapping table against the target index.
pub struct MatchEngine {
    index: IdentityIndex,
}

impl MatchEngine {
    pub fn new(index: IdentityIndex) -> Self {
        Self { index }
    }

    /// Scan one process. A process matches at most once, on the first
    /// qualifying mapping in table order.
    pub fn scan(&self, process: &Process) -> Result<Option<&TargetEntry>, ScanError> {
        let mappings = procfs::read_mappings(process.pid)?;
        Ok(first_match(&self.index, &mappings))
    }
}

/// A mapping qualifies when it is file-backed, readable and executable.
/// Stacks, heaps, anonymous JIT pages and device windows never do, even
/// with matching device/inode numbers.
fn first_match<'a>(index: &'a IdentityIndex, mappings: &[MappingRecord]) -> Option<&'a TargetEntry> {
    mappings
        .iter()
        .filter(|m| m.backing == BackingKind::File && m.perms.read && m.perms.execute)
        .find_map(|m| index.lookup(m.identity))
}

/// Resolve the targets, then sweep every visible process once.
///
/// A target that fails to resolve is reported and skipped; a process whose
/// mapping table cannot be read (it exited, or belongs to another user) is
/// skipped quietly. Only failure to enumerate processes at all is fatal.
pub fn run(target_paths: &[PathBuf]) -> anyhow::Result<RunResult> {
    let mut entries = Vec::new();
    let mut unresolved = Vec::new();
    for path in target_paths {
        match identity::resolve(path) {
            Ok(identity) => {
                log::debug!("{} -> {identity}", path.display());
                entries.push(TargetEntry {
                    identity,
                    source_path: path.clone(),
                });
            }
            Err(e) => {
                log::warn!("skipping target: {e}");
                unresolved.push(path.clone());
            }
        }
    }

    let index = IdentityIndex::build(entries);
    log::debug!(
        "index: {} targets in {} buckets",
        index.len(),
        index.bucket_count()
    );

    let mut matches = Vec::new();
    // No resolved targets means nothing can match; skip the sweep rather
    // than walking every mapping table to find nothing.
    if !index.is_empty() {
        let engine = MatchEngine::new(index);
        let processes = procfs::list_processes().context("enumerating processes")?;
        for process in &processes {
            match engine.scan(process) {
                Ok(Some(entry)) => matches.push(MatchRecord {
                    pid: process.pid,
                    ns_id: process.ns_id,
                    comm: process.comm.clone(),
                    path: entry.source_path.clone(),
                }),
                Ok(None) => {}
                Err(e) => log::debug!("pid {}: {e}", process.pid),
            }
        }
    }

    Ok(RunResult {
        matches,
        unresolved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ObjectIdentity;
    use crate::procfs::Permissions;

    const RX: Permissions = Permissions {
        read: true,
        write: false,
        execute: true,
    };
    const RW: Permissions = Permissions {
        read: true,
        write: true,
        execute: false,
    };

    fn mapping(identity: ObjectIdentity, perms: Permissions, backing: BackingKind) -> MappingRecord {
        MappingRecord {
            start: 0x7000_0000,
            perms,
            backing,
            identity,
        }
    }

    fn target(object_id: u64, path: &str) -> TargetEntry {
        TargetEntry {
            identity: ObjectIdentity {
                volume_id: 0x0010_0001,
                object_id,
            },
            source_path: PathBuf::from(path),
        }
    }

    #[test]
    fn first_qualifying_hit_wins() {
        let index = IdentityIndex::build(vec![target(1, "/a.so"), target(2, "/b.so")]);
        let a = target(1, "").identity;
        let b = target(2, "").identity;

        let mappings = [
            mapping(b, RX, BackingKind::File),
            mapping(a, RX, BackingKind::File),
        ];
        let hit = first_match(&index, &mappings).unwrap();
        assert_eq!(hit.source_path, PathBuf::from("/b.so"));

        let reversed = [
            mapping(a, RX, BackingKind::File),
            mapping(b, RX, BackingKind::File),
        ];
        let hit = first_match(&index, &reversed).unwrap();
        assert_eq!(hit.source_path, PathBuf::from("/a.so"));
    }

    #[test]
    fn non_qualifying_mappings_never_match() {
        let index = IdentityIndex::build(vec![target(1, "/a.so")]);
        let id = target(1, "").identity;

        // Right identity, wrong protection or backing.
        let mappings = [
            mapping(id, RW, BackingKind::File),
            mapping(id, RX, BackingKind::Anonymous),
            mapping(id, RX, BackingKind::Device),
            mapping(id, RX, BackingKind::Other),
            mapping(
                id,
                Permissions {
                    read: false,
                    write: false,
                    execute: true,
                },
                BackingKind::File,
            ),
        ];
        assert!(first_match(&index, &mappings).is_none());
    }

    #[test]
    fn writable_executable_file_mapping_still_matches() {
        // Read and execute are required; write is not disqualifying.
        let index = IdentityIndex::build(vec![target(1, "/a.so")]);
        let id = target(1, "").identity;
        let mappings = [mapping(
            id,
            Permissions {
                read: true,
                write: true,
                execute: true,
            },
            BackingKind::File,
        )];
        assert!(first_match(&index, &mappings).is_some());
    }

    #[test]
    fn repeated_sweeps_of_a_fixed_snapshot_agree() {
        let index = IdentityIndex::build(vec![target(1, "/a.so")]);
        let mappings = [mapping(target(1, "").identity, RX, BackingKind::File)];

        let first = first_match(&index, &mappings).map(|e| e.source_path.clone());
        let second = first_match(&index, &mappings).map(|e| e.source_path.clone());
        assert_eq!(first, second);
    }

    #[test]
    fn run_reports_the_test_process_for_its_own_executable() {
        let exe = std::fs::read_link("/proc/self/exe").unwrap();
        let result = run(std::slice::from_ref(&exe)).unwrap();

        assert!(result.unresolved.is_empty());
        let me = result
            .matches
            .iter()
            .find(|m| m.pid == std::process::id())
            .expect("own executable must be mapped r-x by this process");
        assert_eq!(me.path, exe);
        assert!(!me.comm.is_empty());
    }

    #[test]
    fn unresolvable_target_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone.so");
        let result = run(std::slice::from_ref(&missing)).unwrap();

        assert_eq!(result.unresolved, vec![missing]);
        assert!(result.matches.is_empty());
    }
}
