use std::path::PathBuf;

use rand::Rng;

use crate::identity::ObjectIdentity;

/// A target the user asked about, keyed by identity but reported by the
/// path it was supplied under.
#[derive(Debug, Clone)]
pub struct TargetEntry {
    pub identity: ObjectIdentity,
    pub source_path: PathBuf,
}

/// Byte-substitution hash: each input byte selects a random word and the
/// words are XOR-folded together.
///
/// The fold is order-insensitive, so the table alone does not distinguish
/// permuted inputs; chains resolve those by full identity comparison.
struct XorTable {
    words: [u32; 256],
}

impl XorTable {
    /// A fresh table per run. Hash values are not stable across runs and
    /// nothing may depend on them being so.
    fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut words = [0u32; 256];
        for w in words.iter_mut() {
            *w = rng.gen();
        }
        Self { words }
    }

    fn hash(&self, bytes: &[u8]) -> u32 {
        bytes
            .iter()
            .fold(0, |acc, &b| acc ^ self.words[b as usize])
    }
}

const NIL: u32 = u32::MAX;

/// Identity-keyed lookup table over the targets, built once per run and
/// read-only afterwards.
///
/// Buckets hold chain heads into a flat entry arena; collisions chain
/// through `next`. With one probe page per process mapping riding on each
/// lookup, the chain walk is never the hot part.
pub struct IdentityIndex {
    table: XorTable,
    entries: Vec<TargetEntry>,
    next: Vec<u32>,
    heads: Vec<u32>,
    mask: u32,
}

impl IdentityIndex {
    /// Build the index over `entries`. The bucket count is the smallest
    /// power of two holding twice the entries.
    pub fn build(entries: Vec<TargetEntry>) -> Self {
        let table = XorTable::random();
        let buckets = (entries.len() * 2).next_power_of_two();
        let mask = (buckets - 1) as u32;

        let mut heads = vec![NIL; buckets];
        let mut next = vec![NIL; entries.len()];
        // Insert at chain heads walking backwards, so each chain lists
        // entries in the order they were supplied.
        for (i, entry) in entries.iter().enumerate().rev() {
            let bucket = (table.hash(&entry.identity.as_bytes()) & mask) as usize;
            next[i] = heads[bucket];
            heads[bucket] = i as u32;
        }

        Self {
            table,
            entries,
            next,
            heads,
            mask,
        }
    }

    /// Find the target with this identity, if any. Hash narrows to a
    /// chain; equality on the full identity decides.
    pub fn lookup(&self, identity: ObjectIdentity) -> Option<&TargetEntry> {
        let bucket = (self.table.hash(&identity.as_bytes()) & self.mask) as usize;
        let mut slot = self.heads[bucket];
        while slot != NIL {
            let entry = &self.entries[slot as usize];
            if entry.identity == identity {
                return Some(entry);
            }
            slot = self.next[slot as usize];
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.heads.len()
    }
}
