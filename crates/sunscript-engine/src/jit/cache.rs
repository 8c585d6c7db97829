//! Trace cache
//!
//! Maps loop-head pcs to compiled traces, and blacklists sites whose
//! recording aborted or whose compile was declined so the recorder does
//! not spin on them.

use crate::jit::backend::TraceHandle;
use crate::jit::snapshot::Snapshot;
use rustc_hash::{FxHashMap, FxHashSet};

/// One compiled trace and the VM-side state to exit it
#[derive(Debug)]
pub struct TraceEntry {
    /// Loop-head pc the trace anchors at.
    pub start_pc: usize,
    /// Back-end handle.
    pub handle: TraceHandle,
    /// Exit snapshots, indexed by id; each carries its resume pc.
    pub snapshots: Vec<Snapshot>,
    /// Snapshot id restoring loop-head state.
    pub head_snap: u16,
}

/// pc → compiled trace map with abort blacklisting
#[derive(Default)]
pub struct TraceCache {
    entries: FxHashMap<usize, TraceEntry>,
    blacklist: FxHashSet<usize>,
}

impl TraceCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        TraceCache::default()
    }

    /// Compiled trace anchored at `pc`, if any.
    pub fn get(&self, pc: usize) -> Option<&TraceEntry> {
        self.entries.get(&pc)
    }

    /// Whether `pc` has a compiled trace.
    pub fn contains(&self, pc: usize) -> bool {
        self.entries.contains_key(&pc)
    }

    /// Store a compiled trace.
    pub fn insert(&mut self, entry: TraceEntry) {
        self.entries.insert(entry.start_pc, entry);
    }

    /// Remove a compiled trace (deoptimized for good).
    pub fn remove(&mut self, pc: usize) -> Option<TraceEntry> {
        self.entries.remove(&pc)
    }

    /// Mark a site as not worth recording again.
    pub fn blacklist(&mut self, pc: usize) {
        self.blacklist.insert(pc);
    }

    /// Whether recording at `pc` previously failed.
    pub fn is_blacklisted(&self, pc: usize) -> bool {
        self.blacklist.contains(&pc)
    }

    /// Drop every entry and blacklist mark (new program image).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.blacklist.clear();
    }

    /// Number of compiled traces.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no traces are cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut cache = TraceCache::new();
        cache.insert(TraceEntry {
            start_pc: 12,
            handle: TraceHandle(0),
            snapshots: vec![],
            head_snap: 0,
        });
        assert!(cache.contains(12));
        assert_eq!(cache.get(12).unwrap().handle, TraceHandle(0));
        assert!(!cache.contains(13));
    }

    #[test]
    fn test_blacklist() {
        let mut cache = TraceCache::new();
        cache.blacklist(30);
        assert!(cache.is_blacklisted(30));
        assert!(!cache.is_blacklisted(31));

        cache.clear();
        assert!(!cache.is_blacklisted(30));
    }
}
