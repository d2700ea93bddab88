use super::{Index, Term};

use std::sync::atomic::{AtomicU64, Ordering};

/// Read-only coordinates of the replicated log. The consensus layer treats
/// log contents as opaque and only compares coordinates; appending,
/// replication, and recovery are the log collaborator's responsibility.
pub trait LogManager: Send + Sync {
    /// The index of the last appended entry, 0 if none.
    fn last_log_index(&self) -> Index;
    /// The term of the last appended entry, 0 if none.
    fn last_log_term(&self) -> Term;
    /// The index of the last committed entry, 0 if none.
    fn commit_log_index(&self) -> Index;
}

/// An in-memory log position, for bootstrap and tests.
#[derive(Debug, Default)]
pub struct MemoryLog {
    last_index: AtomicU64,
    last_term: AtomicU64,
    commit_index: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an appended entry at the given term, returning its index.
    pub fn append(&self, term: Term) -> Index {
        self.last_term.store(term, Ordering::Relaxed);
        self.last_index.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Advances the commit index. Never regresses.
    pub fn commit(&self, index: Index) {
        self.commit_index.fetch_max(index, Ordering::Relaxed);
    }
}

impl LogManager for MemoryLog {
    fn last_log_index(&self) -> Index {
        self.last_index.load(Ordering::Relaxed)
    }

    fn last_log_term(&self) -> Term {
        self.last_term.load(Ordering::Relaxed)
    }

    fn commit_log_index(&self) -> Index {
        self.commit_index.load(Ordering::Relaxed)
    }
}
