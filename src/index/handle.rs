//! Shared, swappable reference to the index serving queries.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use super::VectorIndex;

/// Copy-then-swap holder for the live index.
///
/// Readers take an `Arc` snapshot and search it without holding the lock;
/// a rebuild constructs a complete new index and swaps the pointer, so an
/// in-flight search never sees a partially built index.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    inner: Arc<RwLock<Arc<VectorIndex>>>,
}

impl IndexHandle {
    /// Wraps an initial index.
    pub fn new(index: VectorIndex) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(index))),
        }
    }

    /// Current index.
    pub fn snapshot(&self) -> Arc<VectorIndex> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Installs `index` and returns the one it replaced.
    pub fn swap(&self, index: VectorIndex) -> Arc<VectorIndex> {
        let next = Arc::new(index);
        let rows = next.len();
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *guard, next);
        info!(rows, previous_rows = previous.len(), "index swapped");
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::index::tests::meta;
    use crate::index::IndexEntry;

    #[test]
    fn held_snapshot_survives_swap() {
        let mut first = VectorIndex::new(IndexConfig::default());
        first
            .add(vec![IndexEntry::new(vec![1.0, 0.0], meta("old#0", "old"))])
            .expect("adds");
        let handle = IndexHandle::new(first);
        let before = handle.snapshot();

        let mut second = VectorIndex::new(IndexConfig::default());
        second
            .add(vec![
                IndexEntry::new(vec![1.0, 0.0], meta("new#0", "new")),
                IndexEntry::new(vec![0.0, 1.0], meta("new#1", "new")),
            ])
            .expect("adds");
        let replaced = handle.swap(second);

        assert_eq!(replaced.len(), 1);
        let old_hits = before.search(&[1.0, 0.0], 5).expect("old snapshot");
        assert_eq!(old_hits.len(), 1);
        assert_eq!(old_hits[0].chunk_id(), "old#0");
        let new_hits = handle.snapshot().search(&[1.0, 0.0], 5).expect("new snapshot");
        assert_eq!(new_hits[0].chunk_id(), "new#0");
        assert_eq!(new_hits.len(), 2);
    }
}
