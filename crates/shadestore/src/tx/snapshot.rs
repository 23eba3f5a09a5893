//! Read access to committed generations

use std::collections::BTreeMap;

use crate::btree::PageSource;
use crate::db::ShadeStore;
use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::page::PageId;
use crate::storage::PageStore;

/// Published state shared by readers and the committing writer
#[derive(Debug)]
pub(crate) struct SnapshotState {
    /// Meta of the last commit
    pub(crate) meta: Meta,

    /// Free plus pending pages as of the last commit
    pub(crate) free_pages: u64,

    /// Pages of the persisted free list as of the last commit
    pub(crate) freelist_pages: u64,

    /// Live snapshots per generation
    readers: BTreeMap<u64, usize>,
}

impl SnapshotState {
    pub(crate) fn new(meta: Meta, free_pages: u64, freelist_pages: u64) -> Self {
        Self {
            meta,
            free_pages,
            freelist_pages,
            readers: BTreeMap::new(),
        }
    }

    fn register(&mut self, generation: u64) {
        *self.readers.entry(generation).or_default() += 1;
    }

    fn unregister(&mut self, generation: u64) {
        if let Some(count) = self.readers.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                self.readers.remove(&generation);
            }
        }
    }

    /// Generation of the oldest live snapshot.
    pub(crate) fn oldest_reader(&self) -> Option<u64> {
        self.readers.keys().next().copied()
    }

    pub(crate) fn reader_count(&self) -> usize {
        self.readers.values().sum()
    }
}

/// One committed generation seen through a borrowed store
pub(crate) struct PageView<'a> {
    pub(crate) store: &'a PageStore,
    pub(crate) meta: Meta,
}

impl PageSource for PageView<'_> {
    fn root(&self) -> PageId {
        self.meta.root
    }

    fn page_count(&self) -> u32 {
        self.meta.page_count
    }

    fn page_size(&self) -> usize {
        self.meta.page_size as usize
    }

    fn with_page<R, F>(&self, id: PageId, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        if !id.is_data_page(self.meta.page_count) {
            return Err(Error::corrupted(
                id,
                format!("page outside {} pages in use", self.meta.page_count),
            ));
        }
        Ok(f(self.store.page(id)))
    }
}

/// Registered reader of one committed generation.
///
/// Pages reachable from the generation are not reused while the snapshot
/// is alive.
pub(crate) struct Snapshot<'db> {
    db: &'db ShadeStore,
    meta: Meta,
}

impl<'db> Snapshot<'db> {
    /// Snapshot of the last commit.
    pub(crate) fn new(db: &'db ShadeStore) -> Self {
        let mut state = db.snapshots.lock();
        let meta = state.meta;
        state.register(meta.generation);
        Snapshot { db, meta }
    }

    /// Second registration of the same generation.
    pub(crate) fn fork(&self) -> Snapshot<'db> {
        self.db.snapshots.lock().register(self.meta.generation);
        Snapshot {
            db: self.db,
            meta: self.meta,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.meta.generation
    }
}

impl PageSource for Snapshot<'_> {
    fn root(&self) -> PageId {
        self.meta.root
    }

    fn page_count(&self) -> u32 {
        self.meta.page_count
    }

    fn page_size(&self) -> usize {
        self.meta.page_size as usize
    }

    fn with_page<R, F>(&self, id: PageId, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let store = self.db.store.read();
        PageView {
            store: &store,
            meta: self.meta,
        }
        .with_page(id, f)
    }
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        self.db.snapshots.lock().unregister(self.meta.generation);
    }
}
