//! Shadow page staging for the single writer
//!
//! A write transaction never touches a page reachable from a committed
//! generation. Every page it changes is first copied into a pool buffer
//! under a newly allocated page id; the buffers reach the file only at
//! commit, followed by the meta record that makes them reachable.
//!
//! Commit sequence:
//! 1. retire the previous free-list chain and write the new one into
//!    staged pages
//! 2. grow the file and copy every staged page into it
//! 3. flush when `force_sync` is set, holding only the read side of the
//!    store lock
//! 4. write the meta record into slot `generation % 2`, flush again
//! 5. publish the meta to new readers
//!
//! A crash before step 4 completes leaves the previous meta in force and
//! the staged pages unreachable.

use std::collections::HashMap;
use std::mem;

use parking_lot::MutexGuard;
use tracing::{debug, trace};

use crate::btree::{PageSink, PageSource};
use crate::chain;
use crate::db::ShadeStore;
use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::mempool::{Buffer, MemoryPool};
use crate::meta::Meta;
use crate::page::PageId;
use crate::storage::address_space_exhausted;

use super::snapshot::PageView;

/// State owned by whoever holds the write lock
#[derive(Debug)]
pub(crate) struct WriterState {
    pub(crate) pool: MemoryPool,
    pub(crate) freelist: Freelist,
    /// Chain pages holding the persisted free list of the last commit
    pub(crate) freelist_pages: Vec<PageId>,
}

pub(crate) struct Staging<'db> {
    db: &'db ShadeStore,
    writer: MutexGuard<'db, WriterState>,

    /// Generation this transaction started from
    base: Meta,

    /// Working root and page count
    meta: Meta,

    dirty: HashMap<PageId, Buffer, ahash::RandomState>,

    /// Committed pages dropped by this transaction
    retired: Vec<PageId>,

    /// Pages allocated and dropped again by this transaction
    reusable: Vec<PageId>,

    /// Pages taken from the free list; returned on rollback
    taken: Vec<PageId>,

    done: bool,
}

impl<'db> Staging<'db> {
    /// Start staging on top of the last commit; blocks while another writer is active.
    pub(crate) fn new(db: &'db ShadeStore) -> Self {
        Self::start(db, db.writer.lock())
    }

    /// Like [`Staging::new`], but `None` while another writer is active.
    pub(crate) fn try_new(db: &'db ShadeStore) -> Option<Self> {
        db.writer.try_lock().map(|writer| Self::start(db, writer))
    }

    fn start(db: &'db ShadeStore, mut writer: MutexGuard<'db, WriterState>) -> Self {
        let (base, oldest) = {
            let state = db.snapshots.lock();
            (state.meta, state.oldest_reader())
        };

        let released = writer.freelist.release(oldest);
        if released > 0 {
            trace!(released, oldest_reader = ?oldest, "released pending pages");
        }

        Staging {
            db,
            writer,
            base,
            meta: base,
            dirty: HashMap::default(),
            retired: Vec::new(),
            reusable: Vec::new(),
            taken: Vec::new(),
            done: false,
        }
    }

    /// Write every staged page and publish the new generation.
    ///
    /// Does nothing when no page changed. If the final flush of the meta
    /// page fails, the new generation is already visible and the error is
    /// still returned.
    pub(crate) fn commit(mut self) -> Result<()> {
        if self.dirty.is_empty() && self.retired.is_empty() {
            self.discard();
            self.done = true;
            return Ok(());
        }

        let old_chain = self.writer.freelist_pages.clone();
        self.retired.extend_from_slice(&old_chain);

        // Pages allocated for the chain only shrink the list, so sizing it
        // before allocating is enough.
        let extra = self.retired.len() + self.reusable.len();
        let count = chain::pages_for(
            self.writer.freelist.encoded_len(extra),
            self.page_size(),
        );
        let chain_pages = (0..count)
            .map(|_| self.alloc())
            .collect::<Result<Vec<_>>>()?;

        let mut extra = self.retired.clone();
        extra.extend_from_slice(&self.reusable);
        let encoded = self.writer.freelist.encode(&extra);
        chain::write_into(&mut self, &chain_pages, &encoded)?;

        let meta = Meta {
            freelist: chain_pages[0],
            generation: self.base.generation + 1,
            ..self.meta
        };
        let written = self.dirty.len() as u64;
        let force_sync = self.db.options().force_sync;

        {
            let mut store = self.db.store.write();
            store.grow(meta.page_count)?;

            let writer = &mut *self.writer;
            for (id, buf) in self.dirty.drain() {
                store.write(id, &buf);
                writer.pool.release(buf);
            }
        }

        // Readers keep going during the flush.
        if force_sync {
            self.db.store.read().sync()?;
        }

        self.db.store.write().write_meta(&meta);
        self.done = true;

        let retired = mem::take(&mut self.retired);
        let retired_count = retired.len();
        let writer = &mut *self.writer;
        writer.freelist.retire(meta.generation, retired);
        for id in self.reusable.drain(..) {
            writer.freelist.give_back(id);
        }
        writer.freelist_pages = chain_pages;

        {
            let mut state = self.db.snapshots.lock();
            state.meta = meta;
            state.free_pages = writer.freelist.len() as u64;
            state.freelist_pages = writer.freelist_pages.len() as u64;
        }
        self.db.stats.record_commit(written);

        debug!(
            generation = meta.generation,
            root = %meta.root,
            pages_written = written,
            pages_retired = retired_count,
            page_count = meta.page_count,
            "committed"
        );

        if force_sync {
            self.db.store.read().sync()?;
        }
        Ok(())
    }

    /// Drop every staged page and return borrowed free pages.
    fn discard(&mut self) {
        let writer = &mut *self.writer;
        for (_, buf) in self.dirty.drain() {
            writer.pool.release(buf);
        }
        for id in self.taken.drain(..) {
            writer.freelist.give_back(id);
        }
        self.retired.clear();
        self.reusable.clear();
    }

    /// Run `f` over page `id` as of the generation this transaction started from.
    fn committed_page<R, F>(&self, id: PageId, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let store = self.db.store.read();
        PageView {
            store: &store,
            meta: self.base,
        }
        .with_page(id, f)
    }
}

impl PageSource for Staging<'_> {
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
        match self.dirty.get(&id) {
            Some(buf) => Ok(f(buf)),
            None => self.committed_page(id, f),
        }
    }
}

impl PageSink for Staging<'_> {
    fn set_root(&mut self, root: PageId) {
        self.meta.root = root;
    }

    fn alloc(&mut self) -> Result<PageId> {
        let id = if let Some(id) = self.reusable.pop() {
            id
        } else if let Some(id) = self.writer.freelist.take() {
            self.taken.push(id);
            id
        } else {
            let id = PageId::new(self.meta.page_count);
            self.meta.page_count = self
                .meta
                .page_count
                .checked_add(1)
                .ok_or_else(address_space_exhausted)?;
            id
        };

        let buf = self.writer.pool.acquire();
        self.dirty.insert(id, buf);
        Ok(id)
    }

    fn shadow(&mut self, id: PageId) -> Result<PageId> {
        if self.dirty.contains_key(&id) {
            return Ok(id);
        }

        let new = self.alloc()?;
        let mut buf = self
            .dirty
            .remove(&new)
            .ok_or_else(|| Error::Internal(format!("page {new} vanished after alloc")))?;
        let copied = self.committed_page(id, |page| buf.copy_from_slice(page));
        self.dirty.insert(new, buf);
        copied?;

        self.retired.push(id);
        Ok(new)
    }

    fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        self.dirty
            .get_mut(&id)
            .map(|buf| &mut buf[..])
            .ok_or_else(|| Error::Internal(format!("page {id} is not staged for writing")))
    }

    fn retire(&mut self, id: PageId) {
        match self.dirty.remove(&id) {
            Some(buf) => {
                self.writer.pool.release(buf);
                self.reusable.push(id);
            }
            None => self.retired.push(id),
        }
    }
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let staged = self.dirty.len();
        self.discard();
        self.db.stats.record_rollback();
        debug!(generation = self.base.generation, staged, "rolled back");
    }
}
