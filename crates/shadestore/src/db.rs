//! Database handle

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::btree::node::Node;
use crate::btree::PageSource;
use crate::chain;
use crate::error::Result;
use crate::freelist::Freelist;
use crate::mempool::MemoryPool;
use crate::meta::Meta;
use crate::options::Options;
use crate::page::MIN_PAGE_SIZE;
use crate::stats::{EngineStats, Stats};
use crate::storage::PageStore;
use crate::tx::{CursorTx, PageView, SnapshotState, Tx, TxMut, WriterState};

/// An open database file
///
/// Any number of threads may read through [`ShadeStore::begin_tx`] while
/// one writes through [`ShadeStore::begin_tx_mut`]; readers never wait for
/// the writer. Share the handle across threads with `Arc`.
///
/// A thread that already holds a [`TxMut`] and asks for another one waits
/// forever; use [`ShadeStore::try_begin_tx_mut`] where that can happen.
pub struct ShadeStore {
    /// File and mapping; written only while committing or growing
    pub(crate) store: RwLock<PageStore>,

    /// Last committed meta and the live readers
    pub(crate) snapshots: Mutex<SnapshotState>,

    /// Held for the whole lifetime of a write transaction
    pub(crate) writer: Mutex<WriterState>,

    pub(crate) stats: Arc<EngineStats>,

    options: Options,

    path: PathBuf,

    closed: bool,
}

impl ShadeStore {
    /// Open or create the database at `path` with default [`Options`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), Options::default())
    }

    pub(crate) fn open_with(path: &Path, options: Options) -> Result<Self> {
        // An existing file keeps the page size it was created with; the
        // option only applies to new files.
        let existing = std::fs::metadata(path).is_ok_and(|m| m.len() > 0);
        let page_size = if existing {
            MIN_PAGE_SIZE
        } else {
            options.effective_page_size()?
        };
        let mut store = PageStore::open(path, page_size as usize)?;

        let (meta, freelist, freelist_pages) = if store.is_empty() {
            let meta = Meta::initial(page_size);

            let mut root = vec![0; page_size as usize];
            Node::empty_leaf().encode_into(meta.root, &mut root)?;
            let freelist = Freelist::new();
            let mut list = vec![0; page_size as usize];
            chain::fill_page(&mut list, &freelist.encode(&[]), 0);

            store.init(&meta, &root, &list)?;
            info!(path = %path.display(), page_size, "created database");
            (meta, freelist, vec![meta.freelist])
        } else {
            let meta = store.load_meta()?;
            let view = PageView {
                store: &store,
                meta,
            };
            let pages = chain::pages(&view, meta.freelist)?;
            let bytes = chain::read(&view, meta.freelist)?;
            let freelist = Freelist::decode(&bytes, meta.freelist, meta.page_count)?;

            // The root must at least decode as a node.
            view.with_page(meta.root, |page| Node::decode(meta.root, page, meta.page_count))??;

            info!(
                path = %path.display(),
                page_size = meta.page_size,
                generation = meta.generation,
                page_count = meta.page_count,
                free_pages = freelist.len(),
                "opened database"
            );
            (meta, freelist, pages)
        };

        let stats = Arc::new(EngineStats::new());
        let pool = MemoryPool::new(store.page_size(), options.mempool_capacity, stats.clone());
        let snapshots = SnapshotState::new(
            meta,
            freelist.len() as u64,
            freelist_pages.len() as u64,
        );

        Ok(ShadeStore {
            store: RwLock::new(store),
            snapshots: Mutex::new(snapshots),
            writer: Mutex::new(WriterState {
                pool,
                freelist,
                freelist_pages,
            }),
            stats,
            options,
            path: path.to_path_buf(),
            closed: false,
        })
    }

    /// Start a read-only transaction on the last commit.
    pub fn begin_tx(&self) -> Tx<'_> {
        Tx::new(self)
    }

    /// Start the write transaction, waiting for the current one to finish.
    pub fn begin_tx_mut(&self) -> TxMut<'_> {
        TxMut::new(self)
    }

    /// Start the write transaction unless another one is active.
    pub fn try_begin_tx_mut(&self) -> Option<TxMut<'_>> {
        TxMut::try_new(self)
    }

    /// Run `f` in a read-only transaction.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T>,
    {
        f(&self.begin_tx())
    }

    /// Run `f` in a write transaction, committing when it returns `Ok`.
    ///
    /// An `Err` from `f` rolls every change back and is returned as is.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxMut<'_>) -> Result<T>,
    {
        let mut tx = self.begin_tx_mut();
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Whether `key` exists in the last commit.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.begin_tx().contains(key)
    }

    /// Value stored under `key` in the last commit.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.begin_tx().get(key)
    }

    /// Insert or overwrite `key` in a transaction of its own.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.update(|tx| tx.put(key, value))
    }

    /// Remove `key` in a transaction of its own; `false` when it was not there.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.update(|tx| tx.delete(key))
    }

    /// Cursor at the smallest key of the last commit.
    pub fn first_cursor(&self) -> Result<CursorTx<'_>> {
        CursorTx::first_in(self)
    }

    /// Cursor at the largest key of the last commit.
    pub fn last_cursor(&self) -> Result<CursorTx<'_>> {
        CursorTx::last_in(self)
    }

    /// Cursor at the smallest key `>= key` of the last commit.
    pub fn cursor_from_key(&self, key: &[u8]) -> Result<CursorTx<'_>> {
        CursorTx::from_key_in(self, key)
    }

    /// Current counters and file shape.
    pub fn stats(&self) -> Stats {
        let state = self.snapshots.lock();
        Stats {
            page_size: state.meta.page_size,
            page_count: state.meta.page_count,
            generation: state.meta.generation,
            free_pages: state.free_pages,
            freelist_pages: state.freelist_pages,
            active_readers: state.reader_count() as u64,
            commits: self.stats.commits(),
            rollbacks: self.stats.rollbacks(),
            pages_written: self.stats.pages_written(),
            pool_hits: self.stats.pool_hits(),
            pool_misses: self.stats.pool_misses(),
        }
    }

    /// Flush the file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.store.read().sync()
    }

    /// Flush and close the database.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let result = self.sync();
        info!(path = %self.path.display(), "closed database");
        result
    }

    /// Options the database was opened with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size of the file.
    pub fn page_size(&self) -> u32 {
        self.snapshots.lock().meta.page_size
    }
}

impl std::fmt::Debug for ShadeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadeStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Drop for ShadeStore {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.store.get_mut().sync() {
            warn!(path = %self.path.display(), error = %err, "flush on drop failed");
        }
    }
}
