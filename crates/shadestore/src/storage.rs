//! Page store: the single database file, accessed through a memory mapping
//!
//! File layout:
//! - pages `0` and `1`: meta slots
//! - pages `2..page_count`: branch, leaf and chain pages
//!
//! The file only grows. Growth remaps the whole file, so callers hold the
//! store exclusively while growing and writing; page reads are shared.

use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::debug;

use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::page::PageId;

/// Largest single growth step (4 MB)
const MAX_GROWTH_STEP: usize = 4 * 1024 * 1024;

/// PageStore owns the file handle and its mapping
pub(crate) struct PageStore {
    /// Path to the database file
    path: PathBuf,

    /// Data file handle
    file: File,

    /// Mapping of the whole file; `None` while the file is empty
    mmap: Option<MmapMut>,

    /// Current file length in bytes
    len: usize,

    /// Page size of this file
    page_size: usize,
}

impl PageStore {
    /// Open or create the database file at `path`.
    ///
    /// An empty file is returned unmapped; call [`PageStore::init`] on it.
    pub(crate) fn open(path: &Path, page_size: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len() as usize;

        let mmap = if len > 0 {
            // SAFETY: the mapping is only touched through this store, and the
            // file is not expected to be modified by other processes.
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };

        Ok(PageStore {
            path: path.to_path_buf(),
            file,
            mmap,
            len,
            page_size,
        })
    }

    /// Lay out a fresh database: both meta slots, an empty root leaf and an
    /// empty free list.
    pub(crate) fn init(&mut self, meta: &Meta, root: &[u8], freelist: &[u8]) -> Result<()> {
        self.grow(meta.page_count)?;

        self.write(meta.root, root);
        self.write(meta.freelist, freelist);

        let encoded = meta.encode();
        self.write_prefix(PageId::new(0), &encoded);
        self.write_prefix(PageId::new(1), &encoded);

        self.sync()
    }

    /// Read the newest valid meta and adopt its page size.
    pub(crate) fn load_meta(&mut self) -> Result<Meta> {
        let meta = Meta::recover(self.bytes())?;

        let required = meta.page_count as usize * meta.page_size as usize;
        if self.len < required {
            return Err(Error::FileUnexpected(format!(
                "file is truncated: {} bytes, {} required",
                self.len, required
            )));
        }

        self.page_size = meta.page_size as usize;
        Ok(meta)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Make sure the file can hold `page_count` pages.
    ///
    /// Growth doubles the file, by at most 4 MB per step, so that a run of
    /// commits does not remap on every page.
    pub(crate) fn grow(&mut self, page_count: u32) -> Result<()> {
        let required = page_count as usize * self.page_size;
        if required <= self.len {
            return Ok(());
        }

        let mut len = self.len.max(self.page_size);
        while len < required {
            len += len.min(MAX_GROWTH_STEP);
        }
        len = len.div_ceil(self.page_size) * self.page_size;

        debug!(from = self.len, to = len, "growing database file");

        // Unmap before resizing; some platforms refuse to truncate a mapped file.
        self.mmap = None;
        self.file.set_len(len as u64)?;
        // SAFETY: see `open`.
        self.mmap = Some(unsafe { MmapMut::map_mut(&self.file)? });
        self.len = len;

        Ok(())
    }

    /// Borrow page `id`.
    ///
    /// # Panics
    /// If the page lies outside the file. Callers validate page ids coming
    /// from disk before asking for them.
    pub(crate) fn page(&self, id: PageId) -> &[u8] {
        let range = self.range(id);
        &self.bytes()[range]
    }

    /// Overwrite page `id` with `bytes` (at most one page).
    pub(crate) fn write(&mut self, id: PageId, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.page_size,
            "write of {} bytes to page {id} exceeds the page size",
            bytes.len()
        );
        let range = self.range(id);
        self.bytes_mut()[range][..bytes.len()].copy_from_slice(bytes);
    }

    /// Write a meta record, zeroing the rest of its slot.
    pub(crate) fn write_meta(&mut self, meta: &Meta) {
        self.write_prefix(meta.slot(), &meta.encode());
    }

    /// Flush dirty pages of the mapping to stable storage.
    pub(crate) fn sync(&self) -> Result<()> {
        match &self.mmap {
            Some(mmap) => mmap.flush().map_err(Error::from),
            None => Ok(()),
        }
    }

    fn write_prefix(&mut self, id: PageId, bytes: &[u8]) {
        let range = self.range(id);
        let page = &mut self.bytes_mut()[range];
        page.fill(0);
        page[..bytes.len()].copy_from_slice(bytes);
    }

    fn range(&self, id: PageId) -> Range<usize> {
        let start = id.offset(self.page_size);
        let end = start + self.page_size;
        assert!(
            end <= self.len,
            "page {id} is outside the mapped file ({} bytes)",
            self.len
        );
        start..end
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or_default()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.mmap.as_deref_mut().unwrap_or_default()
    }
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Error for a file that cannot be grown any further.
pub(crate) fn address_space_exhausted() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::Other,
        "database file reached the page id limit",
    ))
}
