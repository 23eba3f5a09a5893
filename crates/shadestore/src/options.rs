//! Open-time configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::db::ShadeStore;
use crate::error::{Error, Result};
use crate::page::{os_page_size, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Default number of buffers kept by the memory pool
pub const DEFAULT_MEMPOOL_CAPACITY: usize = 4;

/// Options for opening a database
///
/// ```no_run
/// use shadestore::Options;
///
/// let db = Options::new()
///     .force_sync(true)
///     .mempool_capacity(8)
///     .open("data.shade")?;
/// # Ok::<(), shadestore::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Page size for a new file; `None` uses the OS page size.
    /// Ignored when the file already exists.
    pub page_size: Option<u32>,

    /// Flush data pages and the meta page on every commit
    pub force_sync: bool,

    /// Staging buffers kept between write transactions
    pub mempool_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: None,
            force_sync: false,
            mempool_capacity: DEFAULT_MEMPOOL_CAPACITY,
        }
    }
}

impl Options {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Page size for a new file, rounded up to 4096 bytes
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Flush to stable storage on every commit
    pub fn force_sync(mut self, force_sync: bool) -> Self {
        self.force_sync = force_sync;
        self
    }

    /// Number of staging buffers to keep; 0 disables the pool
    pub fn mempool_capacity(mut self, capacity: usize) -> Self {
        self.mempool_capacity = capacity;
        self
    }

    /// Open or create the database at `path` with these options.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<ShadeStore> {
        ShadeStore::open_with(path.as_ref(), self.clone())
    }

    /// Page size a new file would get.
    pub(crate) fn effective_page_size(&self) -> Result<u32> {
        let requested = self
            .page_size
            .unwrap_or_else(|| os_page_size().min(u32::MAX as usize) as u32);
        let size = requested.max(MIN_PAGE_SIZE);

        if size > MAX_PAGE_SIZE {
            return Err(Error::InvalidOption(format!(
                "page size {requested} exceeds {MAX_PAGE_SIZE}"
            )));
        }
        if !size.is_power_of_two() {
            return Err(Error::InvalidOption(format!(
                "page size {requested} is not a power of two"
            )));
        }
        Ok(size)
    }
}
