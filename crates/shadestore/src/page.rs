//! Page identity, page kinds and the layout constants shared by every page.
//!
//! File layout:
//! ```text
//! page 0      meta slot A
//! page 1      meta slot B
//! page 2..    branch / leaf / chain pages, addressed by PageId
//! ```
//! A page lives at `offset = page_id * page_size`.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Minimum page size (4 KB)
pub const MIN_PAGE_SIZE: u32 = 4 * 1024;

/// Maximum page size (64 KB); entry counts are stored as `u16`.
pub const MAX_PAGE_SIZE: u32 = 64 * 1024;

/// Number of meta slots at the start of the file
pub(crate) const META_SLOTS: u32 = 2;

/// Stable page number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PageId(u32);

impl PageId {
    /// First page that can hold tree or chain data.
    pub(crate) const FIRST_DATA: PageId = PageId(META_SLOTS);

    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw page number
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Byte offset of the page in the file.
    pub(crate) fn offset(self, page_size: usize) -> usize {
        self.0 as usize * page_size
    }

    pub(crate) fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Whether the id may hold tree or chain data in a file of `page_count` pages.
    pub(crate) fn is_data_page(self, page_count: u32) -> bool {
        self >= Self::FIRST_DATA && self.0 < page_count
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag stored in the first byte of every data page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PageKind {
    Branch = 1,
    Leaf = 2,
    Chain = 3,
}

impl PageKind {
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PageKind::Branch),
            2 => Some(PageKind::Leaf),
            3 => Some(PageKind::Chain),
            _ => None,
        }
    }
}

/// Operating system memory page size, cached after the first query.
pub fn os_page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Acquire) {
        0 => {
            let size = query_page_size();
            PAGE_SIZE.store(size, Ordering::Release);
            size
        }
        size => size,
    }
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        MIN_PAGE_SIZE as usize
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    MIN_PAGE_SIZE as usize
}
