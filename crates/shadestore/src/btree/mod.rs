//! Copy-on-write B+Tree over page ids
//!
//! The tree never touches the file directly. Reads go through a
//! [`PageSource`] (a committed snapshot, or a write transaction's view of
//! it) and every change goes through a [`PageSink`], which hands out fresh
//! pages for shadow copies and collects the pages a change made obsolete.

mod crud;
mod cursor;
pub(crate) mod node;
mod verify;

pub(crate) use cursor::Cursor;
pub use verify::TreeReport;

use crate::error::Result;
use crate::page::PageId;

use node::Node;

/// Values longer than this share of a page are moved to a page chain
const OVERFLOW_DIVISOR: usize = 4;

/// Read access to one version of the page space.
pub(crate) trait PageSource {
    /// Root page of the tree
    fn root(&self) -> PageId;

    /// Pages in use; every reachable page id is below this
    fn page_count(&self) -> u32;

    fn page_size(&self) -> usize;

    /// Run `f` over the bytes of page `id`.
    ///
    /// Fails with `Corrupted` when `id` cannot hold data.
    fn with_page<R, F>(&self, id: PageId, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R;
}

/// Write access on top of a [`PageSource`].
pub(crate) trait PageSink: PageSource {
    fn set_root(&mut self, root: PageId);

    /// A new zeroed page, writable through [`PageSink::page_mut`].
    fn alloc(&mut self) -> Result<PageId>;

    /// Writable copy of page `id`.
    ///
    /// Pages written earlier in the same transaction are returned as is;
    /// anything else is copied to a new page and the original retired.
    fn shadow(&mut self, id: PageId) -> Result<PageId>;

    /// Bytes of a page returned by `alloc` or `shadow`.
    fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]>;

    /// Drop page `id` from the new version of the tree.
    fn retire(&mut self, id: PageId);
}

impl<T: PageSource + ?Sized> PageSource for &T {
    fn root(&self) -> PageId {
        (**self).root()
    }

    fn page_count(&self) -> u32 {
        (**self).page_count()
    }

    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn with_page<R, F>(&self, id: PageId, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        (**self).with_page(id, f)
    }
}

impl<T: PageSource + ?Sized> PageSource for &mut T {
    fn root(&self) -> PageId {
        (**self).root()
    }

    fn page_count(&self) -> u32 {
        (**self).page_count()
    }

    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn with_page<R, F>(&self, id: PageId, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        (**self).with_page(id, f)
    }
}

impl<T: PageSink + ?Sized> PageSink for &mut T {
    fn set_root(&mut self, root: PageId) {
        (**self).set_root(root)
    }

    fn alloc(&mut self) -> Result<PageId> {
        (**self).alloc()
    }

    fn shadow(&mut self, id: PageId) -> Result<PageId> {
        (**self).shadow(id)
    }

    fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        (**self).page_mut(id)
    }

    fn retire(&mut self, id: PageId) {
        (**self).retire(id)
    }
}

/// B+Tree bound to a page source
pub(crate) struct BTree<S> {
    pages: S,
}

impl<S: PageSource> BTree<S> {
    pub(crate) fn new(pages: S) -> Self {
        Self { pages }
    }

    pub(crate) fn node(&self, id: PageId) -> Result<Node> {
        let page_count = self.pages.page_count();
        self.pages
            .with_page(id, |page| Node::decode(id, page, page_count))?
    }

    fn overflow_threshold(&self) -> usize {
        self.pages.page_size() / OVERFLOW_DIVISOR
    }
}

impl<S: PageSink> BTree<S> {
    /// Encode `node` into the writable page `id`.
    fn write_node(&mut self, id: PageId, node: &Node) -> Result<()> {
        node.encode_into(id, self.pages.page_mut(id)?)
    }

    /// Encode `node` into a fresh page.
    fn store_new(&mut self, node: &Node) -> Result<PageId> {
        let id = self.pages.alloc()?;
        self.write_node(id, node)?;
        Ok(id)
    }

    /// Replace page `old` with `node`, returning the page now holding it.
    fn store_over(&mut self, old: PageId, node: &Node) -> Result<PageId> {
        let id = self.pages.shadow(old)?;
        self.write_node(id, node)?;
        Ok(id)
    }
}
