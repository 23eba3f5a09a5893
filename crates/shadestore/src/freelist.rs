//! Free list of reclaimed page numbers
//!
//! Persisted format (stored in a page chain):
//! ```text
//! [4 bytes: count u32 little-endian]
//! [count x 4 bytes: page id u32]
//! ```
//! In memory, pages retired by a commit stay pending until no reader can
//! still reach them; on disk pending pages are recorded as free, since no
//! reader survives a reopen.

use std::collections::{BTreeMap, BTreeSet};

use nom::{multi::length_count, number::complete::le_u32, IResult};

use crate::error::{Error, Result};
use crate::page::PageId;

#[derive(Debug, Default)]
pub(crate) struct Freelist {
    /// Pages that can be handed out right now
    free: BTreeSet<PageId>,

    /// Pages retired by the commit of a generation, keyed by that generation
    pending: BTreeMap<u64, Vec<PageId>>,
}

fn records(input: &[u8]) -> IResult<&[u8], Vec<u32>> {
    length_count(le_u32, le_u32)(input)
}

impl Freelist {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Decode a persisted free list; `head` and `page_count` are used for validation.
    pub(crate) fn decode(bytes: &[u8], head: PageId, page_count: u32) -> Result<Self> {
        let (_, ids) =
            records(bytes).map_err(|_| Error::corrupted(head, "truncated free list"))?;

        let mut free = BTreeSet::new();
        for raw in ids {
            let id = PageId::new(raw);
            if !id.is_data_page(page_count) {
                return Err(Error::corrupted(
                    head,
                    format!("free list names page {raw} outside {page_count} pages"),
                ));
            }
            if !free.insert(id) {
                return Err(Error::corrupted(
                    head,
                    format!("free list names page {raw} twice"),
                ));
            }
        }

        Ok(Self {
            free,
            pending: BTreeMap::new(),
        })
    }

    /// Encode free and pending pages plus `extra`.
    pub(crate) fn encode(&self, extra: &[PageId]) -> Vec<u8> {
        let mut ids: Vec<PageId> = self
            .free
            .iter()
            .chain(self.pending.values().flatten())
            .chain(extra)
            .copied()
            .collect();
        ids.sort_unstable();

        let mut buf = Vec::with_capacity(4 + ids.len() * 4);
        buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        for id in ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        buf
    }

    /// Size [`Freelist::encode`] would produce with `extra` more pages.
    pub(crate) fn encoded_len(&self, extra: usize) -> usize {
        4 + (self.len() + extra) * 4
    }

    /// Take the lowest free page.
    pub(crate) fn take(&mut self) -> Option<PageId> {
        self.free.pop_first()
    }

    /// Return a page that never became reachable.
    pub(crate) fn give_back(&mut self, id: PageId) {
        self.free.insert(id);
    }

    /// Record pages retired by the commit that produced `generation`.
    pub(crate) fn retire(&mut self, generation: u64, ids: Vec<PageId>) {
        if !ids.is_empty() {
            self.pending.entry(generation).or_default().extend(ids);
        }
    }

    /// Move pending pages to the free set once no reader can reach them.
    ///
    /// `oldest_reader` is the snapshot generation of the oldest live reader.
    /// Pages retired by generation `g` were last reachable from generation
    /// `g - 1`, so they are released when every reader is at `g` or later.
    pub(crate) fn release(&mut self, oldest_reader: Option<u64>) -> usize {
        let releasable: Vec<u64> = self
            .pending
            .keys()
            .copied()
            .take_while(|generation| oldest_reader.map_or(true, |oldest| *generation <= oldest))
            .collect();

        let mut released = 0;
        for generation in releasable {
            if let Some(ids) = self.pending.remove(&generation) {
                released += ids.len();
                self.free.extend(ids);
            }
        }
        released
    }

    /// Free plus pending pages.
    pub(crate) fn len(&self) -> usize {
        self.free.len() + self.pending.values().map(Vec::len).sum::<usize>()
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }
}
