//! Page chains: byte strings spread over a linked run of pages
//!
//! Every chain page starts with a 12-byte header:
//! ```text
//! [1 byte: kind = 3][3 bytes: zero]
//! [4 bytes: payload length u32 little-endian]
//! [4 bytes: next page id u32, 0 ends the chain]
//! [payload]
//! ```
//! Overflow values and the persisted free list are stored this way.

use nom::{
    bytes::complete::take,
    number::complete::{le_u32, le_u8},
    sequence::tuple,
    IResult,
};

use crate::btree::{PageSink, PageSource};
use crate::error::{Error, Result};
use crate::page::{PageId, PageKind};

/// Chain page header length
pub(crate) const CHAIN_HEADER_LEN: usize = 12;

/// Payload bytes one chain page can hold
pub(crate) fn capacity(page_size: usize) -> usize {
    page_size - CHAIN_HEADER_LEN
}

/// Number of pages needed to store `len` bytes. Never zero.
pub(crate) fn pages_for(len: usize, page_size: usize) -> usize {
    len.div_ceil(capacity(page_size)).max(1)
}

struct Header {
    len: u32,
    next: u32,
}

fn header(input: &[u8]) -> IResult<&[u8], (u8, &[u8], u32, u32)> {
    tuple((le_u8, take(3usize), le_u32, le_u32))(input)
}

fn parse_header(id: PageId, page: &[u8], page_count: u32) -> Result<Header> {
    let (_, (kind, _, len, next)) =
        header(page).map_err(|_| Error::corrupted(id, "truncated chain header"))?;

    if PageKind::from_byte(kind) != Some(PageKind::Chain) {
        return Err(Error::corrupted(
            id,
            format!("expected a chain page, found kind {kind}"),
        ));
    }
    if len as usize > capacity(page.len()) {
        return Err(Error::corrupted(
            id,
            format!("chain payload of {len} bytes does not fit the page"),
        ));
    }
    if next != 0 && !PageId::new(next).is_data_page(page_count) {
        return Err(Error::corrupted(
            id,
            format!("chain links to page {next} outside {page_count} pages"),
        ));
    }

    Ok(Header { len, next })
}

/// Store `bytes` in freshly allocated pages and return the head page.
pub(crate) fn write<S: PageSink>(sink: &mut S, bytes: &[u8]) -> Result<PageId> {
    let count = pages_for(bytes.len(), sink.page_size());
    let ids = (0..count)
        .map(|_| sink.alloc())
        .collect::<Result<Vec<_>>>()?;
    write_into(sink, &ids, bytes)?;
    Ok(ids[0])
}

/// Store `bytes` in the already allocated pages `ids`, in order.
///
/// Pages past the end of the data are written as empty chunks.
pub(crate) fn write_into<S: PageSink>(sink: &mut S, ids: &[PageId], bytes: &[u8]) -> Result<()> {
    let cap = capacity(sink.page_size());
    if ids.is_empty() || ids.len() * cap < bytes.len() {
        return Err(Error::Internal(format!(
            "{} chain pages cannot hold {} bytes",
            ids.len(),
            bytes.len()
        )));
    }

    for (i, id) in ids.iter().enumerate() {
        let start = (i * cap).min(bytes.len());
        let end = (start + cap).min(bytes.len());
        let chunk = &bytes[start..end];
        let next = ids.get(i + 1).map_or(0, |next| next.raw());

        fill_page(sink.page_mut(*id)?, chunk, next);
    }
    Ok(())
}

/// Lay out one chain page holding `chunk` and linking to `next`.
///
/// `chunk` must fit [`capacity`] of the page.
pub(crate) fn fill_page(page: &mut [u8], chunk: &[u8], next: u32) {
    page.fill(0);
    page[0] = PageKind::Chain as u8;
    page[4..8].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
    page[8..12].copy_from_slice(&next.to_le_bytes());
    page[CHAIN_HEADER_LEN..CHAIN_HEADER_LEN + chunk.len()].copy_from_slice(chunk);
}

/// Page ids of the chain starting at `head`, in order.
pub(crate) fn pages<S: PageSource>(source: &S, head: PageId) -> Result<Vec<PageId>> {
    let mut ids = Vec::new();
    walk(source, head, |id, _| ids.push(id))?;
    Ok(ids)
}

/// Concatenated payload of the chain starting at `head`.
pub(crate) fn read<S: PageSource>(source: &S, head: PageId) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    walk(source, head, |_, payload| bytes.extend_from_slice(payload))?;
    Ok(bytes)
}

/// Retire every page of the chain starting at `head`.
pub(crate) fn free<S: PageSink>(sink: &mut S, head: PageId) -> Result<()> {
    for id in pages(&*sink, head)? {
        sink.retire(id);
    }
    Ok(())
}

fn walk<S, F>(source: &S, head: PageId, mut visit: F) -> Result<()>
where
    S: PageSource,
    F: FnMut(PageId, &[u8]),
{
    let page_count = source.page_count();
    let mut id = head;
    // A chain can never be longer than the file; more steps means a cycle.
    for _ in 0..page_count {
        let next = source.with_page(id, |page| -> Result<u32> {
            let header = parse_header(id, page, page_count)?;
            visit(
                id,
                &page[CHAIN_HEADER_LEN..CHAIN_HEADER_LEN + header.len as usize],
            );
            Ok(header.next)
        })??;

        if next == 0 {
            return Ok(());
        }
        id = PageId::new(next);
    }
    Err(Error::corrupted(head, "chain does not terminate"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::testing::MemPages;

    const PAGE: usize = 4096;

    #[test]
    fn test_pages_for() {
        let cap = capacity(PAGE);
        assert_eq!(pages_for(0, PAGE), 1);
        assert_eq!(pages_for(1, PAGE), 1);
        assert_eq!(pages_for(cap, PAGE), 1);
        assert_eq!(pages_for(cap + 1, PAGE), 2);
        assert_eq!(pages_for(3 * cap, PAGE), 3);
    }

    #[test]
    fn test_write_and_read_long_chain() {
        let mut pages = MemPages::new(PAGE);
        let data: Vec<u8> = (0..3 * PAGE).map(|i| (i % 251) as u8).collect();

        let head = write(&mut pages, &data).unwrap();
        assert_eq!(read(&pages, head).unwrap(), data);
        assert_eq!(super::pages(&pages, head).unwrap().len(), 4);
    }

    #[test]
    fn test_trailing_empty_chunks() {
        let mut pages = MemPages::new(PAGE);
        let ids: Vec<PageId> = (0..3).map(|_| pages.alloc().unwrap()).collect();

        write_into(&mut pages, &ids, b"tiny").unwrap();
        assert_eq!(read(&pages, ids[0]).unwrap(), b"tiny");
        assert_eq!(super::pages(&pages, ids[0]).unwrap(), ids);
    }

    #[test]
    fn test_write_into_too_small() {
        let mut pages = MemPages::new(PAGE);
        let ids = vec![pages.alloc().unwrap()];
        let data = vec![1u8; PAGE];
        assert!(matches!(
            write_into(&mut pages, &ids, &data),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let mut pages = MemPages::new(PAGE);
        let a = pages.alloc().unwrap();
        let b = pages.alloc().unwrap();
        write_into(&mut pages, &[a, b], b"loop").unwrap();
        // Point b back at a.
        pages.page_mut(b).unwrap()[8..12].copy_from_slice(&a.to_le_bytes());

        assert!(matches!(
            read(&pages, a),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_wrong_kind() {
        let mut pages = MemPages::new(PAGE);
        let id = pages.alloc().unwrap();
        pages.page_mut(id).unwrap()[0] = PageKind::Leaf as u8;
        assert!(matches!(
            read(&pages, id),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_free_retires_every_page() {
        let mut pages = MemPages::new(PAGE);
        let data = vec![7u8; 2 * PAGE];
        let head = write(&mut pages, &data).unwrap();
        let ids = super::pages(&pages, head).unwrap();
        pages.checkpoint();

        free(&mut pages, head).unwrap();
        assert_eq!(pages.retired, ids);
    }
}
