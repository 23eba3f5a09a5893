//! Meta record parser using nom
//!
//! Each of the two meta slots (pages 0 and 1) starts with:
//! ```text
//! SHADE01\n
//! [4 bytes: version u32 little-endian]
//! [4 bytes: page_size u32]
//! [4 bytes: root page id u32]
//! [4 bytes: freelist head page id u32]
//! [4 bytes: page_count u32]
//! [4 bytes: reserved, zero]
//! [8 bytes: generation u64]
//! [4 bytes: crc32 of everything above]
//! ```
//! The rest of the page is zero.

use nom::{
    bytes::complete::tag,
    number::complete::{le_u32, le_u64},
    sequence::tuple,
    IResult,
};
use tracing::warn;

use crate::error::{Error, Result};
use crate::page::{PageId, MAX_PAGE_SIZE, META_SLOTS, MIN_PAGE_SIZE};

/// Magic header for shadestore files
pub const META_MAGIC: &[u8] = b"SHADE01\n";

/// Current file format version
pub const FORMAT_VERSION: u32 = 1;

/// Encoded length of a meta record
pub(crate) const META_LEN: usize = META_MAGIC.len() + 6 * 4 + 8 + 4;

/// Root pointer, free-list head and allocation watermark of one committed generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Meta {
    pub(crate) page_size: u32,
    pub(crate) root: PageId,
    pub(crate) freelist: PageId,
    /// Number of pages in use; also the next page id handed out on growth.
    pub(crate) page_count: u32,
    pub(crate) generation: u64,
}

type RawMeta<'a> = (&'a [u8], u32, u32, u32, u32, u32, u32, u64, u32);

fn raw_meta(input: &[u8]) -> IResult<&[u8], RawMeta<'_>> {
    tuple((
        tag(META_MAGIC),
        le_u32,
        le_u32,
        le_u32,
        le_u32,
        le_u32,
        le_u32,
        le_u64,
        le_u32,
    ))(input)
}

impl Meta {
    /// Meta of a freshly created file: empty root leaf at page 2, empty free list at page 3.
    pub(crate) fn initial(page_size: u32) -> Self {
        Self {
            page_size,
            root: PageId::FIRST_DATA,
            freelist: PageId::new(META_SLOTS + 1),
            page_count: META_SLOTS + 2,
            generation: 0,
        }
    }

    /// Page holding this generation's meta record.
    pub(crate) fn slot(&self) -> PageId {
        PageId::new((self.generation % META_SLOTS as u64) as u32)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_LEN);
        buf.extend_from_slice(META_MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.page_size.to_le_bytes());
        buf.extend_from_slice(&self.root.to_le_bytes());
        buf.extend_from_slice(&self.freelist.to_le_bytes());
        buf.extend_from_slice(&self.page_count.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&self.generation.to_le_bytes());
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse and validate a meta record.
    pub(crate) fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < META_LEN {
            return Err(Error::FileUnexpected("input too short for meta".to_string()));
        }

        let (_, raw) = raw_meta(input)?;
        let (_, version, page_size, root, freelist, page_count, _, generation, checksum) = raw;

        if crc32fast::hash(&input[..META_LEN - 4]) != checksum {
            return Err(Error::FileUnexpected("meta checksum mismatch".to_string()));
        }
        if version != FORMAT_VERSION {
            return Err(Error::FileUnexpected(format!(
                "unsupported format version {version}"
            )));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::FileUnexpected(format!(
                "page size {page_size} out of range"
            )));
        }

        let meta = Meta {
            page_size,
            root: PageId::new(root),
            freelist: PageId::new(freelist),
            page_count,
            generation,
        };
        if !meta.root.is_data_page(page_count) || !meta.freelist.is_data_page(page_count) {
            return Err(Error::FileUnexpected(format!(
                "meta points outside the file: root {root}, freelist {freelist}, {page_count} pages"
            )));
        }

        Ok(meta)
    }

    /// Pick the newest valid meta from the raw file bytes.
    ///
    /// Slot 0 normally tells the page size. When slot 0 is damaged, every
    /// supported page size is probed for a valid slot 1.
    pub(crate) fn recover(file: &[u8]) -> Result<Self> {
        let first = Meta::decode(file);

        let page_size = match &first {
            Ok(meta) => Some(meta.page_size as usize),
            Err(_) => None,
        };

        let second = match page_size {
            Some(size) => file.get(size..).map(Meta::decode),
            None => candidate_page_sizes()
                .filter_map(|size| file.get(size as usize..).map(|b| (size, b)))
                .map(|(size, bytes)| {
                    Meta::decode(bytes).and_then(|meta| {
                        if meta.page_size == size {
                            Ok(meta)
                        } else {
                            Err(Error::FileUnexpected("page size mismatch".to_string()))
                        }
                    })
                })
                .find(|res| res.is_ok()),
        };

        match (first, second) {
            (Ok(a), Some(Ok(b))) => {
                if a.page_size != b.page_size {
                    return Err(Error::FileUnexpected(
                        "meta slots disagree on page size".to_string(),
                    ));
                }
                Ok(if a.generation >= b.generation { a } else { b })
            }
            (Ok(a), _) => {
                warn!(generation = a.generation, "meta slot 1 is invalid, using slot 0");
                Ok(a)
            }
            (Err(_), Some(Ok(b))) => {
                warn!(generation = b.generation, "meta slot 0 is invalid, using slot 1");
                Ok(b)
            }
            (Err(err), _) => Err(err),
        }
    }
}

fn candidate_page_sizes() -> impl Iterator<Item = u32> {
    std::iter::successors(Some(MIN_PAGE_SIZE), |size| size.checked_mul(2))
        .take_while(|size| *size <= MAX_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(metas: &[Option<Meta>], page_size: usize) -> Vec<u8> {
        let mut file = vec![0u8; page_size * 2];
        for (slot, meta) in metas.iter().enumerate() {
            if let Some(meta) = meta {
                let bytes = meta.encode();
                file[slot * page_size..slot * page_size + bytes.len()].copy_from_slice(&bytes);
            }
        }
        file
    }

    #[test]
    fn test_encode_decode() {
        let meta = Meta {
            generation: 42,
            ..Meta::initial(4096)
        };
        let bytes = meta.encode();
        assert_eq!(bytes.len(), META_LEN);
        assert_eq!(&bytes[..8], META_MAGIC);
        assert_eq!(Meta::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut bytes = Meta::initial(4096).encode();
        bytes[0] = b'X';
        assert!(matches!(Meta::decode(&bytes), Err(Error::FileUnexpected(_))));
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let mut bytes = Meta::initial(4096).encode();
        bytes[META_MAGIC.len() + 8] ^= 0xFF;
        assert!(matches!(Meta::decode(&bytes), Err(Error::FileUnexpected(_))));
    }

    #[test]
    fn test_decode_too_short() {
        assert!(Meta::decode(b"SHADE01\n").is_err());
    }

    #[test]
    fn test_slot_alternates() {
        let mut meta = Meta::initial(4096);
        assert_eq!(meta.slot(), PageId::new(0));
        meta.generation += 1;
        assert_eq!(meta.slot(), PageId::new(1));
        meta.generation += 1;
        assert_eq!(meta.slot(), PageId::new(0));
    }

    #[test]
    fn test_recover_prefers_newest() {
        let old = Meta::initial(4096);
        let new = Meta {
            generation: 1,
            root: PageId::new(5),
            page_count: 8,
            ..old
        };
        let file = file_with(&[Some(old), Some(new)], 4096);
        assert_eq!(Meta::recover(&file).unwrap(), new);
    }

    #[test]
    fn test_recover_from_damaged_slot() {
        let old = Meta {
            generation: 2,
            ..Meta::initial(8192)
        };
        let newer = Meta {
            generation: 3,
            ..old
        };
        let mut file = file_with(&[Some(old), Some(newer)], 8192);

        // Torn write of the newer slot: fall back to generation 2.
        file[8192 + 3] ^= 0x55;
        let meta = Meta::recover(&file).unwrap();
        assert_eq!(meta.generation, 2);

        // Damaged slot 0 with an intact slot 1: page size is probed.
        let mut file = file_with(&[Some(old), Some(newer)], 8192);
        file[0] = 0;
        let meta = Meta::recover(&file).unwrap();
        assert_eq!(meta, newer);
    }

    #[test]
    fn test_recover_garbage() {
        let file = b"ABCD1234".repeat(1024);
        assert!(matches!(
            Meta::recover(&file),
            Err(Error::FileUnexpected(_))
        ));
    }
}
