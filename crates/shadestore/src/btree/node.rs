//! Branch and leaf page codec
//!
//! Page header (8 bytes):
//! ```text
//! [1 byte: kind (1 = branch, 2 = leaf)][1 byte: zero]
//! [2 bytes: entry count u16 little-endian][4 bytes: reserved]
//! ```
//! Leaf entry:
//! ```text
//! [1 byte: key len][key]
//! [1 byte: 0 = inline][4 bytes: value len u32][value]
//! [1 byte: 1 = overflow][4 bytes: chain head page][4 bytes: value len u32]
//! ```
//! Branch body: `[4 bytes: first child]` then per separator
//! `[1 byte: key len][key][4 bytes: child]`. Separator `i` is the smallest
//! key reachable through child `i + 1`.

use nom::{
    multi::{count, length_data},
    number::complete::{le_u16, le_u32, le_u8},
    sequence::{pair, tuple},
    IResult,
};

use crate::error::{Error, Result};
use crate::page::{PageId, PageKind};

/// Node header length
pub(crate) const NODE_HEADER_LEN: usize = 8;

const VALUE_INLINE: u8 = 0;
const VALUE_OVERFLOW: u8 = 1;

/// Where a leaf entry keeps its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Inline(Vec<u8>),
    Overflow { head: PageId, len: u32 },
}

impl Value {
    fn encoded_len(&self) -> usize {
        match self {
            Value::Inline(bytes) => 1 + 4 + bytes.len(),
            Value::Overflow { .. } => 1 + 4 + 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Value,
}

impl Entry {
    pub(crate) fn encoded_len(&self) -> usize {
        1 + self.key.len() + self.value.encoded_len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Leaf {
    pub(crate) entries: Vec<Entry>,
}

impl Leaf {
    /// Index of `key`, or where it would be inserted.
    pub(crate) fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Branch {
    /// `keys.len() + 1` children
    pub(crate) children: Vec<PageId>,
    pub(crate) keys: Vec<Vec<u8>>,
}

impl Branch {
    /// Child that covers `key`.
    pub(crate) fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|sep| sep.as_slice() <= key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Branch(Branch),
    Leaf(Leaf),
}

impl Node {
    pub(crate) fn empty_leaf() -> Self {
        Node::Leaf(Leaf::default())
    }

    pub(crate) fn encoded_len(&self) -> usize {
        NODE_HEADER_LEN
            + match self {
                Node::Leaf(leaf) => leaf.entries.iter().map(Entry::encoded_len).sum::<usize>(),
                Node::Branch(branch) => {
                    4 + branch
                        .keys
                        .iter()
                        .map(|key| 1 + key.len() + 4)
                        .sum::<usize>()
                }
            }
    }

    /// Serialize into `page`, zeroing whatever follows.
    pub(crate) fn encode_into(&self, id: PageId, page: &mut [u8]) -> Result<()> {
        let len = self.encoded_len();
        if len > page.len() {
            return Err(Error::Internal(format!(
                "node of {len} bytes does not fit page {id}"
            )));
        }

        page.fill(0);
        let mut w = Writer { buf: page, pos: 0 };
        match self {
            Node::Leaf(leaf) => {
                w.header(PageKind::Leaf, leaf.entries.len());
                for entry in &leaf.entries {
                    w.key(&entry.key);
                    match &entry.value {
                        Value::Inline(bytes) => {
                            w.put(&[VALUE_INLINE]);
                            w.put(&(bytes.len() as u32).to_le_bytes());
                            w.put(bytes);
                        }
                        Value::Overflow { head, len } => {
                            w.put(&[VALUE_OVERFLOW]);
                            w.put(&head.to_le_bytes());
                            w.put(&len.to_le_bytes());
                        }
                    }
                }
            }
            Node::Branch(branch) => {
                w.header(PageKind::Branch, branch.keys.len());
                w.put(&branch.children[0].to_le_bytes());
                for (key, child) in branch.keys.iter().zip(&branch.children[1..]) {
                    w.key(key);
                    w.put(&child.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Parse and validate page `id` of a file with `page_count` pages.
    pub(crate) fn decode(id: PageId, page: &[u8], page_count: u32) -> Result<Node> {
        let (body, (kind, _, entries, _)) =
            node_header(page).map_err(|_| Error::corrupted(id, "truncated node header"))?;

        let node = match PageKind::from_byte(kind) {
            Some(PageKind::Leaf) => {
                let (_, raw) = count(leaf_entry, entries as usize)(body)
                    .map_err(|_| Error::corrupted(id, "truncated leaf entry"))?;
                let entries = raw
                    .into_iter()
                    .map(|(key, value)| Ok(Entry {
                        key: key.to_vec(),
                        value: value.resolve(id)?,
                    }))
                    .collect::<Result<Vec<_>>>()?;
                Node::Leaf(Leaf { entries })
            }
            Some(PageKind::Branch) => {
                let (_, (first, raw)) = pair(le_u32, count(branch_entry, entries as usize))(body)
                    .map_err(|_| Error::corrupted(id, "truncated branch entry"))?;
                let mut children = Vec::with_capacity(raw.len() + 1);
                let mut keys = Vec::with_capacity(raw.len());
                children.push(PageId::new(first));
                for (key, child) in raw {
                    keys.push(key.to_vec());
                    children.push(PageId::new(child));
                }
                Node::Branch(Branch { children, keys })
            }
            _ => {
                return Err(Error::corrupted(
                    id,
                    format!("expected a branch or leaf page, found kind {kind}"),
                ))
            }
        };

        node.validate(id, page_count)?;
        Ok(node)
    }

    fn validate(&self, id: PageId, page_count: u32) -> Result<()> {
        match self {
            Node::Leaf(leaf) => {
                if !strictly_ascending(leaf.entries.iter().map(|e| e.key.as_slice())) {
                    return Err(Error::corrupted(id, "leaf keys out of order"));
                }
                for entry in &leaf.entries {
                    if let Value::Overflow { head, .. } = entry.value {
                        if !head.is_data_page(page_count) {
                            return Err(Error::corrupted(
                                id,
                                format!("overflow value points at page {head}"),
                            ));
                        }
                    }
                }
            }
            Node::Branch(branch) => {
                if !strictly_ascending(branch.keys.iter().map(Vec::as_slice)) {
                    return Err(Error::corrupted(id, "branch keys out of order"));
                }
                if let Some(child) = branch
                    .children
                    .iter()
                    .find(|child| !child.is_data_page(page_count) || **child == id)
                {
                    return Err(Error::corrupted(
                        id,
                        format!("branch points at page {child}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn strictly_ascending<'a>(keys: impl Iterator<Item = &'a [u8]>) -> bool {
    let mut prev: Option<&[u8]> = None;
    for key in keys {
        if prev.is_some_and(|prev| prev >= key) {
            return false;
        }
        prev = Some(key);
    }
    true
}

enum RawValue<'a> {
    Inline(&'a [u8]),
    Overflow(u32, u32),
    Unknown(u8),
}

impl RawValue<'_> {
    fn resolve(self, id: PageId) -> Result<Value> {
        match self {
            RawValue::Inline(bytes) => Ok(Value::Inline(bytes.to_vec())),
            RawValue::Overflow(head, len) => Ok(Value::Overflow {
                head: PageId::new(head),
                len,
            }),
            RawValue::Unknown(tag) => Err(Error::corrupted(
                id,
                format!("unknown value tag {tag}"),
            )),
        }
    }
}

fn node_header(input: &[u8]) -> IResult<&[u8], (u8, u8, u16, u32)> {
    tuple((le_u8, le_u8, le_u16, le_u32))(input)
}

fn leaf_entry(input: &[u8]) -> IResult<&[u8], (&[u8], RawValue<'_>)> {
    let (input, key) = length_data(le_u8)(input)?;
    let (input, tag) = le_u8(input)?;
    match tag {
        VALUE_INLINE => {
            let (input, value) = length_data(le_u32)(input)?;
            Ok((input, (key, RawValue::Inline(value))))
        }
        VALUE_OVERFLOW => {
            let (input, (head, len)) = pair(le_u32, le_u32)(input)?;
            Ok((input, (key, RawValue::Overflow(head, len))))
        }
        other => Ok((input, (key, RawValue::Unknown(other)))),
    }
}

fn branch_entry(input: &[u8]) -> IResult<&[u8], (&[u8], u32)> {
    pair(length_data(le_u8), le_u32)(input)
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn header(&mut self, kind: PageKind, entries: usize) {
        self.put(&[kind as u8, 0]);
        self.put(&(entries as u16).to_le_bytes());
        self.put(&[0; 4]);
    }

    fn key(&mut self, key: &[u8]) {
        self.put(&[key.len() as u8]);
        self.put(key);
    }
}
