//! Lookup, insert and delete
//!
//! Mutations rewrite every node on the path from the root to the leaf:
//! each rewritten node lands on a shadow page and its parent is updated to
//! point there. A node that outgrows its page splits in two by encoded
//! size; an underfull node is merged with an underfull neighbour.

use std::mem;

use crate::chain;
use crate::error::{Error, Result};
use crate::page::PageId;

use super::node::{Branch, Entry, Leaf, Node, Value};
use super::{BTree, PageSink, PageSource};

/// A node at or below this share of a page (in percent) may be merged
const UNDERFLOW_PERCENT: usize = 35;

/// Outcome of rewriting a node during insert
struct Rewritten {
    id: PageId,
    /// Separator and page of the right half when the node split
    split: Option<(Vec<u8>, PageId)>,
}

/// Outcome of rewriting a node during delete
struct Shrunk {
    id: PageId,
    len: usize,
    empty: bool,
}

impl<S: PageSource> BTree<S> {
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.find(key)? {
            Some(value) => self.load_value(&value).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Materialize a leaf value, following its overflow chain if needed.
    pub(crate) fn load_value(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Inline(bytes) => Ok(bytes.clone()),
            Value::Overflow { head, len } => {
                let bytes = chain::read(&self.pages, *head)?;
                if bytes.len() != *len as usize {
                    return Err(Error::corrupted(
                        *head,
                        format!(
                            "overflow value holds {} bytes, leaf expects {len}",
                            bytes.len()
                        ),
                    ));
                }
                Ok(bytes)
            }
        }
    }

    fn find(&self, key: &[u8]) -> Result<Option<Value>> {
        let mut id = self.pages.root();
        let mut depth = 0;
        loop {
            self.check_depth(id, depth)?;
            match self.node(id)? {
                Node::Branch(branch) => id = branch.children[branch.child_index(key)],
                Node::Leaf(mut leaf) => {
                    return Ok(leaf
                        .search(key)
                        .ok()
                        .map(|i| leaf.entries.swap_remove(i).value))
                }
            }
            depth += 1;
        }
    }

    /// A path longer than the file has pages can only come from a cycle.
    pub(crate) fn check_depth(&self, id: PageId, depth: u32) -> Result<()> {
        if depth >= self.pages.page_count() {
            return Err(Error::corrupted(id, "tree path loops back on itself"));
        }
        Ok(())
    }

    fn is_underfull(&self, len: usize) -> bool {
        len * 100 <= self.pages.page_size() * UNDERFLOW_PERCENT
    }
}

impl<S: PageSink> BTree<S> {
    /// Insert or overwrite `key`.
    pub(crate) fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let value = if value.len() > self.overflow_threshold() {
            let head = chain::write(&mut self.pages, value)?;
            Value::Overflow {
                head,
                len: value.len() as u32,
            }
        } else {
            Value::Inline(value.to_vec())
        };

        let entry = Entry {
            key: key.to_vec(),
            value,
        };
        let root = self.pages.root();
        let (root, replaced) = self.insert_at(root, entry, 0)?;

        let root = match root.split {
            None => root.id,
            // Root split: the tree grows by one level.
            Some((sep, right)) => self.store_new(&Node::Branch(Branch {
                children: vec![root.id, right],
                keys: vec![sep],
            }))?,
        };
        self.pages.set_root(root);

        if let Some(Value::Overflow { head, .. }) = replaced {
            chain::free(&mut self.pages, head)?;
        }
        Ok(())
    }

    /// Remove `key`. Returns `false`, without touching any page, when it is absent.
    pub(crate) fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if self.find(key)?.is_none() {
            return Ok(false);
        }

        let root = self.pages.root();
        let (root, removed) = self.remove_at(root, key, 0)?;

        // A branch left with a single child hands the root to that child.
        let mut root = root.id;
        loop {
            match self.node(root)? {
                Node::Branch(branch) if branch.keys.is_empty() => {
                    self.pages.retire(root);
                    root = branch.children[0];
                }
                _ => break,
            }
        }
        self.pages.set_root(root);

        if let Value::Overflow { head, .. } = removed {
            chain::free(&mut self.pages, head)?;
        }
        Ok(true)
    }

    fn insert_at(
        &mut self,
        id: PageId,
        entry: Entry,
        depth: u32,
    ) -> Result<(Rewritten, Option<Value>)> {
        self.check_depth(id, depth)?;

        match self.node(id)? {
            Node::Leaf(mut leaf) => {
                let replaced = match leaf.search(&entry.key) {
                    Ok(i) => Some(mem::replace(&mut leaf.entries[i].value, entry.value)),
                    Err(i) => {
                        leaf.entries.insert(i, entry);
                        None
                    }
                };
                Ok((self.store_split(id, Node::Leaf(leaf))?, replaced))
            }
            Node::Branch(mut branch) => {
                let i = branch.child_index(&entry.key);
                let (child, replaced) = self.insert_at(branch.children[i], entry, depth + 1)?;

                branch.children[i] = child.id;
                if let Some((sep, right)) = child.split {
                    branch.keys.insert(i, sep);
                    branch.children.insert(i + 1, right);
                }
                Ok((self.store_split(id, Node::Branch(branch))?, replaced))
            }
        }
    }

    /// Write `node` over `old`, splitting it first if it outgrew the page.
    fn store_split(&mut self, old: PageId, node: Node) -> Result<Rewritten> {
        if node.encoded_len() <= self.pages.page_size() {
            return Ok(Rewritten {
                id: self.store_over(old, &node)?,
                split: None,
            });
        }

        let (left, sep, right) = split(old, node)?;
        let id = self.store_over(old, &left)?;
        let right = self.store_new(&right)?;
        Ok(Rewritten {
            id,
            split: Some((sep, right)),
        })
    }

    fn remove_at(&mut self, id: PageId, key: &[u8], depth: u32) -> Result<(Shrunk, Value)> {
        self.check_depth(id, depth)?;

        match self.node(id)? {
            Node::Leaf(mut leaf) => {
                let i = leaf
                    .search(key)
                    .map_err(|_| Error::Internal(format!("key vanished from page {id}")))?;
                let removed = leaf.entries.remove(i);
                let empty = leaf.is_empty();
                let node = Node::Leaf(leaf);
                let shrunk = Shrunk {
                    len: node.encoded_len(),
                    empty,
                    id: self.store_over(id, &node)?,
                };
                Ok((shrunk, removed.value))
            }
            Node::Branch(mut branch) => {
                let i = branch.child_index(key);
                let (child, removed) = self.remove_at(branch.children[i], key, depth + 1)?;
                branch.children[i] = child.id;

                let mut empty = false;
                if child.empty && branch.children.len() > 1 {
                    self.retire_subtree(child.id)?;
                    branch.children.remove(i);
                    branch.keys.remove(i.saturating_sub(1));
                } else if child.empty {
                    // Sole child is empty: this branch is empty too.
                    empty = true;
                } else if self.is_underfull(child.len) {
                    self.merge_child(&mut branch, i)?;
                }

                let node = Node::Branch(branch);
                let shrunk = Shrunk {
                    len: node.encoded_len(),
                    empty,
                    id: self.store_over(id, &node)?,
                };
                Ok((shrunk, removed))
            }
        }
    }

    /// Retire an empty subtree: single-child branches down to an empty leaf.
    fn retire_subtree(&mut self, mut id: PageId) -> Result<()> {
        loop {
            let node = self.node(id)?;
            self.pages.retire(id);
            match node {
                Node::Branch(branch) => id = branch.children[0],
                Node::Leaf(_) => return Ok(()),
            }
        }
    }

    /// Merge child `i` of `branch` with an underfull neighbour, preferring
    /// the left one. Leaves `branch` untouched when neither qualifies.
    fn merge_child(&mut self, branch: &mut Branch, i: usize) -> Result<()> {
        let neighbours = [
            i.checked_sub(1),
            (i + 1 < branch.children.len()).then_some(i + 1),
        ];

        for sibling in neighbours.into_iter().flatten() {
            let (l, r) = if sibling < i { (sibling, i) } else { (i, sibling) };
            let (left_id, right_id) = (branch.children[l], branch.children[r]);

            let left = self.node(left_id)?;
            let right = self.node(right_id)?;
            let sibling_len = (if sibling == l { &left } else { &right }).encoded_len();
            if !self.is_underfull(sibling_len) {
                continue;
            }

            let merged = match (left, right) {
                (Node::Leaf(mut left), Node::Leaf(right)) => {
                    left.entries.extend(right.entries);
                    Node::Leaf(left)
                }
                (Node::Branch(mut left), Node::Branch(right)) => {
                    left.keys.push(branch.keys[l].clone());
                    left.keys.extend(right.keys);
                    left.children.extend(right.children);
                    Node::Branch(left)
                }
                _ => {
                    return Err(Error::corrupted(
                        right_id,
                        "sibling pages sit at different depths",
                    ))
                }
            };
            if merged.encoded_len() > self.pages.page_size() {
                continue;
            }

            branch.children[l] = self.store_over(left_id, &merged)?;
            self.pages.retire(right_id);
            branch.children.remove(r);
            branch.keys.remove(l);
            return Ok(());
        }
        Ok(())
    }
}

/// Split an oversized node into two halves of similar encoded size.
fn split(id: PageId, node: Node) -> Result<(Node, Vec<u8>, Node)> {
    match node {
        Node::Leaf(mut leaf) => {
            if leaf.len() < 2 {
                return Err(Error::Internal(format!(
                    "single entry does not fit page {id}"
                )));
            }
            let sizes: Vec<usize> = leaf.entries.iter().map(Entry::encoded_len).collect();
            let mid = midpoint(&sizes).clamp(1, leaf.len() - 1);

            let right = Leaf {
                entries: leaf.entries.split_off(mid),
            };
            let sep = right.entries[0].key.clone();
            Ok((Node::Leaf(leaf), sep, Node::Leaf(right)))
        }
        Node::Branch(mut branch) => {
            if branch.keys.len() < 3 {
                return Err(Error::Internal(format!(
                    "branch with {} keys does not fit page {id}",
                    branch.keys.len()
                )));
            }
            let sizes: Vec<usize> = branch.keys.iter().map(|key| 1 + key.len() + 4).collect();
            let mid = midpoint(&sizes).clamp(1, branch.keys.len() - 2);

            // keys[mid] moves up; the halves keep the keys on either side.
            let right_keys = branch.keys.split_off(mid + 1);
            let right_children = branch.children.split_off(mid + 1);
            let sep = branch
                .keys
                .pop()
                .ok_or_else(|| Error::Internal("branch split lost its separator".to_string()))?;

            let right = Branch {
                children: right_children,
                keys: right_keys,
            };
            Ok((Node::Branch(branch), sep, Node::Branch(right)))
        }
    }
}

/// First index where the running size reaches half of the total.
fn midpoint(sizes: &[usize]) -> usize {
    let half = sizes.iter().sum::<usize>() / 2;
    let mut acc = 0;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc >= half {
            return i + 1;
        }
    }
    sizes.len()
}
