//! Positioned, bidirectional traversal
//!
//! A cursor keeps the path of `(page, index)` pairs from the root down to
//! the current leaf entry, plus the decoded leaf. Leaves carry no sibling
//! links, so moving past the end of a leaf climbs to the nearest ancestor
//! with a neighbouring child and descends along its near edge. An empty
//! path means the cursor is exhausted.

use crate::error::{Error, Result};
use crate::page::PageId;

use super::node::{Entry, Leaf, Node};
use super::{BTree, PageSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Default)]
pub(crate) struct Cursor {
    path: Vec<(PageId, usize)>,
    leaf: Leaf,
}

impl Cursor {
    /// Positioned at the smallest key.
    pub(crate) fn first<S: PageSource>(tree: &BTree<S>) -> Result<Self> {
        Self::edge(tree, Direction::Forward)
    }

    /// Positioned at the largest key.
    pub(crate) fn last<S: PageSource>(tree: &BTree<S>) -> Result<Self> {
        Self::edge(tree, Direction::Backward)
    }

    /// Positioned at the smallest key `>= key`, exhausted if there is none.
    pub(crate) fn seek<S: PageSource>(tree: &BTree<S>, key: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::default();
        let mut id = tree.pages.root();
        loop {
            tree.check_depth(id, cursor.path.len() as u32)?;
            match tree.node(id)? {
                Node::Branch(branch) => {
                    let i = branch.child_index(key);
                    cursor.path.push((id, i));
                    id = branch.children[i];
                }
                Node::Leaf(leaf) => {
                    let i = match leaf.search(key) {
                        Ok(i) | Err(i) => i,
                    };
                    let past_end = i >= leaf.len();
                    cursor.path.push((id, i));
                    cursor.leaf = leaf;
                    if past_end {
                        cursor.climb(tree, Direction::Forward)?;
                    }
                    return Ok(cursor);
                }
            }
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.path.is_empty()
    }

    pub(crate) fn entry(&self) -> Option<&Entry> {
        let (_, index) = self.path.last()?;
        self.leaf.entries.get(*index)
    }

    pub(crate) fn next<S: PageSource>(&mut self, tree: &BTree<S>) -> Result<bool> {
        self.step(tree, Direction::Forward)
    }

    pub(crate) fn prev<S: PageSource>(&mut self, tree: &BTree<S>) -> Result<bool> {
        self.step(tree, Direction::Backward)
    }

    fn edge<S: PageSource>(tree: &BTree<S>, dir: Direction) -> Result<Self> {
        let mut cursor = Cursor::default();
        cursor.descend(tree, tree.pages.root(), dir)?;
        if cursor.leaf.is_empty() {
            cursor.climb(tree, dir)?;
        }
        Ok(cursor)
    }

    fn step<S: PageSource>(&mut self, tree: &BTree<S>, dir: Direction) -> Result<bool> {
        let Some((_, index)) = self.path.last_mut() else {
            return Ok(false);
        };

        let moved = match dir {
            Direction::Forward => (*index + 1 < self.leaf.len()).then_some(*index + 1),
            Direction::Backward => index.checked_sub(1),
        };
        match moved {
            Some(next) => {
                *index = next;
                Ok(true)
            }
            None => self.climb(tree, dir),
        }
    }

    /// Follow the edge of the subtree at `id` down to a leaf.
    fn descend<S: PageSource>(&mut self, tree: &BTree<S>, mut id: PageId, dir: Direction) -> Result<()> {
        loop {
            tree.check_depth(id, self.path.len() as u32)?;
            match tree.node(id)? {
                Node::Branch(branch) => {
                    let i = match dir {
                        Direction::Forward => 0,
                        Direction::Backward => branch.children.len() - 1,
                    };
                    self.path.push((id, i));
                    id = branch.children[i];
                }
                Node::Leaf(leaf) => {
                    let i = match dir {
                        Direction::Forward => 0,
                        Direction::Backward => leaf.len().saturating_sub(1),
                    };
                    self.path.push((id, i));
                    self.leaf = leaf;
                    return Ok(());
                }
            }
        }
    }

    /// Leave the current leaf for the next non-empty one in `dir`.
    ///
    /// Returns `false`, leaving the cursor exhausted, at either end.
    fn climb<S: PageSource>(&mut self, tree: &BTree<S>, dir: Direction) -> Result<bool> {
        loop {
            self.path.pop();
            let Some((id, index)) = self.path.last().copied() else {
                self.leaf = Leaf::default();
                return Ok(false);
            };

            let Node::Branch(branch) = tree.node(id)? else {
                return Err(Error::corrupted(id, "cursor path expects a branch"));
            };
            let neighbour = match dir {
                Direction::Forward => (index + 1 < branch.children.len()).then_some(index + 1),
                Direction::Backward => index.checked_sub(1),
            };
            let Some(neighbour) = neighbour else {
                continue;
            };

            if let Some(last) = self.path.last_mut() {
                last.1 = neighbour;
            }
            self.descend(tree, branch.children[neighbour], dir)?;
            if !self.leaf.is_empty() {
                return Ok(true);
            }
        }
    }
}
