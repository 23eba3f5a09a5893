//! Structural check of one tree version

use std::collections::HashSet;

use serde::Serialize;

use crate::chain;
use crate::error::{Error, Result};
use crate::page::PageId;

use super::node::{Node, Value};
use super::{BTree, PageSource};

/// Shape of a verified tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeReport {
    /// Levels from the root to the leaves; 1 for a lone leaf
    pub depth: u32,
    /// Branch pages reachable from the root
    pub branch_pages: u64,
    /// Leaf pages reachable from the root
    pub leaf_pages: u64,
    /// Pages holding overflow values
    pub overflow_pages: u64,
    /// Key-value pairs
    pub entries: u64,
}

impl TreeReport {
    /// Every page the tree occupies.
    pub fn total_pages(&self) -> u64 {
        self.branch_pages + self.leaf_pages + self.overflow_pages
    }
}

struct Walk {
    seen: HashSet<PageId, ahash::RandomState>,
    leaf_depth: Option<u32>,
    report: TreeReport,
}

impl Walk {
    fn visit(&mut self, id: PageId) -> Result<()> {
        if !self.seen.insert(id) {
            return Err(Error::corrupted(id, "page is reachable more than once"));
        }
        Ok(())
    }
}

impl<S: PageSource> BTree<S> {
    /// Walk every page of the tree checking key order, separator bounds,
    /// uniform leaf depth and that no page is reachable twice.
    pub(crate) fn verify(&self) -> Result<TreeReport> {
        let mut walk = Walk {
            seen: HashSet::default(),
            leaf_depth: None,
            report: TreeReport::default(),
        };
        self.verify_node(self.pages.root(), None, None, 1, &mut walk)?;

        let mut report = walk.report;
        report.depth = walk.leaf_depth.unwrap_or(1);
        Ok(report)
    }

    fn verify_node(
        &self,
        id: PageId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: u32,
        walk: &mut Walk,
    ) -> Result<()> {
        walk.visit(id)?;
        let in_bounds =
            |key: &[u8]| lower.map_or(true, |lo| key >= lo) && upper.map_or(true, |hi| key < hi);

        match self.node(id)? {
            Node::Leaf(leaf) => {
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(Error::corrupted(
                            id,
                            format!("leaf at depth {depth}, others at {expected}"),
                        ))
                    }
                    Some(_) => {}
                }
                walk.report.leaf_pages += 1;

                for entry in &leaf.entries {
                    if !in_bounds(entry.key.as_slice()) {
                        return Err(Error::corrupted(id, "leaf key outside its separators"));
                    }
                    if let Value::Overflow { head, .. } = &entry.value {
                        for page in chain::pages(&self.pages, *head)? {
                            walk.visit(page)?;
                            walk.report.overflow_pages += 1;
                        }
                        self.load_value(&entry.value)?;
                    }
                }
                walk.report.entries += leaf.entries.len() as u64;
            }
            Node::Branch(branch) => {
                walk.report.branch_pages += 1;
                if !branch.keys.iter().all(|key| in_bounds(key.as_slice())) {
                    return Err(Error::corrupted(id, "separator outside its parent's range"));
                }

                for (i, child) in branch.children.iter().enumerate() {
                    let lo = if i == 0 {
                        lower
                    } else {
                        Some(branch.keys[i - 1].as_slice())
                    };
                    let hi = branch.keys.get(i).map(Vec::as_slice).or(upper);
                    self.verify_node(*child, lo, hi, depth + 1, walk)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::{Branch, Entry, Leaf};
    use crate::btree::testing::MemPages;
    use crate::btree::PageSink;

    const PAGE: usize = 4096;

    fn write(pages: &mut MemPages, node: &Node) -> PageId {
        let id = pages.alloc().unwrap();
        node.encode_into(id, pages.page_mut(id).unwrap()).unwrap();
        id
    }

    fn leaf(keys: &[&[u8]]) -> Node {
        Node::Leaf(Leaf {
            entries: keys
                .iter()
                .map(|key| Entry {
                    key: key.to_vec(),
                    value: Value::Inline(b"v".to_vec()),
                })
                .collect(),
        })
    }

    #[test]
    fn test_report_counts() {
        let mut pages = MemPages::new(PAGE);
        let mut tree = BTree::new(&mut pages);
        for i in 0..400u32 {
            tree.put(&i.to_be_bytes(), &[0u8; 100]).unwrap();
        }
        tree.put(b"huge", &vec![1u8; 2 * PAGE]).unwrap();

        let report = tree.verify().unwrap();
        assert_eq!(report.entries, 401);
        assert_eq!(report.depth, 2);
        assert_eq!(report.branch_pages, 1);
        assert!(report.leaf_pages > 1);
        assert_eq!(report.overflow_pages, 3);
        drop(tree);
        assert_eq!(report.total_pages() as usize, pages.live_pages());
    }

    #[test]
    fn test_separator_violation() {
        let mut pages = MemPages::new(PAGE);
        let left = write(&mut pages, &leaf(&[b"a", b"q"]));
        let right = write(&mut pages, &leaf(&[b"r", b"s"]));
        let root = write(
            &mut pages,
            &Node::Branch(Branch {
                children: vec![left, right],
                keys: vec![b"m".to_vec()],
            }),
        );
        pages.set_root(root);

        let err = BTree::new(&pages).verify().unwrap_err();
        assert!(matches!(err, Error::Corrupted { page, .. } if page == left));
    }

    #[test]
    fn test_shared_child() {
        let mut pages = MemPages::new(PAGE);
        let child = write(&mut pages, &leaf(&[]));
        let root = write(
            &mut pages,
            &Node::Branch(Branch {
                children: vec![child, child],
                keys: vec![b"m".to_vec()],
            }),
        );
        pages.set_root(root);

        assert!(matches!(
            BTree::new(&pages).verify(),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_uneven_depth() {
        let mut pages = MemPages::new(PAGE);
        let deep = write(&mut pages, &leaf(&[b"a"]));
        let middle = write(
            &mut pages,
            &Node::Branch(Branch {
                children: vec![deep],
                keys: vec![],
            }),
        );
        let shallow = write(&mut pages, &leaf(&[b"z"]));
        let root = write(
            &mut pages,
            &Node::Branch(Branch {
                children: vec![middle, shallow],
                keys: vec![b"m".to_vec()],
            }),
        );
        pages.set_root(root);

        assert!(matches!(
            BTree::new(&pages).verify(),
            Err(Error::Corrupted { page, .. }) if page == shallow
        ));
    }
}
