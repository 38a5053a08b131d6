//! # Ordered Map Module
//!
//! A self-balancing binary search tree over raw byte keys. It backs the
//! mutable memory segment, so its semantics are shaped by segment
//! shadowing rather than by a general-purpose map:
//!
//! - [`Tree::remove`] never deletes a node. It replaces the value with a
//!   tombstone (`None`) so that scans can announce "this key was removed"
//!   and shadow the same key in older segments. Removing an absent key
//!   still inserts an explicit tombstone entry.
//! - [`Tree::range`] yields tombstones; filtering is the caller's job.
//!
//! Balancing is AVL-style with a per-node balance factor. Because nodes
//! are never deleted, only the insert rebalancing cases exist.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;

// ------------------------------------------------------------------------------------------------
// Key ordering
// ------------------------------------------------------------------------------------------------

/// Total order over raw keys.
pub(crate) type KeyCompare = fn(&[u8], &[u8]) -> Ordering;

/// The default byte-wise ordering. The on-disk block binary search assumes
/// this order, so the full storage stack always uses it; alternate orders
/// are only meaningful for a tree used on its own.
pub(crate) fn lexicographic(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

// ------------------------------------------------------------------------------------------------
// Tree
// ------------------------------------------------------------------------------------------------

/// Balanced ordered map from byte keys to optional values.
///
/// A `None` value is a tombstone, not an absent entry — [`Tree::find`]
/// distinguishes the two.
pub(crate) struct Tree {
    root: Option<Box<Node>>,
    compare: KeyCompare,
}

struct Node {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
    /// height(right) - height(left); always in -1..=1 between operations.
    bal: i8,
}

impl Tree {
    pub fn new() -> Self {
        Self::with_comparator(lexicographic)
    }

    pub fn with_comparator(compare: KeyCompare) -> Self {
        Tree {
            root: None,
            compare,
        }
    }

    /// Insert or overwrite. `None` stores a tombstone.
    pub fn insert(&mut self, key: &[u8], value: Option<Vec<u8>>) {
        let (root, _) = insert_node(self.root.take(), key, value, self.compare);
        self.root = Some(root);
    }

    /// Look up a key. `Some(&None)` means the key is present as a tombstone.
    pub fn find(&self, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        let mut node = self.root.as_deref();
        while let Some(n) = node {
            match (self.compare)(key, &n.key) {
                Ordering::Equal => return Some(&n.value),
                Ordering::Less => node = n.left.as_deref(),
                Ordering::Greater => node = n.right.as_deref(),
            }
        }
        None
    }

    /// Replace the entry's value with a tombstone and return the previous
    /// value. An absent key gets an explicit tombstone entry inserted —
    /// callers remove keys that may only exist in older segments.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let mut node = self.root.as_deref_mut();
        while let Some(n) = node {
            match (self.compare)(key, &n.key) {
                Ordering::Equal => return n.value.take(),
                Ordering::Less => node = n.left.as_deref_mut(),
                Ordering::Greater => node = n.right.as_deref_mut(),
            }
        }
        self.insert(key, None);
        None
    }

    /// In-order entries in `[lower, upper]`, inclusive on both ends.
    /// `None` bounds are unbounded. Tombstones are included.
    pub fn range(&self, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let mut out = Vec::new();
        collect_range(self.root.as_deref(), lower, upper, self.compare, &mut out);
        out
    }

    #[cfg(test)]
    pub fn height(&self) -> usize {
        fn h(node: Option<&Node>) -> usize {
            node.map_or(0, |n| 1 + h(n.left.as_deref()).max(h(n.right.as_deref())))
        }
        h(self.root.as_deref())
    }

    /// Checks that every stored balance factor matches the actual subtree
    /// heights and stays within the AVL bound.
    #[cfg(test)]
    pub fn assert_balanced(&self) {
        fn check(node: Option<&Node>) -> usize {
            let Some(n) = node else { return 0 };
            let lh = check(n.left.as_deref());
            let rh = check(n.right.as_deref());
            assert_eq!(
                n.bal as isize,
                rh as isize - lh as isize,
                "stale balance factor at {:?}",
                n.key
            );
            assert!(n.bal.abs() <= 1, "unbalanced node at {:?}", n.key);
            1 + lh.max(rh)
        }
        check(self.root.as_deref());
    }
}

// ------------------------------------------------------------------------------------------------
// Insertion and rebalancing
// ------------------------------------------------------------------------------------------------

/// Inserts below `node`, returning the new subtree root and whether the
/// subtree height grew.
fn insert_node(
    node: Option<Box<Node>>,
    key: &[u8],
    value: Option<Vec<u8>>,
    compare: KeyCompare,
) -> (Box<Node>, bool) {
    let Some(mut n) = node else {
        let fresh = Box::new(Node {
            key: key.to_vec(),
            value,
            left: None,
            right: None,
            bal: 0,
        });
        return (fresh, true);
    };

    let grew = match compare(key, &n.key) {
        Ordering::Equal => {
            n.value = value;
            false
        }
        Ordering::Less => {
            let (child, grew) = insert_node(n.left.take(), key, value, compare);
            n.left = Some(child);
            if grew {
                n.bal -= 1;
                if n.bal < -1 {
                    n = rebalance_left(n);
                    false
                } else {
                    n.bal < 0
                }
            } else {
                false
            }
        }
        Ordering::Greater => {
            let (child, grew) = insert_node(n.right.take(), key, value, compare);
            n.right = Some(child);
            if grew {
                n.bal += 1;
                if n.bal > 1 {
                    n = rebalance_right(n);
                    false
                } else {
                    n.bal > 0
                }
            } else {
                false
            }
        }
    };
    (n, grew)
}

/// Restores balance when `n.bal` reached -2 (left-heavy).
fn rebalance_left(mut n: Box<Node>) -> Box<Node> {
    let Some(mut l) = n.left.take() else { return n };
    if l.bal <= 0 {
        // Left-left: single right rotation.
        n.left = l.right.take();
        n.bal = 0;
        l.bal = 0;
        l.right = Some(n);
        l
    } else {
        // Left-right: the grandchild becomes the subtree root.
        let Some(mut g) = l.right.take() else {
            n.left = Some(l);
            return n;
        };
        l.right = g.left.take();
        n.left = g.right.take();
        l.bal = if g.bal > 0 { -1 } else { 0 };
        n.bal = if g.bal < 0 { 1 } else { 0 };
        g.bal = 0;
        g.left = Some(l);
        g.right = Some(n);
        g
    }
}

/// Mirror of [`rebalance_left`] for `n.bal` == 2.
fn rebalance_right(mut n: Box<Node>) -> Box<Node> {
    let Some(mut r) = n.right.take() else { return n };
    if r.bal >= 0 {
        n.right = r.left.take();
        n.bal = 0;
        r.bal = 0;
        r.left = Some(n);
        r
    } else {
        let Some(mut g) = r.left.take() else {
            n.right = Some(r);
            return n;
        };
        r.left = g.right.take();
        n.right = g.left.take();
        r.bal = if g.bal < 0 { 1 } else { 0 };
        n.bal = if g.bal > 0 { -1 } else { 0 };
        g.bal = 0;
        g.right = Some(r);
        g.left = Some(n);
        g
    }
}

// ------------------------------------------------------------------------------------------------
// Range collection
// ------------------------------------------------------------------------------------------------

fn collect_range(
    node: Option<&Node>,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    compare: KeyCompare,
    out: &mut Vec<(Vec<u8>, Option<Vec<u8>>)>,
) {
    let Some(n) = node else { return };

    // Keys below n.key can only qualify when lower is strictly below n.key.
    if lower.is_none_or(|lo| compare(lo, &n.key) == Ordering::Less) {
        collect_range(n.left.as_deref(), lower, upper, compare, out);
    }

    let above_lower = lower.is_none_or(|lo| compare(lo, &n.key) != Ordering::Greater);
    let below_upper = upper.is_none_or(|up| compare(&n.key, up) != Ordering::Greater);
    if above_lower && below_upper {
        out.push((n.key.clone(), n.value.clone()));
    }

    if upper.is_none_or(|up| compare(&n.key, up) == Ordering::Less) {
        collect_range(n.right.as_deref(), lower, upper, compare, out);
    }
}
