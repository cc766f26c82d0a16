//! C4 — Outline Walker.
//!
//! Pure function of `(struct_tree, current leaf, learner's block_position vs
//! leaf block count)`: returns an ordered list of outline transitions.
//! A tree-walk that owns no I/O — all persistence side effects are
//! applied by the caller (`runner::BlockRunner`) from the returned
//! updates.

use crate::outline::tree::{StructNode, StructTree};
use crate::types::Bid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionKind {
    LeafStart,
    NodeStart,
    LeafCompleted,
    NodeCompleted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutlineTransition {
    pub outline_bid: Bid,
    pub title: String,
    pub kind: TransitionKind,
    pub has_children: bool,
}

/// Entering a not-yet-started leaf: emit `NODE_START` for every ancestor
/// along the root→leaf path, then `LEAF_START` for the leaf itself.
pub fn enter_leaf(tree: &StructTree, leaf_bid: &str) -> Vec<OutlineTransition> {
    let Some(path) = tree.root.path_to(leaf_bid) else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(path.len());
    for (i, node) in path.iter().enumerate() {
        if node.hidden {
            continue;
        }
        let is_leaf = i == path.len() - 1;
        out.push(OutlineTransition {
            outline_bid: node.bid.clone(),
            title: node.title.clone(),
            kind: if is_leaf { TransitionKind::LeafStart } else { TransitionKind::NodeStart },
            has_children: !node.children.is_empty(),
        });
    }
    out
}

/// The learner finished the current leaf's block list. Walk up, completing
/// nodes with no remaining siblings, until a next leaf is found (walking
/// down its leftmost chain) or the whole tree is exhausted (course done).
pub fn complete_leaf_and_advance(tree: &StructTree, leaf_bid: &str) -> Vec<OutlineTransition> {
    let Some(path) = tree.root.path_to(leaf_bid) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let leaf = *path.last().unwrap();
    out.push(OutlineTransition {
        outline_bid: leaf.bid.clone(),
        title: leaf.title.clone(),
        kind: TransitionKind::LeafCompleted,
        has_children: !leaf.children.is_empty(),
    });

    // Walk the ancestor chain (excluding the leaf itself), from the
    // leaf's immediate parent upward, looking for the next visible
    // sibling at each level.
    let mut idx = path.len().saturating_sub(1);
    while idx > 0 {
        let child = path[idx];
        let parent = path[idx - 1];

        if let Some(sibling) = parent.next_visible_sibling(&child.bid) {
            // Found the next subtree to enter: descend its leftmost chain.
            descend_leftmost(sibling, &mut out);
            return out;
        }

        out.push(OutlineTransition {
            outline_bid: parent.bid.clone(),
            title: parent.title.clone(),
            kind: TransitionKind::NodeCompleted,
            has_children: !parent.children.is_empty(),
        });
        idx -= 1;
    }

    out
}

/// Emit `NODE_START` for every internal node on the way down, then
/// `LEAF_START` for the first leaf reached, skipping hidden nodes.
fn descend_leftmost(start: &StructNode, out: &mut Vec<OutlineTransition>) {
    let mut node = start;
    loop {
        if node.hidden {
            // A hidden node is skipped entirely; look for its first
            // visible child, or treat it as transparent and keep descending.
        }
        if node.is_leaf_outline() {
            if !node.hidden {
                out.push(OutlineTransition {
                    outline_bid: node.bid.clone(),
                    title: node.title.clone(),
                    kind: TransitionKind::LeafStart,
                    has_children: !node.children.is_empty(),
                });
            }
            return;
        }
        if !node.hidden {
            out.push(OutlineTransition {
                outline_bid: node.bid.clone(),
                title: node.title.clone(),
                kind: TransitionKind::NodeStart,
                has_children: !node.children.is_empty(),
            });
        }
        match node.children.iter().find(|c| !c.hidden) {
            Some(next) => node = next,
            None => return,
        }
    }
}
