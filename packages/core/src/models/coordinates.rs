//! Nested-set coordinate arithmetic
//!
//! Pure functions over in-memory nodes: where a batch lands relative to a
//! target, how a pre-ordered batch receives `lft`/`rght`/`level`, how a tree is
//! renumbered from its parent links, and how a stored tree is checked against
//! the nested-set invariants.

use crate::models::{Node, Position, TreeId};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

/// A violated nested-set invariant, or a batch that cannot be laid out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeShapeError {
    #[error("Node {id} belongs to a different tree")]
    MixedTrees { id: String },

    #[error("Node {id} has invalid span ({lft}, {rght})")]
    BadSpan { id: String, lft: i64, rght: i64 },

    #[error("Node {id} overlaps a sibling interval")]
    Overlap { id: String },

    #[error("Root node {id} has a parent or a non-zero level")]
    RootMismatch { id: String },

    #[error("Node {id} lies outside the root interval")]
    MultipleRoots { id: String },

    #[error("Node {id} has parent {found:?}, its enclosing interval is {expected}")]
    ParentMismatch {
        id: String,
        expected: String,
        found: Option<String>,
    },

    #[error("Node {id} has level {found}, expected {expected}")]
    LevelMismatch { id: String, expected: i64, found: i64 },

    #[error("Root interval ends at {found}, expected {expected}")]
    Gap { expected: i64, found: i64 },

    #[error("Node {id} is not in pre-order relative to its parent")]
    NotPreorder { id: String },

    #[error("{count} node(s) are unreachable from the root")]
    Unreachable { count: usize },
}

/// Where the first node of an inserted batch lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub tree_id: TreeId,
    /// `lft` of the batch root; everything at or after it shifts right.
    pub cursor: i64,
    pub level: i64,
    pub parent_id: Option<String>,
}

impl Placement {
    /// Root slot of a freshly issued tree.
    pub fn new_tree(tree_id: TreeId) -> Self {
        Self {
            tree_id,
            cursor: 1,
            level: 0,
            parent_id: None,
        }
    }

    /// Slot relative to `target`.
    ///
    /// Returns `None` when the position asks for a sibling of a root node:
    /// that batch becomes a tree of its own.
    pub fn relative_to(target: &Node, position: Position) -> Option<Self> {
        if position.is_sibling() && target.is_root() {
            return None;
        }

        let (cursor, level, parent_id) = match position {
            Position::FirstChild => (target.lft + 1, target.level + 1, Some(target.id.clone())),
            Position::LastChild => (target.rght, target.level + 1, Some(target.id.clone())),
            Position::Left => (target.lft, target.level, target.parent_id.clone()),
            Position::Right => (target.rght + 1, target.level, target.parent_id.clone()),
        };

        Some(Self {
            tree_id: target.tree_id,
            cursor,
            level,
            parent_id,
        })
    }

    /// Coordinate after which existing nodes must move to make room.
    pub fn space_after(&self) -> i64 {
        self.cursor - 1
    }
}

/// Assign coordinates to a batch given in pre-order.
///
/// `nodes[0]` is the batch root and takes `placement.parent_id`; every later
/// node must name an earlier node of the batch as its parent. Returns the
/// width (`2 * nodes.len()`) the batch occupies.
pub fn layout_preorder(nodes: &mut [Node], placement: &Placement) -> Result<i64, TreeShapeError> {
    let mut cursor = placement.cursor;
    let mut open: Vec<usize> = Vec::new();

    for i in 0..nodes.len() {
        if i == 0 {
            nodes[0].parent_id = placement.parent_id.clone();
        } else {
            loop {
                let top = open.last().copied();
                match top {
                    Some(top) if nodes[i].parent_id.as_deref() == Some(nodes[top].id.as_str()) => {
                        break
                    }
                    Some(top) => {
                        nodes[top].rght = cursor;
                        cursor += 1;
                        open.pop();
                    }
                    None => {
                        return Err(TreeShapeError::NotPreorder {
                            id: nodes[i].id.clone(),
                        })
                    }
                }
            }
        }

        let level = placement.level + open.len() as i64;
        let node = &mut nodes[i];
        node.tree_id = placement.tree_id;
        node.lft = cursor;
        node.level = level;
        cursor += 1;
        open.push(i);
    }

    while let Some(top) = open.pop() {
        nodes[top].rght = cursor;
        cursor += 1;
    }

    Ok(cursor - placement.cursor)
}

/// Recompute `lft`/`rght`/`level` of a whole tree from its parent links.
///
/// Siblings keep the order of their current `lft`. Used after bulk-update
/// mode, where structural columns may have been left stale.
pub fn rebuild_coordinates(nodes: &mut [Node], tree_id: TreeId) -> Result<(), TreeShapeError> {
    if nodes.is_empty() {
        return Ok(());
    }

    let index: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i))
        .collect();

    let roots: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| match &n.parent_id {
            None => true,
            Some(parent) => !index.contains_key(parent),
        })
        .map(|(i, _)| i)
        .collect();

    let root = match roots.as_slice() {
        [single] => *single,
        [_, second, ..] => {
            return Err(TreeShapeError::MultipleRoots {
                id: nodes[*second].id.clone(),
            })
        }
        [] => return Err(TreeShapeError::Unreachable { count: nodes.len() }),
    };

    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        if i == root {
            continue;
        }
        if let Some(parent) = node.parent_id.as_ref().and_then(|p| index.get(p)) {
            children.entry(*parent).or_default().push(i);
        }
    }
    for siblings in children.values_mut() {
        siblings.sort_by_key(|&i| (nodes[i].lft, nodes[i].id.clone()));
    }

    // (node, entering) pairs; a node is pushed twice so `rght` is set on exit.
    let mut stack: Vec<(usize, bool)> = vec![(root, true)];
    let mut visited: HashSet<usize> = HashSet::new();
    let mut cursor = 1;
    let mut depth = 0;

    while let Some((i, entering)) = stack.pop() {
        if entering {
            if !visited.insert(i) {
                continue;
            }
            nodes[i].tree_id = tree_id;
            nodes[i].lft = cursor;
            nodes[i].level = depth;
            cursor += 1;
            depth += 1;
            stack.push((i, false));
            if let Some(kids) = children.get(&i) {
                for &kid in kids.iter().rev() {
                    stack.push((kid, true));
                }
            }
        } else {
            nodes[i].rght = cursor;
            cursor += 1;
            depth -= 1;
        }
    }

    nodes[root].parent_id = None;

    let missing = nodes.len() - visited.len();
    if missing > 0 {
        return Err(TreeShapeError::Unreachable { count: missing });
    }
    Ok(())
}

/// Check every nested-set invariant over all nodes of one tree.
///
/// Reports the first violation found walking the tree in `lft` order.
pub fn check_tree(nodes: &[Node]) -> Result<(), TreeShapeError> {
    let Some(first) = nodes.first() else {
        return Ok(());
    };
    let tree_id = first.tree_id;

    let mut ordered: Vec<&Node> = nodes.iter().collect();
    ordered.sort_by_key(|n| n.lft);

    let mut seen = BTreeSet::new();
    for node in &ordered {
        if node.tree_id != tree_id {
            return Err(TreeShapeError::MixedTrees {
                id: node.id.clone(),
            });
        }
        let span = node.rght - node.lft;
        if span <= 0 || span % 2 == 0 {
            return Err(TreeShapeError::BadSpan {
                id: node.id.clone(),
                lft: node.lft,
                rght: node.rght,
            });
        }
        if !seen.insert(node.lft) || !seen.insert(node.rght) {
            return Err(TreeShapeError::Overlap {
                id: node.id.clone(),
            });
        }
    }

    let root = ordered[0];
    if root.parent_id.is_some() || root.level != 0 {
        return Err(TreeShapeError::RootMismatch {
            id: root.id.clone(),
        });
    }
    let expected = 2 * ordered.len() as i64;
    if root.lft != 1 || root.rght != expected {
        return Err(TreeShapeError::Gap {
            expected,
            found: root.rght,
        });
    }

    let mut open: Vec<&Node> = vec![root];
    for node in ordered.iter().skip(1) {
        while open.last().is_some_and(|top| top.rght < node.lft) {
            open.pop();
        }
        let Some(parent) = open.last() else {
            return Err(TreeShapeError::MultipleRoots {
                id: node.id.clone(),
            });
        };
        if node.rght > parent.rght {
            return Err(TreeShapeError::Overlap {
                id: node.id.clone(),
            });
        }
        if node.parent_id.as_deref() != Some(parent.id.as_str()) {
            return Err(TreeShapeError::ParentMismatch {
                id: node.id.clone(),
                expected: parent.id.clone(),
                found: node.parent_id.clone(),
            });
        }
        if node.level != parent.level + 1 {
            return Err(TreeShapeError::LevelMismatch {
                id: node.id.clone(),
                expected: parent.level + 1,
                found: node.level,
            });
        }
        open.push(node);
    }

    Ok(())
}
