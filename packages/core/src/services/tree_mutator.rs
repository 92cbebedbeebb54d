//! Tree Mutator
//!
//! Low-level structural operations on the nested-set forest: issuing tree
//! ids, opening space, inserting laid-out batches, moving subtrees, and
//! rebuilding a tree from its parent links.
//!
//! The `pub(crate)` free functions in this module expect to run inside a
//! locked transaction provided by [`TreeLockManager`]; the methods on
//! [`TreeMutator`] take the locks themselves.
//!
//! # Moves
//!
//! A subtree of width `w = rght - lft + 1` is moved by relocating its range
//! and closing the gap it leaves:
//!
//! - **into a new tree**: relocate to `[1, w]` of a fresh tree id
//! - **across trees**: open `w` in the target tree, relocate, close the source gap
//! - **within a tree**: park the range at negative coordinates, close the gap,
//!   re-read the target, open `w`, unpark into place

use crate::db::{DomainEvent, TreeTransaction};
use crate::models::{
    check_tree, layout_preorder, rebuild_coordinates, Node, Placement, Position, TreeId,
};
use crate::services::tree_lock::{lock_set_covers, Verified};
use crate::services::{TreeContext, TreeLockManager, TreeServiceError};
use std::sync::Arc;
use tokio::sync::broadcast;

/// How `save_node` coordinates with structural writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Lock the node's tree for the duration of the save.
    Locked,
    /// The caller already serializes with structural writers.
    SkipLock,
}

/// Fetch a node or fail with `NodeNotFound`.
pub(crate) async fn load_node(
    tx: &mut dyn TreeTransaction,
    id: &str,
) -> Result<Node, TreeServiceError> {
    tx.get_node(id)
        .await?
        .ok_or_else(|| TreeServiceError::node_not_found(id))
}

/// Overwrite the structural columns of `nodes` with their stored values.
pub(crate) async fn refresh(
    tx: &mut dyn TreeTransaction,
    nodes: &mut [Node],
) -> Result<(), TreeServiceError> {
    let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let mut fresh = tx.refresh_coordinates(&ids).await?;
    for node in nodes.iter_mut() {
        let coords = fresh
            .remove(&node.id)
            .ok_or_else(|| TreeServiceError::node_not_found(node.id.clone()))?;
        node.set_coordinates(coords);
    }
    Ok(())
}

/// Shift every coordinate after `after` in `tree_id` right by `size`.
///
/// # Errors
///
/// `InvariantViolation` when `tree_id` is not a concrete tree (in particular
/// [`TreeId::ALL_TREES`]).
pub(crate) async fn create_space(
    tx: &mut dyn TreeTransaction,
    size: i64,
    after: i64,
    tree_id: TreeId,
) -> Result<u64, TreeServiceError> {
    if !tree_id.is_concrete() {
        return Err(TreeServiceError::invariant_violation(format!(
            "cannot create space in tree {}",
            tree_id
        )));
    }
    Ok(tx.shift_coordinates(tree_id, after, size).await?)
}

/// Lay out a pre-ordered batch relative to `target` and insert it.
///
/// `target` must have fresh coordinates. Without a target, or beside a root,
/// the batch becomes a new tree. Returns where the batch root landed.
pub(crate) async fn place_and_insert(
    tx: &mut dyn TreeTransaction,
    nodes: &mut [Node],
    target: Option<&Node>,
    position: Position,
) -> Result<Placement, TreeServiceError> {
    let existing = target.and_then(|t| Placement::relative_to(t, position));
    let fresh_tree = existing.is_none();
    let placement = match existing {
        Some(placement) => placement,
        None => Placement::new_tree(tx.issue_tree_id().await?),
    };

    let width = layout_preorder(nodes, &placement)
        .map_err(|e| TreeServiceError::invariant_violation(e.to_string()))?;
    if !fresh_tree {
        create_space(tx, width, placement.space_after(), placement.tree_id).await?;
    }
    tx.insert_nodes(nodes).await?;
    Ok(placement)
}

/// Move `node` (fresh coordinates) and its subtree relative to `target`.
pub(crate) async fn relocate_subtree(
    tx: &mut dyn TreeTransaction,
    node: &Node,
    target: Option<&Node>,
    position: Position,
) -> Result<(), TreeServiceError> {
    let Some(target) = target else {
        if node.is_root() {
            return Ok(());
        }
        return move_to_new_tree(tx, node).await;
    };

    if target.id == node.id {
        return Err(TreeServiceError::invalid_move(format!(
            "node {} cannot be moved relative to itself",
            node.id
        )));
    }
    if node.is_ancestor_of(target) {
        return Err(TreeServiceError::invalid_move(format!(
            "node {} cannot be moved into its own subtree",
            node.id
        )));
    }

    match Placement::relative_to(target, position) {
        None if node.is_root() => Ok(()),
        None => move_to_new_tree(tx, node).await,
        Some(placement) if placement.tree_id == node.tree_id => {
            move_within_tree(tx, node, &target.id, position).await
        }
        Some(placement) => move_across_trees(tx, node, &placement).await,
    }
}

async fn move_to_new_tree(
    tx: &mut dyn TreeTransaction,
    node: &Node,
) -> Result<(), TreeServiceError> {
    let width = node.span() + 1;
    let tree_id = tx.issue_tree_id().await?;
    tx.relocate_range(
        node.tree_id,
        node.lft,
        node.rght,
        tree_id,
        1 - node.lft,
        -node.level,
    )
    .await?;
    tx.shift_coordinates(node.tree_id, node.rght, -width).await?;
    tx.set_parent(&node.id, None).await?;
    tx.delete_prerequisites_for(&node.id).await?;
    Ok(())
}

async fn move_across_trees(
    tx: &mut dyn TreeTransaction,
    node: &Node,
    placement: &Placement,
) -> Result<(), TreeServiceError> {
    let width = node.span() + 1;
    create_space(tx, width, placement.space_after(), placement.tree_id).await?;
    tx.relocate_range(
        node.tree_id,
        node.lft,
        node.rght,
        placement.tree_id,
        placement.cursor - node.lft,
        placement.level - node.level,
    )
    .await?;
    tx.shift_coordinates(node.tree_id, node.rght, -width).await?;
    tx.set_parent(&node.id, placement.parent_id.as_deref()).await?;
    tx.delete_prerequisites_for(&node.id).await?;
    Ok(())
}

async fn move_within_tree(
    tx: &mut dyn TreeTransaction,
    node: &Node,
    target_id: &str,
    position: Position,
) -> Result<(), TreeServiceError> {
    let tree_id = node.tree_id;
    let width = node.span() + 1;

    // Parked range is [lft - rght - 1, -1]; no live node has lft < 1.
    let park_offset = -(node.rght + 1);
    let parked_lft = node.lft + park_offset;
    tx.relocate_range(tree_id, node.lft, node.rght, tree_id, park_offset, 0)
        .await?;
    tx.shift_coordinates(tree_id, node.rght, -width).await?;

    let target = load_node(tx, target_id).await?;
    let placement = Placement::relative_to(&target, position).ok_or_else(|| {
        TreeServiceError::invariant_violation(format!("target {} became a root", target_id))
    })?;

    create_space(tx, width, placement.space_after(), tree_id).await?;
    tx.relocate_range(
        tree_id,
        parked_lft,
        -1,
        tree_id,
        placement.cursor - parked_lft,
        placement.level - node.level,
    )
    .await?;
    tx.set_parent(&node.id, placement.parent_id.as_deref()).await?;
    Ok(())
}

/// Structural operations that take their own tree locks.
pub struct TreeMutator {
    locks: Arc<TreeLockManager>,
    events: broadcast::Sender<DomainEvent>,
}

impl TreeMutator {
    pub fn new(locks: Arc<TreeLockManager>, events: broadcast::Sender<DomainEvent>) -> Self {
        Self { locks, events }
    }

    /// Issue a fresh tree id.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` if the registry hands out a non-concrete id.
    pub async fn issue_tree_id(&self, ctx: &TreeContext) -> Result<TreeId, TreeServiceError> {
        let tree_id = self
            .locks
            .with_locks(ctx, &[], |tx| Box::pin(async move { Ok(tx.issue_tree_id().await?) }))
            .await?;
        if !tree_id.is_concrete() {
            return Err(TreeServiceError::invariant_violation(format!(
                "tree id registry issued {}",
                tree_id
            )));
        }
        Ok(tree_id)
    }

    /// Open `size` positions after `after` in `tree_id`, under that tree's lock.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` for [`TreeId::ALL_TREES`], raised before any lock
    /// is taken and never retried.
    pub async fn create_space(
        &self,
        ctx: &TreeContext,
        size: i64,
        after: i64,
        tree_id: TreeId,
    ) -> Result<u64, TreeServiceError> {
        if !tree_id.is_concrete() {
            return Err(TreeServiceError::invariant_violation(format!(
                "cannot create space in tree {}",
                tree_id
            )));
        }
        self.locks
            .with_locks(ctx, &[Some(tree_id)], move |tx| {
                Box::pin(async move { create_space(tx, size, after, tree_id).await })
            })
            .await
    }

    /// Insert a single unplaced node relative to `target_id` (or as a new tree).
    pub async fn insert_node(
        &self,
        ctx: &TreeContext,
        node: Node,
        target_id: Option<&str>,
        position: Position,
    ) -> Result<Node, TreeServiceError> {
        let target_tree = self.stored_tree_of(target_id).await?;
        let target_id = target_id.map(str::to_string);

        self.locks
            .with_current_locks(ctx, &[target_tree], move |tx, locked| {
                let mut batch = vec![node.clone()];
                let target_id = target_id.clone();
                Box::pin(async move {
                    let target = match &target_id {
                        Some(id) => Some(load_node(tx, id).await?),
                        None => None,
                    };
                    let found = [target.as_ref().map(|t| t.tree_id)];
                    if !lock_set_covers(&locked, &found) {
                        return Ok(Verified::Relock(found.to_vec()));
                    }
                    place_and_insert(tx, &mut batch, target.as_ref(), position).await?;
                    if let Some(target) = target.filter(|_| !position.is_sibling()) {
                        tx.mark_changed(&target.id).await?;
                    }
                    Ok(Verified::Done(batch.remove(0)))
                })
            })
            .await
    }

    /// Move `node` and its subtree relative to `target_id`.
    ///
    /// Coordinates of both ends are refreshed inside one lock acquisition
    /// covering both trees. The caller's payload edits on `node` are persisted
    /// in the same transaction without re-locking. A
    /// [`DomainEvent::NodeMoved`] is emitted once the locks are released.
    ///
    /// # Errors
    ///
    /// - `NodeNotFound` if either node is missing
    /// - `InvalidMove` for a target equal to or inside `node`'s subtree
    pub async fn move_node(
        &self,
        ctx: &TreeContext,
        node: &Node,
        target_id: Option<&str>,
        position: Position,
    ) -> Result<Node, TreeServiceError> {
        let node_tree = self.stored_tree_of(Some(&node.id)).await?;
        let target_tree = self.stored_tree_of(target_id).await?;
        let snapshot = node.clone();
        let owned_target = target_id.map(str::to_string);

        let moved = self
            .locks
            .with_current_locks(ctx, &[node_tree, target_tree], move |tx, locked| {
                let mut node = snapshot.clone();
                let target_id = owned_target.clone();
                Box::pin(async move {
                    refresh(tx, std::slice::from_mut(&mut node)).await?;
                    let target = match &target_id {
                        Some(id) => Some(load_node(tx, id).await?),
                        None => None,
                    };
                    // Either end may have changed tree since the lock set was read.
                    let found = [Some(node.tree_id), target.as_ref().map(|t| t.tree_id)];
                    if !lock_set_covers(&locked, &found) {
                        return Ok(Verified::Relock(found.to_vec()));
                    }
                    relocate_subtree(tx, &node, target.as_ref(), position).await?;
                    tx.save_node(&node).await?;
                    Ok(Verified::Done(load_node(tx, &node.id).await?))
                })
            })
            .await?;

        let _ = self.events.send(DomainEvent::NodeMoved {
            node: moved.clone(),
            target_id: target_id.map(str::to_string),
            position,
        });
        Ok(moved)
    }

    /// Persist the payload columns of `node`.
    pub async fn save_node(
        &self,
        ctx: &TreeContext,
        node: &Node,
        mode: SaveMode,
    ) -> Result<(), TreeServiceError> {
        let tree = match mode {
            SaveMode::Locked => Some(node.tree_id).filter(|t| t.is_concrete()),
            SaveMode::SkipLock => None,
        };
        let node = node.clone();
        self.locks
            .with_locks(ctx, &[tree], move |tx| {
                let node = node.clone();
                Box::pin(async move { Ok(tx.save_node(&node).await?) })
            })
            .await
    }

    /// Recompute `lft`/`rght`/`level` of `tree_id` from parent links.
    pub async fn rebuild_tree(
        &self,
        ctx: &TreeContext,
        tree_id: TreeId,
    ) -> Result<usize, TreeServiceError> {
        let rebuilt = self
            .locks
            .with_locks(ctx, &[Some(tree_id)], move |tx| {
                Box::pin(async move {
                    let mut nodes = tx.get_tree(tree_id).await?;
                    rebuild_coordinates(&mut nodes, tree_id)?;
                    let coordinates: Vec<_> = nodes
                        .iter()
                        .map(|n| (n.id.clone(), n.coordinates()))
                        .collect();
                    tx.update_coordinates(&coordinates).await?;
                    Ok(nodes.len())
                })
            })
            .await?;

        tracing::info!("Rebuilt tree {} ({} nodes)", tree_id, rebuilt);
        let _ = self.events.send(DomainEvent::TreeRebuilt { tree_id });
        Ok(rebuilt)
    }

    /// Check the stored coordinates of `tree_id`.
    pub async fn validate_tree(&self, tree_id: TreeId) -> Result<usize, TreeServiceError> {
        self.locks
            .read(move |tx| {
                Box::pin(async move {
                    let nodes = tx.get_tree(tree_id).await?;
                    check_tree(&nodes)?;
                    Ok(nodes.len())
                })
            })
            .await
    }

    /// Stored tree id of a node, read without locks.
    async fn stored_tree_of(&self, id: Option<&str>) -> Result<Option<TreeId>, TreeServiceError> {
        let Some(id) = id.map(str::to_string) else {
            return Ok(None);
        };
        let node = self
            .locks
            .read(move |tx| {
                let id = id.clone();
                Box::pin(async move { load_node(tx, &id).await })
            })
            .await?;
        Ok(Some(node.tree_id))
    }
}
