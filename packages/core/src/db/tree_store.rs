//! TreeStore Trait - Transactional Persistence Abstraction
//!
//! This module defines the persistence seam of the tree engine. Services never
//! talk to a database directly: they open a [`TreeTransaction`] through a
//! [`TreeStore`] and issue the handful of primitives the nested-set algorithms
//! need.
//!
//! # Implementations
//!
//! - [`TursoStore`](super::TursoStore) - libsql/Turso embedded database
//! - [`MemoryStore`](super::MemoryStore) - process-local store with per-tree
//!   async locks and fault injection, used by tests and tooling
//!
//! # Transactions
//!
//! A transaction must end with [`TreeTransaction::commit`] or
//! [`TreeTransaction::rollback`]. Tree locks taken through
//! [`TreeTransaction::lock_tree`] are held until then.
//!
//! # Examples
//!
//! ```rust,no_run
//! use channeltree_core::db::{MemoryStore, TransactionMode, TreeStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! let mut tx = store.begin(TransactionMode::Read).await?;
//! let node = tx.get_node("0123456789abcdef0123456789abcdef").await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

use crate::db::DatabaseError;
use crate::models::{
    AssessmentItem, Channel, ContentTag, FileRecord, NewAssessmentItem, NewContentTag, Node,
    NodeCoordinates, NodeTag, PrerequisiteLink, TreeId,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Intended use of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    Read,
    /// Takes the backend's write reservation up front.
    Write,
}

/// Factory for transactions against one backing store.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Open a new transaction.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Deadlock` when the backend could not reserve the
    /// write slot in time.
    async fn begin(&self, mode: TransactionMode) -> Result<Box<dyn TreeTransaction>, DatabaseError>;
}

/// One unit of work against the store.
///
/// Node listings are returned in ascending `lft` order unless stated
/// otherwise.
#[async_trait]
pub trait TreeTransaction: Send {
    //
    // LOCKING AND TREE IDS
    //

    /// Block until no other transaction can change the coordinate columns of
    /// `tree_id`. Held until commit or rollback; re-locking is a no-op.
    async fn lock_tree(&mut self, tree_id: TreeId) -> Result<(), DatabaseError>;

    /// Issue a tree id never handed out before. Ids are not reclaimed on
    /// rollback.
    async fn issue_tree_id(&mut self) -> Result<TreeId, DatabaseError>;

    /// All tree ids currently holding at least one node.
    async fn list_tree_ids(&mut self) -> Result<Vec<TreeId>, DatabaseError>;

    //
    // NODE READS
    //

    async fn get_node(&mut self, id: &str) -> Result<Option<Node>, DatabaseError>;

    /// Fetch several nodes; missing ids are skipped.
    async fn get_nodes(&mut self, ids: &[String]) -> Result<Vec<Node>, DatabaseError>;

    /// Direct children of `parent_id`.
    async fn get_children(&mut self, parent_id: &str) -> Result<Vec<Node>, DatabaseError>;

    /// Nodes of `tree_id` with `lft` in `[lft, rght]`, i.e. a subtree.
    async fn get_range(
        &mut self,
        tree_id: TreeId,
        lft: i64,
        rght: i64,
    ) -> Result<Vec<Node>, DatabaseError>;

    /// Every node of `tree_id`.
    async fn get_tree(&mut self, tree_id: TreeId) -> Result<Vec<Node>, DatabaseError>;

    /// Current structural columns of `ids`, keyed by id; missing ids are absent.
    async fn refresh_coordinates(
        &mut self,
        ids: &[String],
    ) -> Result<HashMap<String, NodeCoordinates>, DatabaseError>;

    //
    // NODE WRITES
    //

    /// Insert fully laid-out nodes.
    async fn insert_nodes(&mut self, nodes: &[Node]) -> Result<(), DatabaseError>;

    /// Persist the payload columns of `node`. Structural columns are left
    /// untouched.
    async fn save_node(&mut self, node: &Node) -> Result<(), DatabaseError>;

    /// Add `delta` to every `lft` and every `rght` greater than `after` in
    /// `tree_id`. Returns the number of rows touched.
    async fn shift_coordinates(
        &mut self,
        tree_id: TreeId,
        after: i64,
        delta: i64,
    ) -> Result<u64, DatabaseError>;

    /// Move every node of `tree_id` with `lft` in `[lft, rght]` to `new_tree_id`,
    /// adding `offset` to both bounds and `level_delta` to the level.
    async fn relocate_range(
        &mut self,
        tree_id: TreeId,
        lft: i64,
        rght: i64,
        new_tree_id: TreeId,
        offset: i64,
        level_delta: i64,
    ) -> Result<u64, DatabaseError>;

    async fn set_parent(&mut self, id: &str, parent_id: Option<&str>) -> Result<(), DatabaseError>;

    /// Overwrite the structural columns of each listed node.
    async fn update_coordinates(
        &mut self,
        coordinates: &[(String, NodeCoordinates)],
    ) -> Result<(), DatabaseError>;

    /// Flag a node as changed since the last publish.
    async fn mark_changed(&mut self, id: &str) -> Result<(), DatabaseError>;

    //
    // CHANNELS
    //

    async fn insert_channel(&mut self, channel: &Channel) -> Result<(), DatabaseError>;

    async fn get_channel(&mut self, id: &str) -> Result<Option<Channel>, DatabaseError>;

    /// Channel whose main tree is `tree_id`, if any.
    async fn channel_for_tree(&mut self, tree_id: TreeId)
        -> Result<Option<Channel>, DatabaseError>;

    //
    // DEPENDENT RECORDS
    //

    async fn files_for_nodes(&mut self, node_ids: &[String])
        -> Result<Vec<FileRecord>, DatabaseError>;

    async fn files_for_assessment_items(
        &mut self,
        item_ids: &[i64],
    ) -> Result<Vec<FileRecord>, DatabaseError>;

    async fn insert_files(&mut self, files: &[FileRecord]) -> Result<(), DatabaseError>;

    async fn assessment_items_for_nodes(
        &mut self,
        node_ids: &[String],
    ) -> Result<Vec<AssessmentItem>, DatabaseError>;

    /// Insert items and return them with their store-assigned ids, in input
    /// order.
    async fn insert_assessment_items(
        &mut self,
        items: &[NewAssessmentItem],
    ) -> Result<Vec<AssessmentItem>, DatabaseError>;

    async fn node_tags_for_nodes(&mut self, node_ids: &[String])
        -> Result<Vec<NodeTag>, DatabaseError>;

    async fn tags_by_ids(&mut self, ids: &[i64]) -> Result<Vec<ContentTag>, DatabaseError>;

    /// Tags with no channel whose name is in `names`.
    async fn shared_tags_by_names(
        &mut self,
        names: &[String],
    ) -> Result<Vec<ContentTag>, DatabaseError>;

    /// Insert tags and return them with their store-assigned ids, in input
    /// order.
    async fn insert_tags(&mut self, tags: &[NewContentTag]) -> Result<Vec<ContentTag>, DatabaseError>;

    async fn insert_node_tags(&mut self, links: &[NodeTag]) -> Result<(), DatabaseError>;

    async fn insert_prerequisite(&mut self, link: &PrerequisiteLink) -> Result<(), DatabaseError>;

    /// Links where `node_id` is either end.
    async fn prerequisites_for(
        &mut self,
        node_id: &str,
    ) -> Result<Vec<PrerequisiteLink>, DatabaseError>;

    /// Delete links where `node_id` is either end.
    async fn delete_prerequisites_for(&mut self, node_id: &str) -> Result<u64, DatabaseError>;

    //
    // LIFECYCLE
    //

    async fn commit(&mut self) -> Result<(), DatabaseError>;

    async fn rollback(&mut self) -> Result<(), DatabaseError>;
}
