//! MemoryStore - Process-local TreeStore
//!
//! An in-memory implementation of [`TreeStore`] with the same observable
//! locking semantics as the libsql backend:
//!
//! - one async mutex per tree id, held by the transaction that locked it until
//!   commit or rollback
//! - writes are visible immediately and undone from a journal on rollback
//! - tree ids come from a monotonic counter and are never reissued
//!
//! It also exposes a fault-injection queue so the deadlock retry policy can be
//! exercised deterministically, plus counters for lock acquisitions.
//!
//! # Examples
//!
//! ```rust
//! use channeltree_core::db::{InjectedFault, MemoryStore};
//!
//! let store = MemoryStore::new();
//! // The next lock request fails as a deadlock, the one after succeeds.
//! store.inject_lock_fault(InjectedFault::Deadlock);
//! ```

use crate::db::{DatabaseError, TransactionMode, TreeStore, TreeTransaction};
use crate::models::{
    AssessmentItem, Channel, ContentTag, FileRecord, NewAssessmentItem, NewContentTag, Node,
    NodeCoordinates, NodeTag, PrerequisiteLink, TreeId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Failure returned by the next `lock_tree` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// Surfaces as `DatabaseError::Deadlock`
    Deadlock,
    /// Surfaces as a non-retryable `DatabaseError::SqlExecutionError`
    Fatal,
}

#[derive(Default)]
struct Tables {
    nodes: BTreeMap<String, Node>,
    channels: BTreeMap<String, Channel>,
    files: BTreeMap<String, FileRecord>,
    assessment_items: BTreeMap<i64, AssessmentItem>,
    tags: BTreeMap<i64, ContentTag>,
    node_tags: Vec<NodeTag>,
    prerequisites: Vec<PrerequisiteLink>,
    last_item_id: i64,
    last_tag_id: i64,
}

enum Undo {
    Node { id: String, before: Option<Node> },
    Channel { id: String },
    File { id: String },
    AssessmentItem { id: i64 },
    Tag { id: i64 },
    NodeTag(NodeTag),
    PrerequisiteAdded(PrerequisiteLink),
    PrerequisiteRemoved(PrerequisiteLink),
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    tree_locks: Mutex<HashMap<TreeId, Arc<Mutex<()>>>>,
    faults: std::sync::Mutex<VecDeque<InjectedFault>>,
    last_tree_id: AtomicI64,
    lock_calls: AtomicU64,
    transactions: AtomicU64,
}

/// In-memory [`TreeStore`]. Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for an upcoming `lock_tree` call (FIFO).
    pub fn inject_lock_fault(&self, fault: InjectedFault) {
        self.shared
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(fault);
    }

    /// Number of `lock_tree` calls that reached the lock table, faults included.
    pub fn lock_calls(&self) -> u64 {
        self.shared.lock_calls.load(Ordering::SeqCst)
    }

    /// Number of transactions opened so far.
    pub fn transactions_started(&self) -> u64 {
        self.shared.transactions.load(Ordering::SeqCst)
    }

    pub async fn node_count(&self) -> usize {
        self.shared.tables.lock().await.nodes.len()
    }
}

#[async_trait]
impl TreeStore for MemoryStore {
    async fn begin(&self, mode: TransactionMode) -> Result<Box<dyn TreeTransaction>, DatabaseError> {
        self.shared.transactions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            mode,
            held: HashMap::new(),
            undo: Vec::new(),
            active: true,
        }))
    }
}

/// Transaction over a [`MemoryStore`]; dropping it un-committed rolls back.
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    mode: TransactionMode,
    held: HashMap<TreeId, OwnedMutexGuard<()>>,
    undo: Vec<Undo>,
    active: bool,
}

fn by_lft(mut nodes: Vec<Node>) -> Vec<Node> {
    nodes.sort_by(|a, b| (a.tree_id, a.lft).cmp(&(b.tree_id, b.lft)));
    nodes
}

/// Copy every non-structural column of `src` onto `dst`.
fn copy_payload(dst: &mut Node, src: &Node) {
    dst.node_id = src.node_id.clone();
    dst.kind = src.kind;
    dst.content_id = src.content_id.clone();
    dst.title = src.title.clone();
    dst.description = src.description.clone();
    dst.language_id = src.language_id.clone();
    dst.license_id = src.license_id.clone();
    dst.license_description = src.license_description.clone();
    dst.thumbnail_encoding = src.thumbnail_encoding.clone();
    dst.extra_fields = src.extra_fields.clone();
    dst.copyright_holder = src.copyright_holder.clone();
    dst.author = src.author.clone();
    dst.provider = src.provider.clone();
    dst.aggregator = src.aggregator.clone();
    dst.role_visibility = src.role_visibility.clone();
    dst.cloned_source_id = src.cloned_source_id.clone();
    dst.source_channel_id = src.source_channel_id.clone();
    dst.source_node_id = src.source_node_id.clone();
    dst.original_channel_id = src.original_channel_id.clone();
    dst.original_source_node_id = src.original_source_node_id.clone();
    dst.freeze_authoring_data = src.freeze_authoring_data;
    dst.changed = src.changed;
    dst.published = src.published;
    dst.modified_at = Utc::now();
}

fn apply_undo(tables: &mut Tables, undo: Vec<Undo>) {
    for entry in undo.into_iter().rev() {
        match entry {
            Undo::Node { id, before } => match before {
                Some(node) => {
                    tables.nodes.insert(id, node);
                }
                None => {
                    tables.nodes.remove(&id);
                }
            },
            Undo::Channel { id } => {
                tables.channels.remove(&id);
            }
            Undo::File { id } => {
                tables.files.remove(&id);
            }
            Undo::AssessmentItem { id } => {
                tables.assessment_items.remove(&id);
            }
            Undo::Tag { id } => {
                tables.tags.remove(&id);
            }
            Undo::NodeTag(link) => {
                if let Some(pos) = tables.node_tags.iter().rposition(|l| *l == link) {
                    tables.node_tags.remove(pos);
                }
            }
            Undo::PrerequisiteAdded(link) => {
                if let Some(pos) = tables.prerequisites.iter().rposition(|l| *l == link) {
                    tables.prerequisites.remove(pos);
                }
            }
            Undo::PrerequisiteRemoved(link) => tables.prerequisites.push(link),
        }
    }
}

impl MemoryTransaction {
    fn ensure_active(&self) -> Result<(), DatabaseError> {
        if self.active {
            Ok(())
        } else {
            Err(DatabaseError::TransactionClosed)
        }
    }

    fn ensure_writable(&self) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        if self.mode == TransactionMode::Read {
            return Err(DatabaseError::sql_execution(
                "attempt to write a readonly transaction",
            ));
        }
        Ok(())
    }

    /// Apply `change` to every node matching `filter`, journaling the old rows.
    async fn update_nodes<P, F>(&mut self, filter: P, mut change: F) -> u64
    where
        P: Fn(&Node) -> bool + Send,
        F: FnMut(&mut Node) + Send,
    {
        let mut tables = self.shared.tables.lock().await;
        let mut touched = 0;
        for node in tables.nodes.values_mut().filter(|n| filter(n)) {
            self.undo.push(Undo::Node {
                id: node.id.clone(),
                before: Some(node.clone()),
            });
            change(node);
            touched += 1;
        }
        touched
    }

    async fn update_one<F>(&mut self, id: &str, change: F) -> Result<(), DatabaseError>
    where
        F: FnOnce(&mut Node) + Send,
    {
        let mut tables = self.shared.tables.lock().await;
        let node = tables
            .nodes
            .get_mut(id)
            .ok_or_else(|| DatabaseError::sql_execution(format!("Node {} does not exist", id)))?;
        self.undo.push(Undo::Node {
            id: id.to_string(),
            before: Some(node.clone()),
        });
        change(node);
        Ok(())
    }

    fn release(&mut self) {
        self.active = false;
        self.held.clear();
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.active || self.undo.is_empty() {
            return;
        }
        self.active = false;
        let undo = std::mem::take(&mut self.undo);
        if let Ok(mut tables) = self.shared.tables.try_lock() {
            apply_undo(&mut tables, undo);
            return;
        }

        // Tree locks stay held until the undo lands.
        let shared = Arc::clone(&self.shared);
        let held = std::mem::take(&mut self.held);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Tables busy, rolling back dropped transaction in the background");
                handle.spawn(async move {
                    apply_undo(&mut *shared.tables.lock().await, undo);
                    drop(held);
                });
            }
            Err(_) => {
                apply_undo(&mut shared.tables.blocking_lock(), undo);
                drop(held);
            }
        }
    }
}

#[async_trait]
impl TreeTransaction for MemoryTransaction {
    async fn lock_tree(&mut self, tree_id: TreeId) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        if self.held.contains_key(&tree_id) {
            return Ok(());
        }
        self.shared.lock_calls.fetch_add(1, Ordering::SeqCst);

        let fault = self
            .shared
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match fault {
            Some(InjectedFault::Deadlock) => {
                return Err(DatabaseError::deadlock(format!(
                    "deadlock detected while locking tree {}",
                    tree_id
                )))
            }
            Some(InjectedFault::Fatal) => {
                return Err(DatabaseError::sql_execution(format!(
                    "failed to lock tree {}",
                    tree_id
                )))
            }
            None => {}
        }

        let lock = {
            let mut locks = self.shared.tree_locks.lock().await;
            Arc::clone(locks.entry(tree_id).or_default())
        };
        let guard = lock.lock_owned().await;
        self.held.insert(tree_id, guard);
        Ok(())
    }

    async fn issue_tree_id(&mut self) -> Result<TreeId, DatabaseError> {
        self.ensure_writable()?;
        let id = self.shared.last_tree_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TreeId(id))
    }

    async fn list_tree_ids(&mut self) -> Result<Vec<TreeId>, DatabaseError> {
        self.ensure_active()?;
        let tables = self.shared.tables.lock().await;
        let ids: BTreeSet<TreeId> = tables.nodes.values().map(|n| n.tree_id).collect();
        Ok(ids.into_iter().collect())
    }

    async fn get_node(&mut self, id: &str) -> Result<Option<Node>, DatabaseError> {
        self.ensure_active()?;
        Ok(self.shared.tables.lock().await.nodes.get(id).cloned())
    }

    async fn get_nodes(&mut self, ids: &[String]) -> Result<Vec<Node>, DatabaseError> {
        self.ensure_active()?;
        let tables = self.shared.tables.lock().await;
        Ok(by_lft(
            ids.iter()
                .filter_map(|id| tables.nodes.get(id).cloned())
                .collect(),
        ))
    }

    async fn get_children(&mut self, parent_id: &str) -> Result<Vec<Node>, DatabaseError> {
        self.ensure_active()?;
        let tables = self.shared.tables.lock().await;
        Ok(by_lft(
            tables
                .nodes
                .values()
                .filter(|n| n.parent_id.as_deref() == Some(parent_id))
                .cloned()
                .collect(),
        ))
    }

    async fn get_range(
        &mut self,
        tree_id: TreeId,
        lft: i64,
        rght: i64,
    ) -> Result<Vec<Node>, DatabaseError> {
        self.ensure_active()?;
        let tables = self.shared.tables.lock().await;
        Ok(by_lft(
            tables
                .nodes
                .values()
                .filter(|n| n.tree_id == tree_id && n.lft >= lft && n.lft <= rght)
                .cloned()
                .collect(),
        ))
    }

    async fn get_tree(&mut self, tree_id: TreeId) -> Result<Vec<Node>, DatabaseError> {
        self.ensure_active()?;
        let tables = self.shared.tables.lock().await;
        Ok(by_lft(
            tables
                .nodes
                .values()
                .filter(|n| n.tree_id == tree_id)
                .cloned()
                .collect(),
        ))
    }

    async fn refresh_coordinates(
        &mut self,
        ids: &[String],
    ) -> Result<HashMap<String, NodeCoordinates>, DatabaseError> {
        self.ensure_active()?;
        let tables = self.shared.tables.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.nodes.get(id).map(|n| (id.clone(), n.coordinates())))
            .collect())
    }

    async fn insert_nodes(&mut self, nodes: &[Node]) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let mut tables = self.shared.tables.lock().await;
        if let Some(dup) = nodes.iter().find(|n| tables.nodes.contains_key(&n.id)) {
            return Err(DatabaseError::sql_execution(format!(
                "UNIQUE constraint failed: content_nodes.id ({})",
                dup.id
            )));
        }
        for node in nodes {
            tables.nodes.insert(node.id.clone(), node.clone());
            self.undo.push(Undo::Node {
                id: node.id.clone(),
                before: None,
            });
        }
        Ok(())
    }

    async fn save_node(&mut self, node: &Node) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        self.update_one(&node.id, |stored| copy_payload(stored, node))
            .await
    }

    async fn shift_coordinates(
        &mut self,
        tree_id: TreeId,
        after: i64,
        delta: i64,
    ) -> Result<u64, DatabaseError> {
        self.ensure_writable()?;
        Ok(self
            .update_nodes(
                move |n| n.tree_id == tree_id && (n.lft > after || n.rght > after),
                move |n| {
                    if n.lft > after {
                        n.lft += delta;
                    }
                    if n.rght > after {
                        n.rght += delta;
                    }
                },
            )
            .await)
    }

    async fn relocate_range(
        &mut self,
        tree_id: TreeId,
        lft: i64,
        rght: i64,
        new_tree_id: TreeId,
        offset: i64,
        level_delta: i64,
    ) -> Result<u64, DatabaseError> {
        self.ensure_writable()?;
        Ok(self
            .update_nodes(
                move |n| n.tree_id == tree_id && n.lft >= lft && n.lft <= rght,
                move |n| {
                    n.tree_id = new_tree_id;
                    n.lft += offset;
                    n.rght += offset;
                    n.level += level_delta;
                },
            )
            .await)
    }

    async fn set_parent(&mut self, id: &str, parent_id: Option<&str>) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let parent_id = parent_id.map(str::to_string);
        self.update_one(id, move |n| n.parent_id = parent_id).await
    }

    async fn update_coordinates(
        &mut self,
        coordinates: &[(String, NodeCoordinates)],
    ) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        for (id, coords) in coordinates {
            let coords = coords.clone();
            self.update_one(id, move |n| n.set_coordinates(coords))
                .await?;
        }
        Ok(())
    }

    async fn mark_changed(&mut self, id: &str) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        self.update_one(id, |n| {
            n.changed = true;
            n.modified_at = Utc::now();
        })
        .await
    }

    async fn insert_channel(&mut self, channel: &Channel) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let mut tables = self.shared.tables.lock().await;
        if tables.channels.contains_key(&channel.id) {
            return Err(DatabaseError::sql_execution(format!(
                "UNIQUE constraint failed: channels.id ({})",
                channel.id
            )));
        }
        tables.channels.insert(channel.id.clone(), channel.clone());
        self.undo.push(Undo::Channel {
            id: channel.id.clone(),
        });
        Ok(())
    }

    async fn get_channel(&mut self, id: &str) -> Result<Option<Channel>, DatabaseError> {
        self.ensure_active()?;
        Ok(self.shared.tables.lock().await.channels.get(id).cloned())
    }

    async fn channel_for_tree(
        &mut self,
        tree_id: TreeId,
    ) -> Result<Option<Channel>, DatabaseError> {
        self.ensure_active()?;
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .channels
            .values()
            .find(|c| c.tree_id == tree_id)
            .cloned())
    }

    async fn files_for_nodes(
        &mut self,
        node_ids: &[String],
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        self.ensure_active()?;
        let wanted: HashSet<&str> = node_ids.iter().map(String::as_str).collect();
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .files
            .values()
            .filter(|f| {
                f.contentnode_id
                    .as_deref()
                    .is_some_and(|id| wanted.contains(id))
            })
            .cloned()
            .collect())
    }

    async fn files_for_assessment_items(
        &mut self,
        item_ids: &[i64],
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        self.ensure_active()?;
        let wanted: HashSet<i64> = item_ids.iter().copied().collect();
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .files
            .values()
            .filter(|f| f.assessment_item_id.is_some_and(|id| wanted.contains(&id)))
            .cloned()
            .collect())
    }

    async fn insert_files(&mut self, files: &[FileRecord]) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let mut tables = self.shared.tables.lock().await;
        if let Some(dup) = files.iter().find(|f| tables.files.contains_key(&f.id)) {
            return Err(DatabaseError::sql_execution(format!(
                "UNIQUE constraint failed: files.id ({})",
                dup.id
            )));
        }
        for file in files {
            tables.files.insert(file.id.clone(), file.clone());
            self.undo.push(Undo::File {
                id: file.id.clone(),
            });
        }
        Ok(())
    }

    async fn assessment_items_for_nodes(
        &mut self,
        node_ids: &[String],
    ) -> Result<Vec<AssessmentItem>, DatabaseError> {
        self.ensure_active()?;
        let wanted: HashSet<&str> = node_ids.iter().map(String::as_str).collect();
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .assessment_items
            .values()
            .filter(|item| wanted.contains(item.contentnode_id.as_str()))
            .cloned()
            .collect())
    }

    async fn insert_assessment_items(
        &mut self,
        items: &[NewAssessmentItem],
    ) -> Result<Vec<AssessmentItem>, DatabaseError> {
        self.ensure_writable()?;
        let mut tables = self.shared.tables.lock().await;
        let mut inserted = Vec::with_capacity(items.len());
        for item in items {
            tables.last_item_id += 1;
            let stored = AssessmentItem {
                id: tables.last_item_id,
                contentnode_id: item.contentnode_id.clone(),
                assessment_id: item.assessment_id.clone(),
                item_type: item.item_type.clone(),
                question: item.question.clone(),
                answers: item.answers.clone(),
                hints: item.hints.clone(),
                order: item.order,
                raw_data: item.raw_data.clone(),
            };
            tables.assessment_items.insert(stored.id, stored.clone());
            self.undo.push(Undo::AssessmentItem { id: stored.id });
            inserted.push(stored);
        }
        Ok(inserted)
    }

    async fn node_tags_for_nodes(
        &mut self,
        node_ids: &[String],
    ) -> Result<Vec<NodeTag>, DatabaseError> {
        self.ensure_active()?;
        let wanted: HashSet<&str> = node_ids.iter().map(String::as_str).collect();
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .node_tags
            .iter()
            .filter(|l| wanted.contains(l.node_id.as_str()))
            .cloned()
            .collect())
    }

    async fn tags_by_ids(&mut self, ids: &[i64]) -> Result<Vec<ContentTag>, DatabaseError> {
        self.ensure_active()?;
        let tables = self.shared.tables.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.tags.get(id).cloned())
            .collect())
    }

    async fn shared_tags_by_names(
        &mut self,
        names: &[String],
    ) -> Result<Vec<ContentTag>, DatabaseError> {
        self.ensure_active()?;
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .tags
            .values()
            .filter(|t| t.channel_id.is_none() && wanted.contains(t.tag_name.as_str()))
            .cloned()
            .collect())
    }

    async fn insert_tags(
        &mut self,
        tags: &[NewContentTag],
    ) -> Result<Vec<ContentTag>, DatabaseError> {
        self.ensure_writable()?;
        let mut tables = self.shared.tables.lock().await;
        let mut inserted = Vec::with_capacity(tags.len());
        for tag in tags {
            tables.last_tag_id += 1;
            let stored = ContentTag {
                id: tables.last_tag_id,
                tag_name: tag.tag_name.clone(),
                channel_id: tag.channel_id.clone(),
            };
            tables.tags.insert(stored.id, stored.clone());
            self.undo.push(Undo::Tag { id: stored.id });
            inserted.push(stored);
        }
        Ok(inserted)
    }

    async fn insert_node_tags(&mut self, links: &[NodeTag]) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let mut tables = self.shared.tables.lock().await;
        for link in links {
            tables.node_tags.push(link.clone());
            self.undo.push(Undo::NodeTag(link.clone()));
        }
        Ok(())
    }

    async fn insert_prerequisite(&mut self, link: &PrerequisiteLink) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        let mut tables = self.shared.tables.lock().await;
        tables.prerequisites.push(link.clone());
        self.undo.push(Undo::PrerequisiteAdded(link.clone()));
        Ok(())
    }

    async fn prerequisites_for(
        &mut self,
        node_id: &str,
    ) -> Result<Vec<PrerequisiteLink>, DatabaseError> {
        self.ensure_active()?;
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .prerequisites
            .iter()
            .filter(|l| l.involves(node_id))
            .cloned()
            .collect())
    }

    async fn delete_prerequisites_for(&mut self, node_id: &str) -> Result<u64, DatabaseError> {
        self.ensure_writable()?;
        let mut tables = self.shared.tables.lock().await;
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut tables.prerequisites)
            .into_iter()
            .partition(|l| l.involves(node_id));
        tables.prerequisites = kept;
        let count = removed.len() as u64;
        self.undo
            .extend(removed.into_iter().map(Undo::PrerequisiteRemoved));
        Ok(count)
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        self.undo.clear();
        self.release();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        let undo = std::mem::take(&mut self.undo);
        {
            let mut tables = self.shared.tables.lock().await;
            apply_undo(&mut tables, undo);
        }
        self.release();
        Ok(())
    }
}
