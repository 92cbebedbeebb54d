//! Tree Service - Entry Point for Tree Operations
//!
//! This module ties the lock manager, mutator, copy orchestrator and
//! dependent-record copier together behind one cloneable handle:
//!
//! - Channel and node creation
//! - Subtree copy (`copy_subtree`) and move (`move_node`)
//! - Payload saves, resync with a node's source
//! - Maintenance: `rebuild_tree`, `validate_tree`
//!
//! Domain events are broadcast after the affected transaction commits.
//! Subscribers that lag or disconnect never affect the operation.

use crate::config::TreeEngineConfig;
use crate::db::{DomainEvent, TreeStore};
use crate::models::{new_hex_id, Channel, ContentKind, Node, Position, TreeId};
use crate::services::cloner::sync_from_source;
use crate::services::copy_service::{CopyOrchestrator, CopyOutcome, CopyRequest};
use crate::services::tree_mutator::{load_node, place_and_insert, SaveMode, TreeMutator};
use crate::services::{
    NoopProgress, ProgressReporter, TreeContext, TreeLockManager, TreeServiceError,
};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Broadcast channel capacity for domain events
const DOMAIN_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Facade over the tree engine.
///
/// # Examples
///
/// ```no_run
/// # use channeltree_core::config::TreeEngineConfig;
/// # use channeltree_core::db::MemoryStore;
/// # use channeltree_core::models::Position;
/// # use channeltree_core::services::{CopyRequest, TreeContext, TreeService};
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let service = TreeService::new(Arc::new(MemoryStore::new()), TreeEngineConfig::default());
/// let ctx = TreeContext::new();
///
/// let channel = service.create_channel(&ctx, "Physics").await?;
/// let copies = service
///     .copy_subtree(&ctx, CopyRequest::new(&channel.root_node_id))
///     .await?;
/// println!("Copied {} node(s)", copies.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TreeService {
    store: Arc<dyn TreeStore>,
    locks: Arc<TreeLockManager>,
    mutator: Arc<TreeMutator>,
    copier: Arc<CopyOrchestrator>,
    progress: Arc<dyn ProgressReporter>,
    config: TreeEngineConfig,
    event_tx: broadcast::Sender<DomainEvent>,
}

impl TreeService {
    pub fn new(store: Arc<dyn TreeStore>, config: TreeEngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(DOMAIN_EVENT_CHANNEL_CAPACITY);
        let locks = Arc::new(TreeLockManager::new(Arc::clone(&store)));
        Self {
            mutator: Arc::new(TreeMutator::new(Arc::clone(&locks), event_tx.clone())),
            copier: Arc::new(CopyOrchestrator::new(
                Arc::clone(&locks),
                event_tx.clone(),
                config.batch_size,
            )),
            progress: Arc::new(NoopProgress),
            store,
            locks,
            config,
            event_tx,
        }
    }

    /// Returns a clone of this service reporting copy progress to `progress`.
    pub fn with_progress(&self, progress: Arc<dyn ProgressReporter>) -> Self {
        let mut cloned = self.clone();
        cloned.progress = progress;
        cloned
    }

    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.store
    }

    pub fn lock_manager(&self) -> &Arc<TreeLockManager> {
        &self.locks
    }

    pub fn config(&self) -> &TreeEngineConfig {
        &self.config
    }

    /// Subscribe to domain events (moves, copies, rebuilds).
    pub fn subscribe_to_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.event_tx.subscribe()
    }

    /// Create a channel whose main tree is a fresh root topic.
    pub async fn create_channel(
        &self,
        ctx: &TreeContext,
        name: &str,
    ) -> Result<Channel, TreeServiceError> {
        let name = name.to_string();
        let channel = self
            .locks
            .with_locks(ctx, &[], move |tx| {
                let name = name.clone();
                Box::pin(async move {
                    let mut root = vec![Node::new(ContentKind::Topic, name.clone())];
                    let placement =
                        place_and_insert(tx, &mut root, None, Position::LastChild).await?;
                    let channel = Channel {
                        id: new_hex_id(),
                        name,
                        root_node_id: root[0].id.clone(),
                        tree_id: placement.tree_id,
                    };
                    tx.insert_channel(&channel).await?;
                    Ok(channel)
                })
            })
            .await?;

        tracing::info!("Created channel {} with tree {}", channel.id, channel.tree_id);
        Ok(channel)
    }

    pub async fn get_channel(&self, id: &str) -> Result<Channel, TreeServiceError> {
        let id = id.to_string();
        self.locks
            .read(move |tx| {
                let id = id.clone();
                Box::pin(async move {
                    tx.get_channel(&id)
                        .await?
                        .ok_or_else(|| TreeServiceError::channel_not_found(id))
                })
            })
            .await
    }

    /// Insert `node` relative to `target_id`, or as a new tree.
    pub async fn create_node(
        &self,
        ctx: &TreeContext,
        node: Node,
        target_id: Option<&str>,
        position: Position,
    ) -> Result<Node, TreeServiceError> {
        self.mutator.insert_node(ctx, node, target_id, position).await
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>, TreeServiceError> {
        let id = id.to_string();
        self.locks
            .read(move |tx| {
                let id = id.clone();
                Box::pin(async move { Ok(tx.get_node(&id).await?) })
            })
            .await
    }

    /// Subtree of `id` in pre-order, optionally without `id` itself.
    pub async fn get_descendants(
        &self,
        id: &str,
        include_self: bool,
    ) -> Result<Vec<Node>, TreeServiceError> {
        let id = id.to_string();
        self.locks
            .read(move |tx| {
                let id = id.clone();
                Box::pin(async move {
                    let node = load_node(tx, &id).await?;
                    let mut nodes = tx.get_range(node.tree_id, node.lft, node.rght).await?;
                    if !include_self {
                        nodes.retain(|n| n.id != node.id);
                    }
                    Ok(nodes)
                })
            })
            .await
    }

    /// Copy a subtree. Returns the nodes created by the first copy unit.
    pub async fn copy_subtree(
        &self,
        ctx: &TreeContext,
        request: CopyRequest,
    ) -> Result<Vec<Node>, TreeServiceError> {
        Ok(self.copy_with_outcome(ctx, request).await?.nodes)
    }

    /// Copy a subtree and report how it was split into units.
    pub async fn copy_with_outcome(
        &self,
        ctx: &TreeContext,
        request: CopyRequest,
    ) -> Result<CopyOutcome, TreeServiceError> {
        self.copier.copy(ctx, request, self.progress.as_ref()).await
    }

    /// Move `node` relative to `target_id`; `None` makes it a new tree.
    pub async fn move_node(
        &self,
        ctx: &TreeContext,
        node: &Node,
        target_id: Option<&str>,
        position: Position,
    ) -> Result<Node, TreeServiceError> {
        self.mutator.move_node(ctx, node, target_id, position).await
    }

    pub async fn save_node(
        &self,
        ctx: &TreeContext,
        node: &Node,
        mode: SaveMode,
    ) -> Result<(), TreeServiceError> {
        self.mutator.save_node(ctx, node, mode).await
    }

    /// Pull the content attributes of a node's source back onto it.
    ///
    /// # Errors
    ///
    /// - `NodeNotFound` if the node or its source is gone
    /// - `InvariantViolation` if the node was never copied
    pub async fn sync_with_source(
        &self,
        ctx: &TreeContext,
        node_id: &str,
    ) -> Result<Node, TreeServiceError> {
        let node_id = node_id.to_string();
        self.locks
            .with_locks(ctx, &[], move |tx| {
                let node_id = node_id.clone();
                Box::pin(async move {
                    let mut node = load_node(tx, &node_id).await?;
                    let source_id = node.cloned_source_id.clone().ok_or_else(|| {
                        TreeServiceError::invariant_violation(format!(
                            "node {} has no source to sync with",
                            node_id
                        ))
                    })?;
                    let source = load_node(tx, &source_id).await?;
                    sync_from_source(&mut node, &source);
                    tx.save_node(&node).await?;
                    Ok(node)
                })
            })
            .await
    }

    pub async fn issue_tree_id(&self, ctx: &TreeContext) -> Result<TreeId, TreeServiceError> {
        self.mutator.issue_tree_id(ctx).await
    }

    pub async fn list_tree_ids(&self) -> Result<Vec<TreeId>, TreeServiceError> {
        self.locks
            .read(|tx| Box::pin(async move { Ok(tx.list_tree_ids().await?) }))
            .await
    }

    pub async fn rebuild_tree(
        &self,
        ctx: &TreeContext,
        tree_id: TreeId,
    ) -> Result<usize, TreeServiceError> {
        self.mutator.rebuild_tree(ctx, tree_id).await
    }

    pub async fn validate_tree(&self, tree_id: TreeId) -> Result<usize, TreeServiceError> {
        self.mutator.validate_tree(tree_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::services::ProgressTracker;

    fn service() -> TreeService {
        TreeService::new(Arc::new(MemoryStore::new()), TreeEngineConfig::default())
    }

    #[tokio::test]
    async fn test_create_channel_owns_a_new_tree() {
        let service = service();
        let ctx = TreeContext::new();

        let first = service.create_channel(&ctx, "Physics").await.unwrap();
        let second = service.create_channel(&ctx, "Chemistry").await.unwrap();

        assert_ne!(first.tree_id, second.tree_id);
        let root = service.get_node(&first.root_node_id).await.unwrap().unwrap();
        assert_eq!(root.title, "Physics");
        assert_eq!((root.lft, root.rght, root.level), (1, 2, 0));
        assert_eq!(service.get_channel(&first.id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_copy_records_source_channel_and_progress() {
        let tracker = ProgressTracker::new();
        let service = service().with_progress(Arc::new(tracker.clone()));
        let ctx = TreeContext::new();
        let channel = service.create_channel(&ctx, "Source").await.unwrap();
        service
            .create_node(
                &ctx,
                Node::new(ContentKind::Video, "Lesson"),
                Some(&channel.root_node_id),
                Position::LastChild,
            )
            .await
            .unwrap();

        let copies = service
            .copy_subtree(&ctx, CopyRequest::new(&channel.root_node_id))
            .await
            .unwrap();

        assert_eq!(copies.len(), 2);
        assert!(copies
            .iter()
            .all(|n| n.source_channel_id.as_deref() == Some(channel.id.as_str())));
        assert_eq!(tracker.snapshot().total, 2);
        assert_eq!(tracker.snapshot().done, 2);
        assert_eq!(service.validate_tree(copies[0].tree_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sync_with_source_pulls_content() {
        let service = service();
        let ctx = TreeContext::new();
        let channel = service.create_channel(&ctx, "Source").await.unwrap();
        let copy = service
            .copy_subtree(&ctx, CopyRequest::new(&channel.root_node_id))
            .await
            .unwrap()
            .remove(0);

        let mut source = service.get_node(&channel.root_node_id).await.unwrap().unwrap();
        source.title = "Renamed at source".into();
        service.save_node(&ctx, &source, SaveMode::Locked).await.unwrap();

        let synced = service.sync_with_source(&ctx, &copy.id).await.unwrap();
        assert_eq!(synced.title, "Renamed at source");
        assert_eq!(
            service.get_node(&copy.id).await.unwrap().unwrap().title,
            "Renamed at source"
        );

        let err = service
            .sync_with_source(&ctx, &channel.root_node_id)
            .await
            .unwrap_err();
        assert!(matches!(err, TreeServiceError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_descendants_exclude_self_on_request() {
        let service = service();
        let ctx = TreeContext::new();
        let channel = service.create_channel(&ctx, "C").await.unwrap();
        for title in ["one", "two"] {
            service
                .create_node(
                    &ctx,
                    Node::new(ContentKind::Document, title),
                    Some(&channel.root_node_id),
                    Position::LastChild,
                )
                .await
                .unwrap();
        }

        let all = service.get_descendants(&channel.root_node_id, true).await.unwrap();
        let below = service.get_descendants(&channel.root_node_id, false).await.unwrap();
        assert_eq!(all.len(), 3);
        let titles: Vec<_> = below.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["one", "two"]);
        assert_eq!(service.list_tree_ids().await.unwrap(), vec![channel.tree_id]);
    }
}
