//! Copy Orchestrator
//!
//! Duplicates a subtree at a new location. Each unit of work is one of:
//!
//! - **Deep copy**: the whole remaining subtree is cloned outside the lock,
//!   laid out, and bulk-inserted under a single lock on the target tree.
//! - **Shallow copy**: only the unit's root is inserted; each of its source
//!   children becomes a new unit targeting the copy with `last-child`.
//!
//! A unit goes deep when its source span (`rght - lft`) is below the batch
//! size. Units are processed from an explicit stack, so deep source trees do
//! not grow the call stack, and no lock is held longer than one unit.
//!
//! Dependent records are copied after each unit, outside its lock. A failure
//! leaves earlier units in place.

use crate::db::{DomainEvent, TreeTransaction};
use crate::models::{Node, NodePatch, Position, TreeId};
use crate::services::cloner::{clone_node, clone_tree, CloneOptions};
use crate::services::dependents::{DependentRecordCopier, NodeSelection};
use crate::services::tree_lock::{lock_set_covers, Verified};
use crate::services::tree_mutator::{load_node, place_and_insert};
use crate::services::{ProgressReporter, TreeContext, TreeLockManager, TreeServiceError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Span below which a unit is copied in one transaction.
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Parameters of one copy.
///
/// # Examples
///
/// ```rust
/// use channeltree_core::models::{NodePatch, Position};
/// use channeltree_core::services::CopyRequest;
///
/// let request = CopyRequest::new("0123456789abcdef0123456789abcdef")
///     .to("fedcba9876543210fedcba9876543210", Position::FirstChild)
///     .with_overrides(NodePatch::new().with_title("Copy"))
///     .excluding(["00000000000000000000000000000001".to_string()])
///     .with_batch_size(10);
/// assert_eq!(request.position, Position::FirstChild);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CopyRequest {
    pub source_id: String,
    /// `None` copies into a new tree.
    pub target_id: Option<String>,
    pub position: Position,
    /// Primary key for the copy of the source node.
    pub explicit_id: Option<String>,
    /// Applied to the copy of the source node only.
    pub overrides: Option<NodePatch>,
    /// Primary ids of descendants to leave out, with their subtrees.
    ///
    /// Matched against [`Node::id`], never the content `node_id` shared by
    /// copies of the same content.
    pub excluded: HashSet<String>,
    pub can_edit_source_channel: bool,
    /// Falls back to the engine's configured batch size.
    pub batch_size: Option<i64>,
}

impl CopyRequest {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    pub fn to(mut self, target_id: impl Into<String>, position: Position) -> Self {
        self.target_id = Some(target_id.into());
        self.position = position;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.explicit_id = Some(id.into());
        self
    }

    pub fn with_overrides(mut self, overrides: NodePatch) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.excluded.extend(ids);
        self
    }

    pub fn can_edit_source_channel(mut self, can_edit: bool) -> Self {
        self.can_edit_source_channel = can_edit;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// How a single unit is copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    Deep,
    Shallow,
}

impl CopyStrategy {
    pub fn for_span(span: i64, batch_size: i64) -> Self {
        if span < batch_size {
            Self::Deep
        } else {
            Self::Shallow
        }
    }
}

/// Outcome of a copy.
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    /// Nodes produced by the first unit: the whole copy for a deep copy, the
    /// copied root alone otherwise.
    pub nodes: Vec<Node>,
    /// Total nodes materialized across all units.
    pub copied: u64,
    /// Units processed (each is one locked section).
    pub units: u64,
}

struct CopyUnit {
    source_id: String,
    target_id: Option<String>,
    position: Position,
    explicit_id: Option<String>,
    overrides: Option<NodePatch>,
}

/// Drives deep and shallow copy units.
pub struct CopyOrchestrator {
    locks: Arc<TreeLockManager>,
    dependents: DependentRecordCopier,
    events: broadcast::Sender<DomainEvent>,
    batch_size: i64,
}

impl CopyOrchestrator {
    pub fn new(
        locks: Arc<TreeLockManager>,
        events: broadcast::Sender<DomainEvent>,
        batch_size: i64,
    ) -> Self {
        Self {
            dependents: DependentRecordCopier::new(Arc::clone(&locks)),
            locks,
            events,
            batch_size,
        }
    }

    /// Copy `request.source_id` and its subtree.
    ///
    /// The expected node count is published to `progress` once before any
    /// write; every unit then reports the nodes it inserted.
    ///
    /// # Errors
    ///
    /// - `NodeNotFound` if the source or target does not exist
    /// - `InvariantViolation` for a non-positive batch size
    /// - any store or dependent-copy failure, after earlier units committed
    pub async fn copy(
        &self,
        ctx: &TreeContext,
        request: CopyRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<CopyOutcome, TreeServiceError> {
        let batch_size = request.batch_size.unwrap_or(self.batch_size);
        if batch_size < 1 {
            return Err(TreeServiceError::invariant_violation(format!(
                "batch size must be positive, got {}",
                batch_size
            )));
        }

        let (total, source_channel_id) = self.size_up(&request).await?;
        progress.set_total(total);

        let options = CloneOptions {
            source_channel_id,
            can_edit_source_channel: request.can_edit_source_channel,
        };
        let mut excluded = request.excluded.clone();
        let mut stack = vec![CopyUnit {
            source_id: request.source_id.clone(),
            target_id: request.target_id.clone(),
            position: request.position,
            explicit_id: request.explicit_id.clone(),
            overrides: request.overrides.clone(),
        }];

        let mut first: Option<Vec<Node>> = None;
        let mut copied = 0u64;
        let mut units = 0u64;

        while let Some(unit) = stack.pop() {
            let (source, target_tree) = self.load_unit(&unit).await?;
            let strategy = CopyStrategy::for_span(source.span(), batch_size);
            tracing::debug!(
                "Copying {} (span {}) as {:?} unit",
                source.id,
                source.span(),
                strategy
            );

            let nodes = match strategy {
                CopyStrategy::Deep => {
                    self.deep_copy(ctx, &unit, &source, target_tree, &options, &excluded)
                        .await?
                }
                CopyStrategy::Shallow => {
                    let (copy, children) = self
                        .shallow_copy(ctx, &unit, &source, target_tree, &options, &excluded)
                        .await?;
                    for child in children.into_iter().rev() {
                        stack.push(CopyUnit {
                            source_id: child,
                            target_id: Some(copy.id.clone()),
                            position: Position::LastChild,
                            explicit_id: None,
                            overrides: None,
                        });
                    }
                    vec![copy]
                }
            };

            excluded.extend(nodes.iter().map(|n| n.id.clone()));
            copied += nodes.len() as u64;
            units += 1;
            progress.increment(nodes.len() as u64);
            if first.is_none() {
                first = Some(nodes);
            }
        }

        let nodes = first.unwrap_or_default();
        if let Some(root) = nodes.first() {
            let _ = self.events.send(DomainEvent::SubtreeCopied {
                source_id: request.source_id.clone(),
                root_id: root.id.clone(),
                node_count: copied,
            });
        }
        tracing::info!(
            "Copied {} nodes from {} in {} unit(s)",
            copied,
            request.source_id,
            units
        );

        Ok(CopyOutcome {
            nodes,
            copied,
            units,
        })
    }

    /// Expected node count and the source's channel.
    async fn size_up(
        &self,
        request: &CopyRequest,
    ) -> Result<(u64, Option<String>), TreeServiceError> {
        let source_id = request.source_id.clone();
        let excluded = request.excluded.clone();
        let target_id = request.target_id.clone();

        self.locks
            .read(move |tx| {
                let source_id = source_id.clone();
                let excluded = excluded.clone();
                let target_id = target_id.clone();
                Box::pin(async move {
                    if let Some(target_id) = &target_id {
                        load_node(tx, target_id).await?;
                    }
                    let source = load_node(tx, &source_id).await?;
                    let total = count_nodes_to_copy(tx, &source, &excluded).await?;
                    let channel = tx.channel_for_tree(source.tree_id).await?;
                    Ok((total, channel.map(|c| c.id)))
                })
            })
            .await
    }

    /// Fresh source and the target's current tree.
    async fn load_unit(&self, unit: &CopyUnit) -> Result<(Node, Option<TreeId>), TreeServiceError> {
        let source_id = unit.source_id.clone();
        let target_id = unit.target_id.clone();
        self.locks
            .read(move |tx| {
                let source_id = source_id.clone();
                let target_id = target_id.clone();
                Box::pin(async move {
                    let source = load_node(tx, &source_id).await?;
                    let target_tree = match &target_id {
                        Some(id) => Some(load_node(tx, id).await?.tree_id),
                        None => None,
                    };
                    Ok((source, target_tree))
                })
            })
            .await
    }

    async fn deep_copy(
        &self,
        ctx: &TreeContext,
        unit: &CopyUnit,
        source: &Node,
        target_tree: Option<TreeId>,
        options: &CloneOptions,
        excluded: &HashSet<String>,
    ) -> Result<Vec<Node>, TreeServiceError> {
        let (source, options, excluded) = (source.clone(), options.clone(), excluded.clone());
        let (target_id, explicit_id, overrides) = (
            unit.target_id.clone(),
            unit.explicit_id.clone(),
            unit.overrides.clone(),
        );
        let cloned = self
            .locks
            .read(move |tx| {
                let (source, options, excluded) = (source.clone(), options.clone(), excluded.clone());
                let (target_id, explicit_id, overrides) =
                    (target_id.clone(), explicit_id.clone(), overrides.clone());
                Box::pin(async move {
                    clone_tree(
                        tx,
                        &source,
                        target_id.as_deref(),
                        &options,
                        explicit_id.as_deref(),
                        overrides.as_ref(),
                        &excluded,
                    )
                    .await
                })
            })
            .await?;

        let batch = cloned.nodes.clone();
        let target_id = unit.target_id.clone();
        let position = unit.position;
        let inserted = self
            .locks
            .with_current_locks(ctx, &[target_tree], move |tx, locked| {
                let mut batch = batch.clone();
                let target_id = target_id.clone();
                Box::pin(async move {
                    let target = match reload_target(tx, target_id.as_deref(), &locked).await? {
                        Verified::Done(target) => target,
                        Verified::Relock(found) => return Ok(Verified::Relock(found)),
                    };
                    place_and_insert(tx, &mut batch, target.as_ref(), position).await?;
                    if let Some(target) = &target {
                        tx.mark_changed(&target.id).await?;
                    }
                    Ok(Verified::Done(batch))
                })
            })
            .await?;

        let selection = NodeSelection::Many(cloned.id_map.keys().cloned().collect());
        self.dependents.copy(ctx, &selection, &cloned.id_map).await?;
        Ok(inserted)
    }

    /// Insert a copy of `source` alone. Returns the copy and the source
    /// children still to be copied, in sibling order.
    async fn shallow_copy(
        &self,
        ctx: &TreeContext,
        unit: &CopyUnit,
        source: &Node,
        target_tree: Option<TreeId>,
        options: &CloneOptions,
        excluded: &HashSet<String>,
    ) -> Result<(Node, Vec<String>), TreeServiceError> {
        let (src, opts, excl) = (source.clone(), options.clone(), excluded.clone());
        let (explicit_id, overrides) = (unit.explicit_id.clone(), unit.overrides.clone());
        let (copy, children) = self
            .locks
            .read(move |tx| {
                let (source, options, excluded) = (src.clone(), opts.clone(), excl.clone());
                let (explicit_id, overrides) = (explicit_id.clone(), overrides.clone());
                Box::pin(async move {
                    let copy = clone_node(
                        tx,
                        &source,
                        None,
                        &options,
                        explicit_id.as_deref(),
                        overrides.as_ref(),
                    )
                    .await?;
                    let children: Vec<String> = if source.kind.is_container() {
                        tx.get_children(&source.id)
                            .await?
                            .into_iter()
                            .filter(|c| !excluded.contains(&c.id))
                            .map(|c| c.id)
                            .collect()
                    } else {
                        Vec::new()
                    };
                    Ok((copy, children))
                })
            })
            .await?;

        let target_id = unit.target_id.clone();
        let position = unit.position;
        let inserted = self
            .locks
            .with_current_locks(ctx, &[target_tree], move |tx, locked| {
                let mut batch = vec![copy.clone()];
                let target_id = target_id.clone();
                Box::pin(async move {
                    let target = match reload_target(tx, target_id.as_deref(), &locked).await? {
                        Verified::Done(target) => target,
                        Verified::Relock(found) => return Ok(Verified::Relock(found)),
                    };
                    place_and_insert(tx, &mut batch, target.as_ref(), position).await?;
                    Ok(Verified::Done(batch.remove(0)))
                })
            })
            .await?;

        let id_map = HashMap::from([(source.id.clone(), inserted.id.clone())]);
        self.dependents
            .copy(ctx, &NodeSelection::Single(source.id.clone()), &id_map)
            .await?;
        Ok((inserted, children))
    }
}

/// The unit's target as stored now, or the trees to lock instead when it
/// moved out of `locked` after the unit was loaded.
async fn reload_target(
    tx: &mut dyn TreeTransaction,
    target_id: Option<&str>,
    locked: &[TreeId],
) -> Result<Verified<Option<Node>>, TreeServiceError> {
    let Some(id) = target_id else {
        return Ok(Verified::Done(None));
    };
    let target = load_node(tx, id).await?;
    let found = [Some(target.tree_id)];
    if lock_set_covers(locked, &found) {
        Ok(Verified::Done(Some(target)))
    } else {
        Ok(Verified::Relock(found.to_vec()))
    }
}

/// Nodes in `source`'s subtree that a copy reaches: outside every excluded
/// subtree and never below a non-container.
async fn count_nodes_to_copy(
    tx: &mut dyn TreeTransaction,
    source: &Node,
    excluded: &HashSet<String>,
) -> Result<u64, TreeServiceError> {
    let nodes = tx.get_range(source.tree_id, source.lft, source.rght).await?;
    let cut: Vec<(i64, i64)> = nodes
        .iter()
        .filter_map(|n| {
            if excluded.contains(&n.id) {
                Some((n.lft, n.rght))
            } else if !n.kind.is_container() {
                // Descendants only; the node itself is copied.
                Some((n.lft + 1, n.rght - 1))
            } else {
                None
            }
        })
        .collect();
    let count = nodes
        .iter()
        .filter(|n| !cut.iter().any(|(l, r)| *l <= n.lft && n.rght <= *r))
        .count();
    Ok(count as u64)
}
