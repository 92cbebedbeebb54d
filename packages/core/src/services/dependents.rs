//! Dependent-Record Copier
//!
//! Duplicates the rows that hang off copied nodes (files, assessment items,
//! tag links) and repoints them at the copies through an old-id→new-id map.
//!
//! Runs in its own transaction, outside the tree lock. A failure here leaves
//! the already-inserted nodes in place.
//!
//! # Correlation
//!
//! Store-assigned assessment item ids are correlated back to the originals by
//! `(new_node_id, assessment_id)`, which is unique per node, rather than by
//! insertion order.

use crate::db::TreeTransaction;
use crate::models::{new_hex_id, ContentTag, FileRecord, NewContentTag, NodeTag};
use crate::services::{TreeContext, TreeLockManager, TreeServiceError};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Which source nodes to copy dependents for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSelection {
    Single(String),
    Many(Vec<String>),
}

impl NodeSelection {
    /// Build a selection from the two optional selector forms; `single` wins
    /// when both are given.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` when neither selector is given.
    pub fn from_parts(
        single: Option<String>,
        many: Option<Vec<String>>,
    ) -> Result<Self, TreeServiceError> {
        match (single, many) {
            (Some(id), _) => Ok(Self::Single(id)),
            (None, Some(ids)) => Ok(Self::Many(ids)),
            (None, None) => Err(TreeServiceError::invariant_violation(
                "dependent copy needs a node or a node set",
            )),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        match self {
            Self::Single(id) => vec![id.clone()],
            Self::Many(ids) => ids.clone(),
        }
    }
}

/// Counts of rows written by one dependent copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentCopyStats {
    pub files: usize,
    pub assessment_items: usize,
    pub tags_created: usize,
    pub tags_reused: usize,
    pub node_tags: usize,
}

pub struct DependentRecordCopier {
    locks: Arc<TreeLockManager>,
}

impl DependentRecordCopier {
    pub fn new(locks: Arc<TreeLockManager>) -> Self {
        Self { locks }
    }

    /// Copy every dependent of `selection` onto the mapped copies.
    ///
    /// # Errors
    ///
    /// `MissingCorrelation` when a source row refers to a node or item that
    /// `id_map` (or the items inserted here) does not account for.
    pub async fn copy(
        &self,
        ctx: &TreeContext,
        selection: &NodeSelection,
        id_map: &HashMap<String, String>,
    ) -> Result<DependentCopyStats, TreeServiceError> {
        let source_ids = selection.ids();
        if source_ids.is_empty() {
            return Ok(DependentCopyStats::default());
        }
        let id_map = id_map.clone();

        let stats = self
            .locks
            .with_locks(ctx, &[], move |tx| {
                let source_ids = source_ids.clone();
                let id_map = id_map.clone();
                Box::pin(async move { copy_dependents(tx, &source_ids, &id_map).await })
            })
            .await?;

        tracing::debug!(
            "Copied dependents: {} files, {} items, {} tag links",
            stats.files,
            stats.assessment_items,
            stats.node_tags
        );
        Ok(stats)
    }
}

fn mapped<'m>(
    id_map: &'m HashMap<String, String>,
    record: &'static str,
    old_id: &str,
) -> Result<&'m String, TreeServiceError> {
    id_map
        .get(old_id)
        .ok_or_else(|| TreeServiceError::missing_correlation(record, old_id))
}

pub(crate) async fn copy_dependents(
    tx: &mut dyn TreeTransaction,
    source_ids: &[String],
    id_map: &HashMap<String, String>,
) -> Result<DependentCopyStats, TreeServiceError> {
    let mut stats = DependentCopyStats {
        files: copy_node_files(tx, source_ids, id_map).await?,
        ..Default::default()
    };
    let (items, item_files) = copy_assessment_items(tx, source_ids, id_map).await?;
    stats.assessment_items = items;
    stats.files += item_files;

    let (created, reused, links) = copy_tags(tx, source_ids, id_map).await?;
    stats.tags_created = created;
    stats.tags_reused = reused;
    stats.node_tags = links;
    Ok(stats)
}

async fn copy_node_files(
    tx: &mut dyn TreeTransaction,
    source_ids: &[String],
    id_map: &HashMap<String, String>,
) -> Result<usize, TreeServiceError> {
    let files = tx.files_for_nodes(source_ids).await?;
    let mut copies = Vec::with_capacity(files.len());
    for file in files {
        let Some(owner) = file.contentnode_id.as_deref() else {
            continue;
        };
        let new_owner = mapped(id_map, "file", owner)?.clone();
        copies.push(FileRecord {
            id: new_hex_id(),
            contentnode_id: Some(new_owner),
            ..file
        });
    }
    tx.insert_files(&copies).await?;
    Ok(copies.len())
}

/// Returns `(items copied, item files copied)`.
async fn copy_assessment_items(
    tx: &mut dyn TreeTransaction,
    source_ids: &[String],
    id_map: &HashMap<String, String>,
) -> Result<(usize, usize), TreeServiceError> {
    let items = tx.assessment_items_for_nodes(source_ids).await?;
    if items.is_empty() {
        return Ok((0, 0));
    }

    let mut duplicates = Vec::with_capacity(items.len());
    for item in &items {
        let new_owner = mapped(id_map, "assessment item", &item.contentnode_id)?;
        duplicates.push(item.duplicate_for(new_owner.clone()));
    }
    let inserted = tx.insert_assessment_items(&duplicates).await?;

    let by_key: HashMap<String, i64> = inserted
        .iter()
        .map(|item| (format!("{}:{}", item.contentnode_id, item.assessment_id), item.id))
        .collect();

    let mut item_map: HashMap<i64, i64> = HashMap::with_capacity(items.len());
    for item in &items {
        let key = format!(
            "{}:{}",
            mapped(id_map, "assessment item", &item.contentnode_id)?,
            item.assessment_id
        );
        let new_id = by_key
            .get(&key)
            .copied()
            .ok_or_else(|| TreeServiceError::missing_correlation("assessment item", key))?;
        item_map.insert(item.id, new_id);
    }

    let old_ids: Vec<i64> = items.iter().map(|i| i.id).collect();
    let files = tx.files_for_assessment_items(&old_ids).await?;
    let mut copies = Vec::with_capacity(files.len());
    for file in files {
        let Some(old_item) = file.assessment_item_id else {
            continue;
        };
        let new_item = item_map.get(&old_item).copied().ok_or_else(|| {
            TreeServiceError::missing_correlation("assessment item file", file.id.clone())
        })?;
        copies.push(FileRecord {
            id: new_hex_id(),
            assessment_item_id: Some(new_item),
            ..file
        });
    }
    tx.insert_files(&copies).await?;
    Ok((inserted.len(), copies.len()))
}

/// Returns `(tags created, tags reused, links copied)`.
async fn copy_tags(
    tx: &mut dyn TreeTransaction,
    source_ids: &[String],
    id_map: &HashMap<String, String>,
) -> Result<(usize, usize, usize), TreeServiceError> {
    let links = tx.node_tags_for_nodes(source_ids).await?;
    if links.is_empty() {
        return Ok((0, 0, 0));
    }

    let tag_ids: Vec<i64> = links
        .iter()
        .map(|l| l.tag_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let tags = tx.tags_by_ids(&tag_ids).await?;
    let names: Vec<String> = tags
        .iter()
        .map(|t| t.tag_name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut shared: BTreeMap<String, i64> = BTreeMap::new();
    for tag in tx.shared_tags_by_names(&names).await? {
        shared.entry(tag.tag_name).or_insert(tag.id);
    }
    let reused = shared.len();

    let missing: Vec<NewContentTag> = names
        .iter()
        .filter(|name| !shared.contains_key(*name))
        .map(|name| NewContentTag {
            tag_name: name.clone(),
            channel_id: None,
        })
        .collect();
    let created: Vec<ContentTag> = tx.insert_tags(&missing).await?;
    for tag in &created {
        shared.insert(tag.tag_name.clone(), tag.id);
    }

    let tag_map: HashMap<i64, i64> = tags
        .iter()
        .filter_map(|t| shared.get(&t.tag_name).map(|new_id| (t.id, *new_id)))
        .collect();

    let mut copies = Vec::with_capacity(links.len());
    for link in &links {
        let node_id = mapped(id_map, "tag link", &link.node_id)?.clone();
        let tag_id = tag_map.get(&link.tag_id).copied().ok_or_else(|| {
            TreeServiceError::missing_correlation("tag", link.tag_id.to_string())
        })?;
        copies.push(NodeTag { node_id, tag_id });
    }
    tx.insert_node_tags(&copies).await?;
    Ok((created.len(), reused, copies.len()))
}
