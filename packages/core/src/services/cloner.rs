//! Subtree Cloner
//!
//! Builds in-memory copies of nodes with rewritten identity and provenance.
//! Cloning only reads from the store, so it runs outside any tree lock; the
//! copies carry no coordinates until the copy orchestrator lays them out.

use crate::db::TreeTransaction;
use crate::models::{new_hex_id, ContentKind, Node, NodePatch};
use crate::services::TreeServiceError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Attributes that flow from a source node to its copies.
///
/// Used both when copying and when pulling updates from the source later
/// (`sync_from_source`), so both paths agree on what "the content" is.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttributes {
    pub content_id: String,
    pub kind: ContentKind,
    pub title: String,
    pub description: String,
    pub language_id: Option<String>,
    pub license_id: Option<String>,
    pub license_description: Option<String>,
    pub thumbnail_encoding: Option<Value>,
    pub extra_fields: Value,
    pub copyright_holder: Option<String>,
    pub author: String,
    pub provider: String,
    pub role_visibility: String,
}

impl SourceAttributes {
    pub fn from_node(source: &Node) -> Self {
        Self {
            content_id: source.content_id.clone(),
            kind: source.kind,
            title: source.title.clone(),
            description: source.description.clone(),
            language_id: source.language_id.clone(),
            license_id: source.license_id.clone(),
            license_description: source.license_description.clone(),
            thumbnail_encoding: source.thumbnail_encoding.clone(),
            extra_fields: source.extra_fields.clone(),
            copyright_holder: source.copyright_holder.clone(),
            author: source.author.clone(),
            provider: source.provider.clone(),
            role_visibility: source.role_visibility.clone(),
        }
    }

    pub fn apply(self, node: &mut Node) {
        node.content_id = self.content_id;
        node.kind = self.kind;
        node.title = self.title;
        node.description = self.description;
        node.language_id = self.language_id;
        node.license_id = self.license_id;
        node.license_description = self.license_description;
        node.thumbnail_encoding = self.thumbnail_encoding;
        node.extra_fields = self.extra_fields;
        node.copyright_holder = self.copyright_holder;
        node.author = self.author;
        node.provider = self.provider;
        node.role_visibility = self.role_visibility;
    }
}

/// The fields copied from `source`. Shorthand for [`SourceAttributes::from_node`].
pub fn clone_fields(source: &Node) -> SourceAttributes {
    SourceAttributes::from_node(source)
}

/// Re-apply the source's attributes to `node` and flag it changed.
pub fn sync_from_source(node: &mut Node, source: &Node) {
    clone_fields(source).apply(node);
    node.changed = true;
    node.modified_at = chrono::Utc::now();
}

/// Per-copy settings shared by every node of one clone pass.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Channel the source lives in; recorded as `source_channel_id`.
    pub source_channel_id: Option<String>,
    /// Whether the copier may edit the source channel.
    pub can_edit_source_channel: bool,
}

/// Result of cloning a subtree: the copies in pre-order plus the old→new map.
#[derive(Debug, Clone, Default)]
pub struct ClonedSubtree {
    pub nodes: Vec<Node>,
    pub id_map: HashMap<String, String>,
}

impl ClonedSubtree {
    pub fn root(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Clone a single node.
///
/// The copy gets a fresh `id` (or `explicit_id`) and `node_id`, points back at
/// `source` through `cloned_source_id`, and is left unplaced under
/// `parent_id`. `overrides` are applied last.
///
/// # Errors
///
/// Store failures while resolving the original provenance of `source`.
pub async fn clone_node(
    tx: &mut dyn TreeTransaction,
    source: &Node,
    parent_id: Option<&str>,
    options: &CloneOptions,
    explicit_id: Option<&str>,
    overrides: Option<&NodePatch>,
) -> Result<Node, TreeServiceError> {
    let mut copy = Node::new(source.kind, source.title.clone());
    clone_fields(source).apply(&mut copy);

    copy.id = explicit_id.map(str::to_string).unwrap_or_else(new_hex_id);
    copy.node_id = new_hex_id();
    copy.parent_id = parent_id.map(str::to_string);
    copy.aggregator = source.aggregator.clone();

    copy.cloned_source_id = Some(source.id.clone());
    copy.source_channel_id = options.source_channel_id.clone();
    copy.source_node_id = Some(source.node_id.clone());

    let (original_channel_id, original_source_node_id) = resolve_original(tx, source).await?;
    copy.original_channel_id = original_channel_id;
    copy.original_source_node_id = original_source_node_id;

    copy.freeze_authoring_data =
        !options.can_edit_source_channel || source.freeze_authoring_data;
    copy.changed = true;
    copy.published = false;

    if let Some(patch) = overrides {
        patch.apply(&mut copy);
    }
    Ok(copy)
}

/// Clone `source` and every descendant reachable through container nodes.
///
/// Children are visited in `lft` order; `excluded` ids are skipped together
/// with their subtrees. Only the root receives `explicit_id` and `overrides`.
pub async fn clone_tree(
    tx: &mut dyn TreeTransaction,
    source: &Node,
    parent_id: Option<&str>,
    options: &CloneOptions,
    explicit_id: Option<&str>,
    overrides: Option<&NodePatch>,
    excluded: &HashSet<String>,
) -> Result<ClonedSubtree, TreeServiceError> {
    let mut out = ClonedSubtree::default();
    // Popping a node emits it, so the output is in pre-order.
    let mut stack: Vec<(Node, Option<String>)> =
        vec![(source.clone(), parent_id.map(str::to_string))];

    while let Some((original, parent)) = stack.pop() {
        let copy = if out.nodes.is_empty() {
            clone_node(tx, &original, parent.as_deref(), options, explicit_id, overrides).await?
        } else {
            clone_node(tx, &original, parent.as_deref(), options, None, None).await?
        };
        out.id_map.insert(original.id.clone(), copy.id.clone());

        if original.kind.is_container() && !original.is_leaf() {
            let mut children = tx.get_children(&original.id).await?;
            children.retain(|c| !excluded.contains(&c.id));
            children.sort_by_key(|c| c.lft);
            for child in children.into_iter().rev() {
                stack.push((child, Some(copy.id.clone())));
            }
        }
        out.nodes.push(copy);
    }

    Ok(out)
}

/// Original channel and node id of `source`'s content.
///
/// Copied straight from `source` when recorded there; otherwise found by
/// following `cloned_source_id` back to the first node that was not itself a
/// copy. Broken or cyclic chains stop at the last node reached.
async fn resolve_original(
    tx: &mut dyn TreeTransaction,
    source: &Node,
) -> Result<(Option<String>, Option<String>), TreeServiceError> {
    if source.original_channel_id.is_some() && source.original_source_node_id.is_some() {
        return Ok((
            source.original_channel_id.clone(),
            source.original_source_node_id.clone(),
        ));
    }

    let mut origin = source.clone();
    let mut visited = HashSet::from([origin.id.clone()]);
    while let Some(next_id) = origin.cloned_source_id.clone() {
        if !visited.insert(next_id.clone()) {
            break;
        }
        match tx.get_node(&next_id).await? {
            Some(next) => origin = next,
            None => break,
        }
    }

    let channel = tx.channel_for_tree(origin.tree_id).await?;
    Ok((
        source
            .original_channel_id
            .clone()
            .or_else(|| channel.map(|c| c.id)),
        source
            .original_source_node_id
            .clone()
            .or_else(|| Some(origin.node_id.clone())),
    ))
}
