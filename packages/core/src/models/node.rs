//! Node Data Structures
//!
//! This module defines the `Node` record stored in a nested-set forest, plus
//! the small value types that travel with it (tree ids, content kinds,
//! insertion positions, coordinate snapshots and sparse field patches).
//!
//! # Coordinates
//!
//! Every node carries `(tree_id, lft, rght, level, parent_id)`:
//!
//! - Within one `tree_id` the `(lft, rght)` intervals are laminar (nested or disjoint)
//! - `rght - lft` is a positive odd number; a leaf has `rght = lft + 1`
//! - `level` of a child is `level` of its parent plus one, roots sit at level 0
//!
//! # Examples
//!
//! ```rust
//! use channeltree_core::models::{ContentKind, Node};
//!
//! let topic = Node::new(ContentKind::Topic, "Algebra");
//! assert!(topic.kind.is_container());
//! assert!(topic.parent_id.is_none());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Validation errors for node value types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid content kind: {0}")]
    InvalidKind(String),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),
}

/// Identifier grouping all nodes of one independent tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(pub i64);

impl TreeId {
    /// Sentinel meaning "every tree". Never a valid target for structural writes.
    pub const ALL_TREES: TreeId = TreeId(-1);

    /// Placeholder carried by nodes that have not been placed in a tree yet.
    pub const UNASSIGNED: TreeId = TreeId(0);

    /// True for ids issued by the tree id registry.
    pub fn is_concrete(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content kind of a node. Only containers have children that get copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Topic,
    Video,
    Audio,
    Exercise,
    Document,
    Html5,
    Slideshow,
    H5p,
    Zim,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Topic => "topic",
            ContentKind::Video => "video",
            ContentKind::Audio => "audio",
            ContentKind::Exercise => "exercise",
            ContentKind::Document => "document",
            ContentKind::Html5 => "html5",
            ContentKind::Slideshow => "slideshow",
            ContentKind::H5p => "h5p",
            ContentKind::Zim => "zim",
        }
    }

    /// Whether nodes of this kind own children.
    pub fn is_container(&self) -> bool {
        matches!(self, ContentKind::Topic)
    }
}

impl FromStr for ContentKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "topic" => Ok(ContentKind::Topic),
            "video" => Ok(ContentKind::Video),
            "audio" => Ok(ContentKind::Audio),
            "exercise" => Ok(ContentKind::Exercise),
            "document" => Ok(ContentKind::Document),
            "html5" => Ok(ContentKind::Html5),
            "slideshow" => Ok(ContentKind::Slideshow),
            "h5p" => Ok(ContentKind::H5p),
            "zim" => Ok(ContentKind::Zim),
            other => Err(ValidationError::InvalidKind(other.to_string())),
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a node lands relative to a target node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    FirstChild,
    #[default]
    LastChild,
    Left,
    Right,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::FirstChild => "first-child",
            Position::LastChild => "last-child",
            Position::Left => "left",
            Position::Right => "right",
        }
    }

    /// `left`/`right` place the node beside the target instead of under it.
    pub fn is_sibling(&self) -> bool {
        matches!(self, Position::Left | Position::Right)
    }
}

impl FromStr for Position {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-child" => Ok(Position::FirstChild),
            "last-child" => Ok(Position::LastChild),
            "left" => Ok(Position::Left),
            "right" => Ok(Position::Right),
            other => Err(ValidationError::InvalidPosition(other.to_string())),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the structural columns of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCoordinates {
    pub tree_id: TreeId,
    pub lft: i64,
    pub rght: i64,
    pub level: i64,
    pub parent_id: Option<String>,
}

/// A record in the nested-set forest.
///
/// `cloned_source_id` is a plain id reference to the node this one was copied
/// from; resolving it goes through a store lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Primary key (32 hex chars)
    pub id: String,

    /// Stable identity of this node within its channel, regenerated on copy
    pub node_id: String,

    pub parent_id: Option<String>,
    pub tree_id: TreeId,
    pub lft: i64,
    pub rght: i64,
    pub level: i64,

    pub kind: ContentKind,

    /// Identity of the underlying content, shared by every copy
    pub content_id: String,
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
    pub aggregator: String,
    pub role_visibility: String,

    // Provenance
    pub cloned_source_id: Option<String>,
    pub source_channel_id: Option<String>,
    pub source_node_id: Option<String>,
    pub original_channel_id: Option<String>,
    pub original_source_node_id: Option<String>,

    pub freeze_authoring_data: bool,
    pub changed: bool,
    pub published: bool,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Generate a fresh 32-character hex identifier.
pub fn new_hex_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Node {
    /// Create an unplaced node with fresh ids and default payload.
    ///
    /// Coordinates are filled in when the node is inserted into a tree.
    pub fn new(kind: ContentKind, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_hex_id(),
            node_id: new_hex_id(),
            parent_id: None,
            tree_id: TreeId::UNASSIGNED,
            lft: 0,
            rght: 0,
            level: 0,
            kind,
            content_id: new_hex_id(),
            title: title.into(),
            description: String::new(),
            language_id: None,
            license_id: None,
            license_description: None,
            thumbnail_encoding: None,
            extra_fields: Value::Object(Default::default()),
            copyright_holder: None,
            author: String::new(),
            provider: String::new(),
            aggregator: String::new(),
            role_visibility: "learner".to_string(),
            cloned_source_id: None,
            source_channel_id: None,
            source_node_id: None,
            original_channel_id: None,
            original_source_node_id: None,
            freeze_authoring_data: false,
            changed: true,
            published: false,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn coordinates(&self) -> NodeCoordinates {
        NodeCoordinates {
            tree_id: self.tree_id,
            lft: self.lft,
            rght: self.rght,
            level: self.level,
            parent_id: self.parent_id.clone(),
        }
    }

    pub fn set_coordinates(&mut self, coords: NodeCoordinates) {
        self.tree_id = coords.tree_id;
        self.lft = coords.lft;
        self.rght = coords.rght;
        self.level = coords.level;
        self.parent_id = coords.parent_id;
    }

    /// `rght - lft`, used as the size proxy when choosing a copy strategy.
    pub fn span(&self) -> i64 {
        self.rght - self.lft
    }

    /// Number of nodes in the subtree rooted here, self included.
    pub fn subtree_size(&self) -> i64 {
        (self.span() + 1) / 2
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.rght == self.lft + 1
    }

    /// Whether `other` lies strictly inside this node's interval.
    pub fn is_ancestor_of(&self, other: &Node) -> bool {
        self.tree_id == other.tree_id && self.lft < other.lft && other.rght < self.rght
    }
}

/// Deserialize a field that distinguishes "absent" from "explicit null".
///
/// - Missing field → None (leave unchanged)
/// - null → Some(None) (clear)
/// - value → Some(Some(value))
fn deserialize_optional_field<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Some(Option::<T>::deserialize(deserializer)?))
}

/// Sparse, typed field overrides applied to a copy after the source attributes.
///
/// Nullable columns use the double-`Option` pattern:
///
/// - `None`: keep whatever the copy already has
/// - `Some(None)`: clear the column
/// - `Some(Some(v))`: set it to `v`
///
/// # Examples
///
/// ```rust
/// use channeltree_core::models::NodePatch;
///
/// let patch = NodePatch::new()
///     .with_title("Copied lesson")
///     .with_language_id(None);
/// assert!(!patch.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub language_id: Option<Option<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub license_id: Option<Option<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub license_description: Option<Option<String>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub thumbnail_encoding: Option<Option<Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_fields: Option<Value>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub copyright_holder: Option<Option<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_visibility: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub freeze_authoring_data: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,
}

impl NodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_language_id(mut self, language_id: Option<String>) -> Self {
        self.language_id = Some(language_id);
        self
    }

    pub fn with_extra_fields(mut self, extra_fields: Value) -> Self {
        self.extra_fields = Some(extra_fields);
        self
    }

    pub fn with_freeze_authoring_data(mut self, freeze: bool) -> Self {
        self.freeze_authoring_data = Some(freeze);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write every present field onto `node`.
    pub fn apply(&self, node: &mut Node) {
        if let Some(title) = &self.title {
            node.title = title.clone();
        }
        if let Some(description) = &self.description {
            node.description = description.clone();
        }
        if let Some(content_id) = &self.content_id {
            node.content_id = content_id.clone();
        }
        if let Some(language_id) = &self.language_id {
            node.language_id = language_id.clone();
        }
        if let Some(license_id) = &self.license_id {
            node.license_id = license_id.clone();
        }
        if let Some(license_description) = &self.license_description {
            node.license_description = license_description.clone();
        }
        if let Some(thumbnail_encoding) = &self.thumbnail_encoding {
            node.thumbnail_encoding = thumbnail_encoding.clone();
        }
        if let Some(extra_fields) = &self.extra_fields {
            node.extra_fields = extra_fields.clone();
        }
        if let Some(copyright_holder) = &self.copyright_holder {
            node.copyright_holder = copyright_holder.clone();
        }
        if let Some(author) = &self.author {
            node.author = author.clone();
        }
        if let Some(provider) = &self.provider {
            node.provider = provider.clone();
        }
        if let Some(aggregator) = &self.aggregator {
            node.aggregator = aggregator.clone();
        }
        if let Some(role_visibility) = &self.role_visibility {
            node.role_visibility = role_visibility.clone();
        }
        if let Some(freeze) = self.freeze_authoring_data {
            node.freeze_authoring_data = freeze;
        }
        if let Some(published) = self.published {
            node.published = published;
        }
    }
}

/// A channel owns one main tree, addressed through its root node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub root_node_id: String,
    pub tree_id: TreeId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tree_id_sentinels() {
        assert!(!TreeId::ALL_TREES.is_concrete());
        assert!(!TreeId::UNASSIGNED.is_concrete());
        assert!(TreeId(1).is_concrete());
        assert!(TreeId(1) < TreeId(3));
    }

    #[test]
    fn test_position_parsing() {
        assert_eq!("first-child".parse::<Position>().unwrap(), Position::FirstChild);
        assert_eq!("right".parse::<Position>().unwrap(), Position::Right);
        assert!("below".parse::<Position>().is_err());
        assert!(Position::Left.is_sibling());
        assert!(!Position::LastChild.is_sibling());

        let json = serde_json::to_string(&Position::LastChild).unwrap();
        assert_eq!(json, "\"last-child\"");
    }

    #[test]
    fn test_kind_round_trip_and_container() {
        for kind in [ContentKind::Topic, ContentKind::Exercise, ContentKind::H5p] {
            assert_eq!(kind.as_str().parse::<ContentKind>().unwrap(), kind);
        }
        assert!(ContentKind::Topic.is_container());
        assert!(!ContentKind::Video.is_container());
    }

    #[test]
    fn test_new_node_has_distinct_hex_ids() {
        let node = Node::new(ContentKind::Video, "Intro");
        assert_eq!(node.id.len(), 32);
        assert_ne!(node.id, node.node_id);
        assert_eq!(node.tree_id, TreeId::UNASSIGNED);
        assert!(node.changed);
        assert!(!node.published);
    }

    #[test]
    fn test_span_and_containment() {
        let mut parent = Node::new(ContentKind::Topic, "p");
        parent.tree_id = TreeId(1);
        parent.lft = 1;
        parent.rght = 6;
        let mut child = Node::new(ContentKind::Video, "c");
        child.tree_id = TreeId(1);
        child.lft = 2;
        child.rght = 3;

        assert_eq!(parent.span(), 5);
        assert_eq!(parent.subtree_size(), 3);
        assert!(parent.is_ancestor_of(&child));
        assert!(!child.is_ancestor_of(&parent));
        assert!(child.is_leaf());
    }

    #[test]
    fn test_patch_double_option_deserialization() {
        let patch: NodePatch =
            serde_json::from_value(json!({"title": "T", "languageId": null})).unwrap();
        assert_eq!(patch.title.as_deref(), Some("T"));
        assert_eq!(patch.language_id, Some(None));
        assert_eq!(patch.license_id, None);

        let mut node = Node::new(ContentKind::Document, "Old");
        node.language_id = Some("en".to_string());
        node.license_id = Some("CC BY".to_string());
        patch.apply(&mut node);

        assert_eq!(node.title, "T");
        assert_eq!(node.language_id, None);
        assert_eq!(node.license_id.as_deref(), Some("CC BY"));
    }

    #[test]
    fn test_empty_patch() {
        assert!(NodePatch::new().is_empty());
        assert!(!NodePatch::new().with_freeze_authoring_data(true).is_empty());
    }
}
