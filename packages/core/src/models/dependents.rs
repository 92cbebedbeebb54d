//! Dependent Records
//!
//! Rows that reference a [`Node`](super::Node) by id and must be duplicated
//! (never shared) when the node is copied: attached files, assessment items,
//! tag associations, and prerequisite links.
//!
//! Only the columns the tree engine reads or rewrites are modelled here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored file attached either to a node or to one of its assessment items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub contentnode_id: Option<String>,
    pub assessment_item_id: Option<i64>,
    pub checksum: String,
    pub file_format: String,
    pub preset: String,
    pub file_size: i64,
    pub original_filename: String,
}

/// An exercise question owned by a node.
///
/// `id` is assigned by the store; `assessment_id` is the stable identity that
/// survives copies and is unique per owning node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentItem {
    pub id: i64,
    pub contentnode_id: String,
    pub assessment_id: String,
    pub item_type: String,
    pub question: String,
    pub answers: Value,
    pub hints: Value,
    pub order: i64,
    pub raw_data: String,
}

/// An assessment item that has not been assigned a store id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAssessmentItem {
    pub contentnode_id: String,
    pub assessment_id: String,
    pub item_type: String,
    pub question: String,
    pub answers: Value,
    pub hints: Value,
    pub order: i64,
    pub raw_data: String,
}

impl AssessmentItem {
    /// Duplicate this item's payload for another node.
    pub fn duplicate_for(&self, contentnode_id: impl Into<String>) -> NewAssessmentItem {
        NewAssessmentItem {
            contentnode_id: contentnode_id.into(),
            assessment_id: self.assessment_id.clone(),
            item_type: self.item_type.clone(),
            question: self.question.clone(),
            answers: self.answers.clone(),
            hints: self.hints.clone(),
            order: self.order,
            raw_data: self.raw_data.clone(),
        }
    }
}

/// A tag. Tags scoped to a channel have `channel_id`; shared tags have none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentTag {
    pub id: i64,
    pub tag_name: String,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContentTag {
    pub tag_name: String,
    pub channel_id: Option<String>,
}

/// Association row between a node and a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTag {
    pub node_id: String,
    pub tag_id: i64,
}

/// "`prerequisite_id` must be completed before `target_node_id`". Both ends
/// live in the same tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteLink {
    pub prerequisite_id: String,
    pub target_node_id: String,
}

impl PrerequisiteLink {
    pub fn involves(&self, node_id: &str) -> bool {
        self.prerequisite_id == node_id || self.target_node_id == node_id
    }
}
