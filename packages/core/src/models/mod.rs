//! Data Models
//!
//! This module contains the data structures used throughout the tree engine:
//!
//! - `Node` - a record in the nested-set forest, with its coordinate columns
//! - Dependent records (files, assessment items, tags, prerequisites)
//! - Coordinate arithmetic: placement, pre-order layout, rebuild and validation

pub mod coordinates;
mod dependents;
mod node;

pub use coordinates::{check_tree, layout_preorder, rebuild_coordinates, Placement, TreeShapeError};
pub use dependents::{
    AssessmentItem, ContentTag, FileRecord, NewAssessmentItem, NewContentTag, NodeTag,
    PrerequisiteLink,
};
pub use node::{
    new_hex_id, Channel, ContentKind, Node, NodeCoordinates, NodePatch, Position, TreeId,
    ValidationError,
};
