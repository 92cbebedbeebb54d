//! Domain Events
//!
//! Events emitted by the tree services after a structural change has been
//! committed and its tree locks released. They follow the observer pattern:
//! any number of subscribers receive them through a tokio broadcast channel,
//! and a slow or dropped subscriber never affects the committed change or the
//! other subscribers.
//!
//! # Event Flow
//!
//! 1. A service commits a move/copy/rebuild and releases the tree locks
//! 2. The domain event is sent on the broadcast channel
//! 3. Every live receiver gets its own copy

use crate::models::{Node, Position, TreeId};
use serde::{Deserialize, Serialize};

/// Domain events emitted by the tree services
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainEvent {
    /// A node (and its subtree) was moved. `node` carries post-move coordinates.
    #[serde(rename = "nodeMoved", rename_all = "camelCase")]
    NodeMoved {
        node: Node,
        target_id: Option<String>,
        position: Position,
    },

    /// A subtree was copied; `root_id` is the copy of the requested source.
    #[serde(rename = "subtreeCopied", rename_all = "camelCase")]
    SubtreeCopied {
        source_id: String,
        root_id: String,
        node_count: u64,
    },

    /// Structural columns of a tree were recomputed from parent links.
    #[serde(rename = "treeRebuilt", rename_all = "camelCase")]
    TreeRebuilt { tree_id: TreeId },
}

impl DomainEvent {
    /// Get a string representation of the event type
    pub fn event_type(&self) -> &str {
        match self {
            DomainEvent::NodeMoved { .. } => "node:moved",
            DomainEvent::SubtreeCopied { .. } => "subtree:copied",
            DomainEvent::TreeRebuilt { .. } => "tree:rebuilt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentKind;

    /// Contract test: the JSON shape consumed by external listeners.
    ///
    /// Serde's `#[serde(tag = "type")]` produces an INTERNALLY-TAGGED format
    /// where the discriminator is merged with the variant fields.
    #[test]
    fn test_node_moved_serialization_contract() {
        let event = DomainEvent::NodeMoved {
            node: Node::new(ContentKind::Video, "clip").with_id("n1"),
            target_id: Some("t1".to_string()),
            position: Position::FirstChild,
        };

        let parsed: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(parsed.get("type").unwrap(), "nodeMoved");
        assert_eq!(parsed.get("targetId").unwrap(), "t1");
        assert_eq!(parsed.get("position").unwrap(), "first-child");
        assert_eq!(parsed["node"]["id"], "n1");
    }

    #[test]
    fn test_subtree_copied_serialization_contract() {
        let event = DomainEvent::SubtreeCopied {
            source_id: "src".to_string(),
            root_id: "dst".to_string(),
            node_count: 6,
        };
        let parsed: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(parsed.get("type").unwrap(), "subtreeCopied");
        assert_eq!(parsed.get("sourceId").unwrap(), "src");
        assert_eq!(parsed.get("nodeCount").unwrap(), 6);
        assert_eq!(event.event_type(), "subtree:copied");
    }

    #[test]
    fn test_tree_rebuilt_uses_plain_tree_id() {
        let event = DomainEvent::TreeRebuilt { tree_id: TreeId(4) };
        let parsed: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(parsed.get("treeId").unwrap(), 4);
    }

    #[test]
    fn test_broadcast_without_subscribers_is_harmless() {
        let (tx, rx) = tokio::sync::broadcast::channel::<DomainEvent>(4);
        drop(rx);
        assert!(tx.send(DomainEvent::TreeRebuilt { tree_id: TreeId(1) }).is_err());

        let mut late = tx.subscribe();
        tx.send(DomainEvent::TreeRebuilt { tree_id: TreeId(2) })
            .unwrap();
        let event = tokio_test::block_on(late.recv()).unwrap();
        assert_eq!(event.event_type(), "tree:rebuilt");
    }
}
