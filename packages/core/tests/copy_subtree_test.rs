//! Subtree copy tests
//!
//! Exercises `TreeService::copy_subtree` end to end against the in-memory
//! store: structure, provenance, exclusions, strategy equivalence, and the
//! dependent records that travel with each copy.

#[cfg(test)]
mod copy_subtree_tests {
    use anyhow::Result;
    use channeltree_core::db::{DomainEvent, MemoryStore, TransactionMode, TreeStore};
    use channeltree_core::models::{
        check_tree, Channel, ContentKind, FileRecord, NewAssessmentItem, NewContentTag, Node,
        NodePatch, NodeTag, Position,
    };
    use channeltree_core::services::{CopyRequest, ProgressTracker, TreeContext, TreeService};
    use channeltree_core::TreeEngineConfig;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    struct Fixture {
        store: MemoryStore,
        service: TreeService,
        channel: Channel,
        /// Source ids by title
        ids: HashMap<String, String>,
    }

    /// R (topic) -> [A (topic) -> [a1, a2, a3], B (leaf)]
    async fn fixture() -> Result<Fixture> {
        let store = MemoryStore::new();
        let service = TreeService::new(Arc::new(store.clone()), TreeEngineConfig::default());
        let ctx = TreeContext::new();

        let channel = service.create_channel(&ctx, "R").await?;
        let mut ids = HashMap::from([("R".to_string(), channel.root_node_id.clone())]);

        let a = service
            .create_node(
                &ctx,
                Node::new(ContentKind::Topic, "A"),
                Some(&channel.root_node_id),
                Position::LastChild,
            )
            .await?;
        ids.insert("A".into(), a.id.clone());
        for (title, kind) in [
            ("a1", ContentKind::Video),
            ("a2", ContentKind::Audio),
            ("a3", ContentKind::Exercise),
        ] {
            let leaf = service
                .create_node(&ctx, Node::new(kind, title), Some(&a.id), Position::LastChild)
                .await?;
            ids.insert(title.into(), leaf.id);
        }
        let b = service
            .create_node(
                &ctx,
                Node::new(ContentKind::Document, "B"),
                Some(&channel.root_node_id),
                Position::LastChild,
            )
            .await?;
        ids.insert("B".into(), b.id);

        Ok(Fixture {
            store,
            service,
            channel,
            ids,
        })
    }

    /// Shape of a copied tree: (title, parent title, level, lft and rght
    /// relative to the root) in pre-order.
    async fn shape(service: &TreeService, root_id: &str) -> Result<Vec<(String, String, i64, i64, i64)>> {
        let nodes = service.get_descendants(root_id, true).await?;
        let titles: HashMap<String, String> =
            nodes.iter().map(|n| (n.id.clone(), n.title.clone())).collect();
        let base = nodes[0].lft;
        Ok(nodes
            .iter()
            .map(|n| {
                let parent = n
                    .parent_id
                    .as_ref()
                    .and_then(|p| titles.get(p).cloned())
                    .unwrap_or_default();
                (n.title.clone(), parent, n.level - nodes[0].level, n.lft - base, n.rght - base)
            })
            .collect())
    }

    #[tokio::test]
    async fn test_copy_to_new_root_reproduces_tree() -> Result<()> {
        let f = fixture().await?;
        let ctx = TreeContext::new();

        let copies = f
            .service
            .copy_subtree(
                &ctx,
                CopyRequest::new(&f.ids["R"])
                    .with_batch_size(100)
                    .can_edit_source_channel(false),
            )
            .await?;

        assert_eq!(copies.len(), 6);
        let new_ids: HashSet<_> = copies.iter().map(|n| n.id.clone()).collect();
        assert_eq!(new_ids.len(), 6);
        assert!(new_ids.iter().all(|id| !f.ids.values().any(|old| old == id)));

        for copy in &copies {
            let source = copy.cloned_source_id.as_deref().unwrap();
            assert_eq!(source, f.ids[&copy.title]);
            assert!(copy.freeze_authoring_data);
            assert_eq!(copy.source_channel_id.as_deref(), Some(f.channel.id.as_str()));
            assert_eq!(copy.original_channel_id.as_deref(), Some(f.channel.id.as_str()));
        }

        let root = &copies[0];
        assert!(root.is_root());
        assert_ne!(root.tree_id, f.channel.tree_id);
        assert_eq!(shape(&f.service, &root.id).await?, shape(&f.service, &f.ids["R"]).await?);
        assert_eq!(f.service.validate_tree(root.tree_id).await?, 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_size_does_not_change_result() -> Result<()> {
        let f = fixture().await?;
        let ctx = TreeContext::new();

        let deep = f
            .service
            .copy_with_outcome(&ctx, CopyRequest::new(&f.ids["R"]).with_batch_size(100))
            .await?;
        let shallow = f
            .service
            .copy_with_outcome(&ctx, CopyRequest::new(&f.ids["R"]).with_batch_size(2))
            .await?;

        assert_eq!(deep.units, 1);
        // R and A are split; the leaves and B are single units anyway.
        assert_eq!(shallow.units, 6);
        assert_eq!(deep.copied, shallow.copied);

        let deep_shape = shape(&f.service, &deep.nodes[0].id).await?;
        let shallow_shape = shape(&f.service, &shallow.nodes[0].id).await?;
        assert_eq!(deep_shape, shallow_shape);

        let deep_nodes = f.service.get_descendants(&deep.nodes[0].id, true).await?;
        let shallow_nodes = f.service.get_descendants(&shallow.nodes[0].id, true).await?;
        for (d, s) in deep_nodes.iter().zip(&shallow_nodes) {
            assert_eq!(d.cloned_source_id, s.cloned_source_id);
            assert_eq!(d.content_id, s.content_id);
            assert_eq!(d.kind, s.kind);
            assert_eq!(d.freeze_authoring_data, s.freeze_authoring_data);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_exclusions_remove_whole_subtrees() -> Result<()> {
        let f = fixture().await?;
        let tracker = ProgressTracker::new();
        let service = f.service.with_progress(Arc::new(tracker.clone()));

        for batch_size in [1, 100] {
            let outcome = service
                .copy_with_outcome(
                    &TreeContext::new(),
                    CopyRequest::new(&f.ids["R"])
                        .excluding([f.ids["A"].clone()])
                        .with_batch_size(batch_size),
                )
                .await?;

            // 6 nodes minus A's subtree of 4.
            assert_eq!(outcome.copied, 2);
            let titles: Vec<_> = service
                .get_descendants(&outcome.nodes[0].id, true)
                .await?
                .into_iter()
                .map(|n| n.title)
                .collect();
            assert_eq!(titles, vec!["R", "B"]);
            assert_eq!(tracker.snapshot().total, 2);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_into_existing_tree_with_overrides() -> Result<()> {
        let f = fixture().await?;
        let ctx = TreeContext::new();

        let copies = f
            .service
            .copy_subtree(
                &ctx,
                CopyRequest::new(&f.ids["A"])
                    .to(&f.ids["B"], Position::Right)
                    .with_id("0000000000000000000000000000000a")
                    .with_overrides(NodePatch::new().with_title("A (copy)"))
                    .can_edit_source_channel(true),
            )
            .await?;

        assert_eq!(copies[0].id, "0000000000000000000000000000000a");
        assert_eq!(copies[0].title, "A (copy)");
        assert_eq!(copies[0].parent_id.as_deref(), Some(f.ids["R"].as_str()));
        assert!(!copies[0].freeze_authoring_data);
        assert_eq!(copies[1].title, "a1");

        let tree = f.service.get_descendants(&f.ids["R"], true).await?;
        check_tree(&tree)?;
        let titles: Vec<_> = tree.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["R", "A", "a1", "a2", "a3", "B", "A (copy)", "a1", "a2", "a3"]
        );

        // Sibling target is flagged changed.
        let b = f.service.get_node(&f.ids["B"]).await?.unwrap();
        assert!(b.changed);
        Ok(())
    }

    #[tokio::test]
    async fn test_dependents_follow_every_unit() -> Result<()> {
        let f = fixture().await?;
        let ctx = TreeContext::new();

        let mut tx = f.store.begin(TransactionMode::Write).await?;
        tx.insert_files(&[FileRecord {
            id: "file-a1".into(),
            contentnode_id: Some(f.ids["a1"].clone()),
            assessment_item_id: None,
            checksum: "abc".into(),
            file_format: "mp4".into(),
            preset: "high_res_video".into(),
            file_size: 42,
            original_filename: "a1.mp4".into(),
        }])
        .await?;
        let items = tx
            .insert_assessment_items(&[NewAssessmentItem {
                contentnode_id: f.ids["a3"].clone(),
                assessment_id: "q1".into(),
                item_type: "input_question".into(),
                question: "1 + 1".into(),
                answers: json!([{"answer": "2", "correct": true}]),
                hints: json!([]),
                order: 0,
                raw_data: String::new(),
            }])
            .await?;
        tx.insert_files(&[FileRecord {
            id: "file-q1".into(),
            contentnode_id: None,
            assessment_item_id: Some(items[0].id),
            checksum: "img".into(),
            file_format: "png".into(),
            preset: "exercise_image".into(),
            file_size: 7,
            original_filename: "q1.png".into(),
        }])
        .await?;
        let tags = tx
            .insert_tags(&[NewContentTag {
                tag_name: "arithmetic".into(),
                channel_id: Some(f.channel.id.clone()),
            }])
            .await?;
        tx.insert_node_tags(&[NodeTag {
            node_id: f.ids["a3"].clone(),
            tag_id: tags[0].id,
        }])
        .await?;
        tx.commit().await?;

        for batch_size in [100, 1] {
            let copies = f
                .service
                .copy_with_outcome(&ctx, CopyRequest::new(&f.ids["R"]).with_batch_size(batch_size))
                .await?;
            let nodes = f.service.get_descendants(&copies.nodes[0].id, true).await?;
            let by_title: HashMap<_, _> =
                nodes.iter().map(|n| (n.title.clone(), n.id.clone())).collect();

            let mut tx = f.store.begin(TransactionMode::Read).await?;
            let files = tx.files_for_nodes(&[by_title["a1"].clone()]).await?;
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].checksum, "abc");
            assert_ne!(files[0].id, "file-a1");

            let copied_items = tx.assessment_items_for_nodes(&[by_title["a3"].clone()]).await?;
            assert_eq!(copied_items.len(), 1);
            assert_ne!(copied_items[0].id, items[0].id);
            let item_files = tx.files_for_assessment_items(&[copied_items[0].id]).await?;
            assert_eq!(item_files.len(), 1);
            assert_eq!(item_files[0].checksum, "img");

            let links = tx.node_tags_for_nodes(&[by_title["a3"].clone()]).await?;
            assert_eq!(links.len(), 1);
            let shared = tx.shared_tags_by_names(&["arithmetic".to_string()]).await?;
            assert_eq!(shared.len(), 1, "shared tag must be reused across copies");
            assert_eq!(links[0].tag_id, shared[0].id);
            tx.commit().await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_emits_one_event_after_commit() -> Result<()> {
        let f = fixture().await?;
        let mut rx = f.service.subscribe_to_events();

        let copies = f
            .service
            .copy_subtree(&TreeContext::new(), CopyRequest::new(&f.ids["A"]).with_batch_size(1))
            .await?;

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("Event should be emitted within 1 second")
            .expect("Should receive event");
        match event {
            DomainEvent::SubtreeCopied {
                source_id,
                root_id,
                node_count,
            } => {
                assert_eq!(source_id, f.ids["A"]);
                assert_eq!(root_id, copies[0].id);
                assert_eq!(node_count, 4);
            }
            other => panic!("Expected SubtreeCopied event, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        Ok(())
    }
}
