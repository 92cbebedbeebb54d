//! libsql store tests
//!
//! Runs the tree service against a real database file: channel creation,
//! inserts, copies with dependent records, moves, rebuilds and rollback.

#[cfg(test)]
mod libsql_store_tests {
    use anyhow::Result;
    use channeltree_core::db::{TransactionMode, TreeStore, TursoStore};
    use channeltree_core::models::{
        ContentKind, FileRecord, NewAssessmentItem, NewContentTag, Node, NodePatch, NodeTag,
        Position, PrerequisiteLink, TreeId,
    };
    use channeltree_core::services::{CopyRequest, SaveMode, TreeContext, TreeService};
    use channeltree_core::TreeEngineConfig;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_test_service() -> Result<(TreeService, TursoStore, TempDir)> {
        let temp_dir = TempDir::new()?;
        let store = TursoStore::open(temp_dir.path().join("test.db"), 5000).await?;
        let service = TreeService::new(Arc::new(store.clone()), TreeEngineConfig::default());
        Ok((service, store, temp_dir))
    }

    /// R -> [A -> [a1, a2], B]; returns ids by title.
    async fn seed(service: &TreeService) -> Result<HashMap<&'static str, String>> {
        let ctx = TreeContext::new();
        let channel = service.create_channel(&ctx, "R").await?;
        let mut ids = HashMap::from([("R", channel.root_node_id.clone())]);
        for (title, kind, parent) in [
            ("A", ContentKind::Topic, "R"),
            ("a1", ContentKind::Video, "A"),
            ("a2", ContentKind::Exercise, "A"),
            ("B", ContentKind::Document, "R"),
        ] {
            let node = service
                .create_node(&ctx, Node::new(kind, title), Some(&ids[parent]), Position::LastChild)
                .await?;
            ids.insert(title, node.id);
        }
        Ok(ids)
    }

    #[tokio::test]
    async fn test_nodes_round_trip_through_libsql() -> Result<()> {
        let (service, _store, _temp) = create_test_service().await?;
        let ids = seed(&service).await?;

        let a2 = service.get_node(&ids["a2"]).await?.unwrap();
        assert_eq!(a2.kind, ContentKind::Exercise);
        assert_eq!((a2.lft, a2.rght, a2.level), (5, 6, 2));
        assert_eq!(a2.parent_id.as_deref(), Some(ids["A"].as_str()));

        let mut edited = a2.clone();
        NodePatch::new()
            .with_description("Two questions")
            .with_extra_fields(json!({"mastery_model": "do_all"}))
            .apply(&mut edited);
        service
            .save_node(&TreeContext::new(), &edited, SaveMode::Locked)
            .await?;

        let stored = service.get_node(&ids["a2"]).await?.unwrap();
        assert_eq!(stored.description, "Two questions");
        assert_eq!(stored.extra_fields["mastery_model"], "do_all");
        assert_eq!(stored.coordinates(), a2.coordinates());

        let tree_id = stored.tree_id;
        assert_eq!(service.list_tree_ids().await?, vec![tree_id]);
        assert_eq!(service.validate_tree(tree_id).await?, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_with_dependents_on_libsql() -> Result<()> {
        let (service, store, _temp) = create_test_service().await?;
        let ids = seed(&service).await?;

        let mut tx = store.begin(TransactionMode::Write).await?;
        tx.insert_files(&[FileRecord {
            id: "f-a1".into(),
            contentnode_id: Some(ids["a1"].clone()),
            assessment_item_id: None,
            checksum: "c0ffee".into(),
            file_format: "mp4".into(),
            preset: "high_res_video".into(),
            file_size: 1024,
            original_filename: "a1.mp4".into(),
        }])
        .await?;
        let items = tx
            .insert_assessment_items(&[
                NewAssessmentItem {
                    contentnode_id: ids["a2"].clone(),
                    assessment_id: "q1".into(),
                    item_type: "single_selection".into(),
                    question: "Pick one".into(),
                    answers: json!([{"answer": "yes", "correct": true}]),
                    hints: json!([]),
                    order: 0,
                    raw_data: String::new(),
                },
                NewAssessmentItem {
                    contentnode_id: ids["a2"].clone(),
                    assessment_id: "q2".into(),
                    item_type: "input_question".into(),
                    question: "Type it".into(),
                    answers: json!([]),
                    hints: json!(["think"]),
                    order: 1,
                    raw_data: String::new(),
                },
            ])
            .await?;
        tx.insert_files(&[FileRecord {
            id: "f-q2".into(),
            contentnode_id: None,
            assessment_item_id: Some(items[1].id),
            checksum: "beef".into(),
            file_format: "svg".into(),
            preset: "exercise_image".into(),
            file_size: 12,
            original_filename: "q2.svg".into(),
        }])
        .await?;
        let tags = tx
            .insert_tags(&[NewContentTag {
                tag_name: "practice".into(),
                channel_id: None,
            }])
            .await?;
        tx.insert_node_tags(&[NodeTag {
            node_id: ids["a2"].clone(),
            tag_id: tags[0].id,
        }])
        .await?;
        tx.commit().await?;

        for batch_size in [100, 1] {
            let outcome = service
                .copy_with_outcome(
                    &TreeContext::new(),
                    CopyRequest::new(&ids["A"])
                        .to(&ids["B"], Position::Left)
                        .with_batch_size(batch_size),
                )
                .await?;
            assert_eq!(outcome.copied, 3);
            let copies = service.get_descendants(&outcome.nodes[0].id, true).await?;
            let a2_copy = copies.iter().find(|n| n.title == "a2").unwrap();

            let mut tx = store.begin(TransactionMode::Read).await?;
            let copied_items = tx.assessment_items_for_nodes(&[a2_copy.id.clone()]).await?;
            assert_eq!(copied_items.len(), 2);
            let q2 = copied_items.iter().find(|i| i.assessment_id == "q2").unwrap();
            assert_eq!(q2.hints, json!(["think"]));
            let q2_files = tx.files_for_assessment_items(&[q2.id]).await?;
            assert_eq!(q2_files.len(), 1);
            assert_eq!(q2_files[0].checksum, "beef");

            let links = tx.node_tags_for_nodes(&[a2_copy.id.clone()]).await?;
            assert_eq!(links, vec![NodeTag { node_id: a2_copy.id.clone(), tag_id: tags[0].id }]);
            tx.commit().await?;
        }

        let tree_id = service.get_node(&ids["R"]).await?.unwrap().tree_id;
        // 5 originals + 2 copies of 3
        assert_eq!(service.validate_tree(tree_id).await?, 11);
        Ok(())
    }

    #[tokio::test]
    async fn test_moves_and_rebuild_on_libsql() -> Result<()> {
        let (service, store, _temp) = create_test_service().await?;
        let ids = seed(&service).await?;
        let ctx = TreeContext::new();
        let other = service.create_channel(&ctx, "S").await?;

        let mut tx = store.begin(TransactionMode::Write).await?;
        tx.insert_prerequisite(&PrerequisiteLink {
            prerequisite_id: ids["a1"].clone(),
            target_node_id: ids["a2"].clone(),
        })
        .await?;
        tx.commit().await?;

        let a1 = service.get_node(&ids["a1"]).await?.unwrap();
        service
            .move_node(&ctx, &a1, Some(&ids["B"]), Position::Left)
            .await?;
        let a2 = service.get_node(&ids["a2"]).await?.unwrap();
        let moved = service
            .move_node(&ctx, &a2, Some(&other.root_node_id), Position::FirstChild)
            .await?;
        assert_eq!(moved.tree_id, other.tree_id);

        let first_tree = service.get_node(&ids["R"]).await?.unwrap().tree_id;
        let mut tx = store.begin(TransactionMode::Read).await?;
        assert!(tx.prerequisites_for(&ids["a1"]).await?.is_empty());
        let first = tx.get_tree(first_tree).await?;
        tx.commit().await?;
        let titles: Vec<_> = first.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["R", "A", "a1", "B"]);

        for tree_id in service.list_tree_ids().await? {
            assert_eq!(
                service.rebuild_tree(&ctx, tree_id).await?,
                service.validate_tree(tree_id).await?
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_database_untouched() -> Result<()> {
        let (service, store, _temp) = create_test_service().await?;
        let ids = seed(&service).await?;
        let tree_id = service.get_node(&ids["R"]).await?.unwrap().tree_id;

        let result = service
            .copy_subtree(
                &TreeContext::new(),
                CopyRequest::new(&ids["A"]).to("missing-target", Position::LastChild),
            )
            .await;
        assert!(result.is_err());

        let mut tx = store.begin(TransactionMode::Read).await?;
        assert_eq!(tx.get_tree(tree_id).await?.len(), 5);
        assert_eq!(tx.list_tree_ids().await?, vec![tree_id]);
        tx.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_tree_ids_are_never_reissued() -> Result<()> {
        let (service, _store, _temp) = create_test_service().await?;
        let ctx = TreeContext::new();

        let first = service.issue_tree_id(&ctx).await?;
        let second = service.issue_tree_id(&ctx).await?;
        assert!(first.is_concrete());
        assert!(second > first);
        assert_ne!(second, TreeId::ALL_TREES);
        Ok(())
    }
}
