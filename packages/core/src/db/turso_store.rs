//! TursoStore - TreeStore Implementation for the libsql Backend
//!
//! Each [`TursoTransaction`] owns one connection and one SQLite transaction:
//!
//! - `TransactionMode::Write` opens with `BEGIN IMMEDIATE`, reserving the
//!   single SQLite writer up front so lock waits surface at `begin` (as a
//!   busy/deadlock error) instead of half-way through a mutation
//! - `lock_tree` reads the tree's coordinate columns, the SQLite analogue of a
//!   row-locking select over the tree
//! - an un-committed transaction is rolled back by SQLite when its connection
//!   is dropped
//!
//! # Examples
//!
//! ```rust,no_run
//! use channeltree_core::db::{DatabaseService, TransactionMode, TreeStore, TursoStore};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let db = Arc::new(DatabaseService::new(PathBuf::from("./data/trees.db")).await?);
//!     let store = TursoStore::new(db);
//!
//!     let mut tx = store.begin(TransactionMode::Read).await?;
//!     let trees = tx.list_tree_ids().await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use crate::db::{DatabaseError, DatabaseService, TransactionMode, TreeStore, TreeTransaction};
use crate::models::{
    AssessmentItem, Channel, ContentKind, ContentTag, FileRecord, NewAssessmentItem,
    NewContentTag, Node, NodeCoordinates, NodeTag, PrerequisiteLink, TreeId,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::params::Params;
use libsql::{Row, Value as SqlValue};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

const NODE_COLUMNS: &str = "id, node_id, parent_id, tree_id, lft, rght, level, kind, content_id, \
     title, description, language_id, license_id, license_description, thumbnail_encoding, \
     extra_fields, copyright_holder, author, provider, aggregator, role_visibility, \
     cloned_source_id, source_channel_id, source_node_id, original_channel_id, \
     original_source_node_id, freeze_authoring_data, changed, published, created_at, modified_at";

const FILE_COLUMNS: &str = "id, contentnode_id, assessment_item_id, checksum, file_format, \
     preset, file_size, original_filename";

const ITEM_COLUMNS: &str =
    "id, contentnode_id, assessment_id, item_type, question, answers, hints, sort_order, raw_data";

/// TreeStore backed by a libsql database file.
#[derive(Debug, Clone)]
pub struct TursoStore {
    db: Arc<DatabaseService>,
}

impl TursoStore {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    /// Open (or create) a database file and wrap it.
    pub async fn open(path: PathBuf, busy_timeout_ms: u64) -> Result<Self, DatabaseError> {
        let db = DatabaseService::with_busy_timeout(path, busy_timeout_ms).await?;
        Ok(Self::new(Arc::new(db)))
    }

    pub fn database(&self) -> &Arc<DatabaseService> {
        &self.db
    }
}

#[async_trait]
impl TreeStore for TursoStore {
    async fn begin(&self, mode: TransactionMode) -> Result<Box<dyn TreeTransaction>, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        let statement = match mode {
            TransactionMode::Read => "BEGIN DEFERRED",
            TransactionMode::Write => "BEGIN IMMEDIATE",
        };
        conn.execute(statement, ())
            .await
            .map_err(|e| DatabaseError::from_libsql("Failed to begin transaction", e))?;

        Ok(Box::new(TursoTransaction {
            conn,
            locked: HashSet::new(),
            active: true,
        }))
    }
}

/// One libsql connection inside an open transaction.
pub struct TursoTransaction {
    conn: libsql::Connection,
    locked: HashSet<TreeId>,
    active: bool,
}

fn text(value: &str) -> SqlValue {
    SqlValue::Text(value.to_string())
}

fn opt_text(value: Option<&str>) -> SqlValue {
    value.map_or(SqlValue::Null, text)
}

fn flag(value: bool) -> SqlValue {
    SqlValue::Integer(i64::from(value))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Parse a timestamp written either by SQLite (`YYYY-MM-DD HH:MM:SS`) or by
/// this module (RFC3339).
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    Err(anyhow::anyhow!(
        "Unable to parse timestamp '{}' as SQLite or RFC3339 format",
        s
    ))
}

/// Convert a `content_nodes` row selected with [`NODE_COLUMNS`].
fn row_to_node(row: &Row) -> Result<Node> {
    let kind: String = row.get(7).context("Failed to get kind")?;
    let thumbnail: Option<String> = row.get(14).context("Failed to get thumbnail_encoding")?;
    let extra_fields: String = row.get(15).context("Failed to get extra_fields")?;
    let created_at: String = row.get(29).context("Failed to get created_at")?;
    let modified_at: String = row.get(30).context("Failed to get modified_at")?;

    Ok(Node {
        id: row.get(0).context("Failed to get id")?,
        node_id: row.get(1).context("Failed to get node_id")?,
        parent_id: row.get(2).context("Failed to get parent_id")?,
        tree_id: TreeId(row.get(3).context("Failed to get tree_id")?),
        lft: row.get(4).context("Failed to get lft")?,
        rght: row.get(5).context("Failed to get rght")?,
        level: row.get(6).context("Failed to get level")?,
        kind: kind
            .parse::<ContentKind>()
            .context("Failed to parse kind")?,
        content_id: row.get(8).context("Failed to get content_id")?,
        title: row.get(9).context("Failed to get title")?,
        description: row.get(10).context("Failed to get description")?,
        language_id: row.get(11).context("Failed to get language_id")?,
        license_id: row.get(12).context("Failed to get license_id")?,
        license_description: row.get(13).context("Failed to get license_description")?,
        thumbnail_encoding: thumbnail
            .map(|s| serde_json::from_str::<Value>(&s))
            .transpose()
            .context("Failed to parse thumbnail_encoding JSON")?,
        extra_fields: serde_json::from_str(&extra_fields)
            .context("Failed to parse extra_fields JSON")?,
        copyright_holder: row.get(16).context("Failed to get copyright_holder")?,
        author: row.get(17).context("Failed to get author")?,
        provider: row.get(18).context("Failed to get provider")?,
        aggregator: row.get(19).context("Failed to get aggregator")?,
        role_visibility: row.get(20).context("Failed to get role_visibility")?,
        cloned_source_id: row.get(21).context("Failed to get cloned_source_id")?,
        source_channel_id: row.get(22).context("Failed to get source_channel_id")?,
        source_node_id: row.get(23).context("Failed to get source_node_id")?,
        original_channel_id: row.get(24).context("Failed to get original_channel_id")?,
        original_source_node_id: row
            .get(25)
            .context("Failed to get original_source_node_id")?,
        freeze_authoring_data: row
            .get::<i64>(26)
            .context("Failed to get freeze_authoring_data")?
            != 0,
        changed: row.get::<i64>(27).context("Failed to get changed")? != 0,
        published: row.get::<i64>(28).context("Failed to get published")? != 0,
        created_at: parse_timestamp(&created_at).context("Failed to parse created_at")?,
        modified_at: parse_timestamp(&modified_at).context("Failed to parse modified_at")?,
    })
}

fn row_to_file(row: &Row) -> Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0).context("Failed to get id")?,
        contentnode_id: row.get(1).context("Failed to get contentnode_id")?,
        assessment_item_id: row.get(2).context("Failed to get assessment_item_id")?,
        checksum: row.get(3).context("Failed to get checksum")?,
        file_format: row.get(4).context("Failed to get file_format")?,
        preset: row.get(5).context("Failed to get preset")?,
        file_size: row.get(6).context("Failed to get file_size")?,
        original_filename: row.get(7).context("Failed to get original_filename")?,
    })
}

fn row_to_item(row: &Row) -> Result<AssessmentItem> {
    let answers: String = row.get(5).context("Failed to get answers")?;
    let hints: String = row.get(6).context("Failed to get hints")?;
    Ok(AssessmentItem {
        id: row.get(0).context("Failed to get id")?,
        contentnode_id: row.get(1).context("Failed to get contentnode_id")?,
        assessment_id: row.get(2).context("Failed to get assessment_id")?,
        item_type: row.get(3).context("Failed to get item_type")?,
        question: row.get(4).context("Failed to get question")?,
        answers: serde_json::from_str(&answers).context("Failed to parse answers JSON")?,
        hints: serde_json::from_str(&hints).context("Failed to parse hints JSON")?,
        order: row.get(7).context("Failed to get sort_order")?,
        raw_data: row.get(8).context("Failed to get raw_data")?,
    })
}

fn row_to_tag(row: &Row) -> Result<ContentTag> {
    Ok(ContentTag {
        id: row.get(0).context("Failed to get id")?,
        tag_name: row.get(1).context("Failed to get tag_name")?,
        channel_id: row.get(2).context("Failed to get channel_id")?,
    })
}

fn row_to_channel(row: &Row) -> Result<Channel> {
    Ok(Channel {
        id: row.get(0).context("Failed to get id")?,
        name: row.get(1).context("Failed to get name")?,
        root_node_id: row.get(2).context("Failed to get root_node_id")?,
        tree_id: TreeId(row.get(3).context("Failed to get tree_id")?),
    })
}

fn node_values(node: &Node) -> Result<Vec<SqlValue>, DatabaseError> {
    let thumbnail = node
        .thumbnail_encoding
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    Ok(vec![
        text(&node.id),
        text(&node.node_id),
        opt_text(node.parent_id.as_deref()),
        SqlValue::Integer(node.tree_id.0),
        SqlValue::Integer(node.lft),
        SqlValue::Integer(node.rght),
        SqlValue::Integer(node.level),
        text(node.kind.as_str()),
        text(&node.content_id),
        text(&node.title),
        text(&node.description),
        opt_text(node.language_id.as_deref()),
        opt_text(node.license_id.as_deref()),
        opt_text(node.license_description.as_deref()),
        opt_text(thumbnail.as_deref()),
        SqlValue::Text(serde_json::to_string(&node.extra_fields)?),
        opt_text(node.copyright_holder.as_deref()),
        text(&node.author),
        text(&node.provider),
        text(&node.aggregator),
        text(&node.role_visibility),
        opt_text(node.cloned_source_id.as_deref()),
        opt_text(node.source_channel_id.as_deref()),
        opt_text(node.source_node_id.as_deref()),
        opt_text(node.original_channel_id.as_deref()),
        opt_text(node.original_source_node_id.as_deref()),
        flag(node.freeze_authoring_data),
        flag(node.changed),
        flag(node.published),
        SqlValue::Text(node.created_at.to_rfc3339()),
        SqlValue::Text(node.modified_at.to_rfc3339()),
    ])
}

impl TursoTransaction {
    fn ensure_active(&self) -> Result<(), DatabaseError> {
        if self.active {
            Ok(())
        } else {
            Err(DatabaseError::TransactionClosed)
        }
    }

    async fn execute(&self, context: &str, sql: &str, values: Vec<SqlValue>) -> Result<u64, DatabaseError> {
        self.ensure_active()?;
        self.conn
            .execute(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::from_libsql(context, e))
    }

    async fn query_rows<T, F>(
        &self,
        context: &str,
        sql: &str,
        values: Vec<SqlValue>,
        convert: F,
    ) -> Result<Vec<T>, DatabaseError>
    where
        F: Fn(&Row) -> Result<T> + Send,
        T: Send,
    {
        self.ensure_active()?;
        let mut rows = self
            .conn
            .query(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::from_libsql(context, e))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql(context, e))?
        {
            out.push(
                convert(&row)
                    .map_err(|e| DatabaseError::row_conversion(format!("{}: {:#}", context, e)))?,
            );
        }
        Ok(out)
    }

    async fn query_nodes(
        &self,
        context: &str,
        filter: &str,
        values: Vec<SqlValue>,
    ) -> Result<Vec<Node>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM content_nodes WHERE {} ORDER BY tree_id, lft",
            NODE_COLUMNS, filter
        );
        self.query_rows(context, &sql, values, row_to_node).await
    }
}

#[async_trait]
impl TreeTransaction for TursoTransaction {
    async fn lock_tree(&mut self, tree_id: TreeId) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        if self.locked.contains(&tree_id) {
            return Ok(());
        }
        let rows = self
            .query_rows(
                &format!("Failed to lock tree {}", tree_id),
                "SELECT tree_id, lft, rght, level, parent_id FROM content_nodes WHERE tree_id = ?",
                vec![SqlValue::Integer(tree_id.0)],
                |_| Ok(()),
            )
            .await?;
        tracing::trace!("Locked tree {} ({} rows)", tree_id, rows.len());
        self.locked.insert(tree_id);
        Ok(())
    }

    async fn issue_tree_id(&mut self) -> Result<TreeId, DatabaseError> {
        self.execute(
            "Failed to issue tree id",
            "INSERT INTO tree_ids DEFAULT VALUES",
            Vec::new(),
        )
        .await?;
        Ok(TreeId(self.conn.last_insert_rowid()))
    }

    async fn list_tree_ids(&mut self) -> Result<Vec<TreeId>, DatabaseError> {
        self.query_rows(
            "Failed to list tree ids",
            "SELECT DISTINCT tree_id FROM content_nodes ORDER BY tree_id",
            Vec::new(),
            |row| Ok(TreeId(row.get(0).context("Failed to get tree_id")?)),
        )
        .await
    }

    async fn get_node(&mut self, id: &str) -> Result<Option<Node>, DatabaseError> {
        let mut nodes = self
            .query_nodes(
                &format!("Failed to get node {}", id),
                "id = ?",
                vec![text(id)],
            )
            .await?;
        Ok(nodes.pop())
    }

    async fn get_nodes(&mut self, ids: &[String]) -> Result<Vec<Node>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.query_nodes(
            "Failed to get nodes",
            &format!("id IN ({})", placeholders(ids.len())),
            ids.iter().map(|id| text(id)).collect(),
        )
        .await
    }

    async fn get_children(&mut self, parent_id: &str) -> Result<Vec<Node>, DatabaseError> {
        self.query_nodes(
            &format!("Failed to get children of {}", parent_id),
            "parent_id = ?",
            vec![text(parent_id)],
        )
        .await
    }

    async fn get_range(
        &mut self,
        tree_id: TreeId,
        lft: i64,
        rght: i64,
    ) -> Result<Vec<Node>, DatabaseError> {
        self.query_nodes(
            &format!("Failed to read range [{}, {}] of tree {}", lft, rght, tree_id),
            "tree_id = ? AND lft BETWEEN ? AND ?",
            vec![
                SqlValue::Integer(tree_id.0),
                SqlValue::Integer(lft),
                SqlValue::Integer(rght),
            ],
        )
        .await
    }

    async fn get_tree(&mut self, tree_id: TreeId) -> Result<Vec<Node>, DatabaseError> {
        self.query_nodes(
            &format!("Failed to read tree {}", tree_id),
            "tree_id = ?",
            vec![SqlValue::Integer(tree_id.0)],
        )
        .await
    }

    async fn refresh_coordinates(
        &mut self,
        ids: &[String],
    ) -> Result<HashMap<String, NodeCoordinates>, DatabaseError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT id, tree_id, lft, rght, level, parent_id FROM content_nodes WHERE id IN ({})",
            placeholders(ids.len())
        );
        let rows = self
            .query_rows(
                "Failed to refresh coordinates",
                &sql,
                ids.iter().map(|id| text(id)).collect(),
                |row| {
                    let id: String = row.get(0).context("Failed to get id")?;
                    Ok((
                        id,
                        NodeCoordinates {
                            tree_id: TreeId(row.get(1).context("Failed to get tree_id")?),
                            lft: row.get(2).context("Failed to get lft")?,
                            rght: row.get(3).context("Failed to get rght")?,
                            level: row.get(4).context("Failed to get level")?,
                            parent_id: row.get(5).context("Failed to get parent_id")?,
                        },
                    ))
                },
            )
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn insert_nodes(&mut self, nodes: &[Node]) -> Result<(), DatabaseError> {
        let sql = format!(
            "INSERT INTO content_nodes ({}) VALUES ({})",
            NODE_COLUMNS,
            placeholders(31)
        );
        for node in nodes {
            self.execute(
                &format!("Failed to insert node {}", node.id),
                &sql,
                node_values(node)?,
            )
            .await?;
        }
        Ok(())
    }

    async fn save_node(&mut self, node: &Node) -> Result<(), DatabaseError> {
        let thumbnail = node
            .thumbnail_encoding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let updated = self
            .execute(
                &format!("Failed to save node {}", node.id),
                "UPDATE content_nodes SET
                    node_id = ?, kind = ?, content_id = ?, title = ?, description = ?,
                    language_id = ?, license_id = ?, license_description = ?,
                    thumbnail_encoding = ?, extra_fields = ?, copyright_holder = ?,
                    author = ?, provider = ?, aggregator = ?, role_visibility = ?,
                    cloned_source_id = ?, source_channel_id = ?, source_node_id = ?,
                    original_channel_id = ?, original_source_node_id = ?,
                    freeze_authoring_data = ?, changed = ?, published = ?, modified_at = ?
                 WHERE id = ?",
                vec![
                    text(&node.node_id),
                    text(node.kind.as_str()),
                    text(&node.content_id),
                    text(&node.title),
                    text(&node.description),
                    opt_text(node.language_id.as_deref()),
                    opt_text(node.license_id.as_deref()),
                    opt_text(node.license_description.as_deref()),
                    opt_text(thumbnail.as_deref()),
                    SqlValue::Text(serde_json::to_string(&node.extra_fields)?),
                    opt_text(node.copyright_holder.as_deref()),
                    text(&node.author),
                    text(&node.provider),
                    text(&node.aggregator),
                    text(&node.role_visibility),
                    opt_text(node.cloned_source_id.as_deref()),
                    opt_text(node.source_channel_id.as_deref()),
                    opt_text(node.source_node_id.as_deref()),
                    opt_text(node.original_channel_id.as_deref()),
                    opt_text(node.original_source_node_id.as_deref()),
                    flag(node.freeze_authoring_data),
                    flag(node.changed),
                    flag(node.published),
                    SqlValue::Text(Utc::now().to_rfc3339()),
                    text(&node.id),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::sql_execution(format!(
                "Node {} does not exist",
                node.id
            )));
        }
        Ok(())
    }

    async fn shift_coordinates(
        &mut self,
        tree_id: TreeId,
        after: i64,
        delta: i64,
    ) -> Result<u64, DatabaseError> {
        self.execute(
            &format!("Failed to shift coordinates of tree {}", tree_id),
            "UPDATE content_nodes SET
                lft = CASE WHEN lft > ?1 THEN lft + ?2 ELSE lft END,
                rght = CASE WHEN rght > ?1 THEN rght + ?2 ELSE rght END
             WHERE tree_id = ?3 AND (lft > ?1 OR rght > ?1)",
            vec![
                SqlValue::Integer(after),
                SqlValue::Integer(delta),
                SqlValue::Integer(tree_id.0),
            ],
        )
        .await
    }

    async fn relocate_range(
        &mut self,
        tree_id: TreeId,
        lft: i64,
        rght: i64,
        new_tree_id: TreeId,
        offset: i64,
        level_delta: i64,
    ) -> Result<u64, DatabaseError> {
        self.execute(
            &format!("Failed to relocate [{}, {}] of tree {}", lft, rght, tree_id),
            "UPDATE content_nodes SET
                tree_id = ?1, lft = lft + ?2, rght = rght + ?2, level = level + ?3
             WHERE tree_id = ?4 AND lft BETWEEN ?5 AND ?6",
            vec![
                SqlValue::Integer(new_tree_id.0),
                SqlValue::Integer(offset),
                SqlValue::Integer(level_delta),
                SqlValue::Integer(tree_id.0),
                SqlValue::Integer(lft),
                SqlValue::Integer(rght),
            ],
        )
        .await
    }

    async fn set_parent(&mut self, id: &str, parent_id: Option<&str>) -> Result<(), DatabaseError> {
        self.execute(
            &format!("Failed to set parent of {}", id),
            "UPDATE content_nodes SET parent_id = ? WHERE id = ?",
            vec![opt_text(parent_id), text(id)],
        )
        .await?;
        Ok(())
    }

    async fn update_coordinates(
        &mut self,
        coordinates: &[(String, NodeCoordinates)],
    ) -> Result<(), DatabaseError> {
        for (id, coords) in coordinates {
            self.execute(
                &format!("Failed to update coordinates of {}", id),
                "UPDATE content_nodes SET tree_id = ?, lft = ?, rght = ?, level = ?, parent_id = ?
                 WHERE id = ?",
                vec![
                    SqlValue::Integer(coords.tree_id.0),
                    SqlValue::Integer(coords.lft),
                    SqlValue::Integer(coords.rght),
                    SqlValue::Integer(coords.level),
                    opt_text(coords.parent_id.as_deref()),
                    text(id),
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn mark_changed(&mut self, id: &str) -> Result<(), DatabaseError> {
        self.execute(
            &format!("Failed to mark {} changed", id),
            "UPDATE content_nodes SET changed = 1, modified_at = ? WHERE id = ?",
            vec![SqlValue::Text(Utc::now().to_rfc3339()), text(id)],
        )
        .await?;
        Ok(())
    }

    async fn insert_channel(&mut self, channel: &Channel) -> Result<(), DatabaseError> {
        self.execute(
            &format!("Failed to insert channel {}", channel.id),
            "INSERT INTO channels (id, name, root_node_id, tree_id) VALUES (?, ?, ?, ?)",
            vec![
                text(&channel.id),
                text(&channel.name),
                text(&channel.root_node_id),
                SqlValue::Integer(channel.tree_id.0),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_channel(&mut self, id: &str) -> Result<Option<Channel>, DatabaseError> {
        let mut channels = self
            .query_rows(
                &format!("Failed to get channel {}", id),
                "SELECT id, name, root_node_id, tree_id FROM channels WHERE id = ?",
                vec![text(id)],
                row_to_channel,
            )
            .await?;
        Ok(channels.pop())
    }

    async fn channel_for_tree(
        &mut self,
        tree_id: TreeId,
    ) -> Result<Option<Channel>, DatabaseError> {
        let mut channels = self
            .query_rows(
                &format!("Failed to find channel of tree {}", tree_id),
                "SELECT id, name, root_node_id, tree_id FROM channels WHERE tree_id = ? LIMIT 1",
                vec![SqlValue::Integer(tree_id.0)],
                row_to_channel,
            )
            .await?;
        Ok(channels.pop())
    }

    async fn files_for_nodes(
        &mut self,
        node_ids: &[String],
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM files WHERE contentnode_id IN ({})",
            FILE_COLUMNS,
            placeholders(node_ids.len())
        );
        self.query_rows(
            "Failed to read node files",
            &sql,
            node_ids.iter().map(|id| text(id)).collect(),
            row_to_file,
        )
        .await
    }

    async fn files_for_assessment_items(
        &mut self,
        item_ids: &[i64],
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM files WHERE assessment_item_id IN ({})",
            FILE_COLUMNS,
            placeholders(item_ids.len())
        );
        self.query_rows(
            "Failed to read assessment item files",
            &sql,
            item_ids.iter().map(|id| SqlValue::Integer(*id)).collect(),
            row_to_file,
        )
        .await
    }

    async fn insert_files(&mut self, files: &[FileRecord]) -> Result<(), DatabaseError> {
        let sql = format!(
            "INSERT INTO files ({}) VALUES ({})",
            FILE_COLUMNS,
            placeholders(8)
        );
        for file in files {
            self.execute(
                &format!("Failed to insert file {}", file.id),
                &sql,
                vec![
                    text(&file.id),
                    opt_text(file.contentnode_id.as_deref()),
                    file.assessment_item_id
                        .map_or(SqlValue::Null, SqlValue::Integer),
                    text(&file.checksum),
                    text(&file.file_format),
                    text(&file.preset),
                    SqlValue::Integer(file.file_size),
                    text(&file.original_filename),
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn assessment_items_for_nodes(
        &mut self,
        node_ids: &[String],
    ) -> Result<Vec<AssessmentItem>, DatabaseError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM assessment_items WHERE contentnode_id IN ({}) ORDER BY id",
            ITEM_COLUMNS,
            placeholders(node_ids.len())
        );
        self.query_rows(
            "Failed to read assessment items",
            &sql,
            node_ids.iter().map(|id| text(id)).collect(),
            row_to_item,
        )
        .await
    }

    async fn insert_assessment_items(
        &mut self,
        items: &[NewAssessmentItem],
    ) -> Result<Vec<AssessmentItem>, DatabaseError> {
        let mut inserted = Vec::with_capacity(items.len());
        for item in items {
            self.execute(
                &format!(
                    "Failed to insert assessment item {} of {}",
                    item.assessment_id, item.contentnode_id
                ),
                "INSERT INTO assessment_items
                    (contentnode_id, assessment_id, item_type, question, answers, hints, sort_order, raw_data)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                vec![
                    text(&item.contentnode_id),
                    text(&item.assessment_id),
                    text(&item.item_type),
                    text(&item.question),
                    SqlValue::Text(serde_json::to_string(&item.answers)?),
                    SqlValue::Text(serde_json::to_string(&item.hints)?),
                    SqlValue::Integer(item.order),
                    text(&item.raw_data),
                ],
            )
            .await?;
            inserted.push(AssessmentItem {
                id: self.conn.last_insert_rowid(),
                contentnode_id: item.contentnode_id.clone(),
                assessment_id: item.assessment_id.clone(),
                item_type: item.item_type.clone(),
                question: item.question.clone(),
                answers: item.answers.clone(),
                hints: item.hints.clone(),
                order: item.order,
                raw_data: item.raw_data.clone(),
            });
        }
        Ok(inserted)
    }

    async fn node_tags_for_nodes(
        &mut self,
        node_ids: &[String],
    ) -> Result<Vec<NodeTag>, DatabaseError> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT node_id, tag_id FROM node_tags WHERE node_id IN ({})",
            placeholders(node_ids.len())
        );
        self.query_rows(
            "Failed to read node tags",
            &sql,
            node_ids.iter().map(|id| text(id)).collect(),
            |row| {
                Ok(NodeTag {
                    node_id: row.get(0).context("Failed to get node_id")?,
                    tag_id: row.get(1).context("Failed to get tag_id")?,
                })
            },
        )
        .await
    }

    async fn tags_by_ids(&mut self, ids: &[i64]) -> Result<Vec<ContentTag>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, tag_name, channel_id FROM content_tags WHERE id IN ({})",
            placeholders(ids.len())
        );
        self.query_rows(
            "Failed to read tags",
            &sql,
            ids.iter().map(|id| SqlValue::Integer(*id)).collect(),
            row_to_tag,
        )
        .await
    }

    async fn shared_tags_by_names(
        &mut self,
        names: &[String],
    ) -> Result<Vec<ContentTag>, DatabaseError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, tag_name, channel_id FROM content_tags
             WHERE channel_id IS NULL AND tag_name IN ({}) ORDER BY id",
            placeholders(names.len())
        );
        self.query_rows(
            "Failed to read shared tags",
            &sql,
            names.iter().map(|n| text(n)).collect(),
            row_to_tag,
        )
        .await
    }

    async fn insert_tags(
        &mut self,
        tags: &[NewContentTag],
    ) -> Result<Vec<ContentTag>, DatabaseError> {
        let mut inserted = Vec::with_capacity(tags.len());
        for tag in tags {
            self.execute(
                &format!("Failed to insert tag {}", tag.tag_name),
                "INSERT INTO content_tags (tag_name, channel_id) VALUES (?, ?)",
                vec![text(&tag.tag_name), opt_text(tag.channel_id.as_deref())],
            )
            .await?;
            inserted.push(ContentTag {
                id: self.conn.last_insert_rowid(),
                tag_name: tag.tag_name.clone(),
                channel_id: tag.channel_id.clone(),
            });
        }
        Ok(inserted)
    }

    async fn insert_node_tags(&mut self, links: &[NodeTag]) -> Result<(), DatabaseError> {
        for link in links {
            self.execute(
                &format!("Failed to tag node {}", link.node_id),
                "INSERT OR IGNORE INTO node_tags (node_id, tag_id) VALUES (?, ?)",
                vec![text(&link.node_id), SqlValue::Integer(link.tag_id)],
            )
            .await?;
        }
        Ok(())
    }

    async fn insert_prerequisite(&mut self, link: &PrerequisiteLink) -> Result<(), DatabaseError> {
        self.execute(
            "Failed to insert prerequisite",
            "INSERT OR IGNORE INTO prerequisites (prerequisite_id, target_node_id) VALUES (?, ?)",
            vec![text(&link.prerequisite_id), text(&link.target_node_id)],
        )
        .await?;
        Ok(())
    }

    async fn prerequisites_for(
        &mut self,
        node_id: &str,
    ) -> Result<Vec<PrerequisiteLink>, DatabaseError> {
        self.query_rows(
            &format!("Failed to read prerequisites of {}", node_id),
            "SELECT prerequisite_id, target_node_id FROM prerequisites
             WHERE prerequisite_id = ?1 OR target_node_id = ?1",
            vec![text(node_id)],
            |row| {
                Ok(PrerequisiteLink {
                    prerequisite_id: row.get(0).context("Failed to get prerequisite_id")?,
                    target_node_id: row.get(1).context("Failed to get target_node_id")?,
                })
            },
        )
        .await
    }

    async fn delete_prerequisites_for(&mut self, node_id: &str) -> Result<u64, DatabaseError> {
        self.execute(
            &format!("Failed to delete prerequisites of {}", node_id),
            "DELETE FROM prerequisites WHERE prerequisite_id = ?1 OR target_node_id = ?1",
            vec![text(node_id)],
        )
        .await
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        self.conn
            .execute("COMMIT", ())
            .await
            .map_err(|e| DatabaseError::from_libsql("Failed to commit transaction", e))?;
        self.active = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        self.active = false;
        self.conn
            .execute("ROLLBACK", ())
            .await
            .map_err(|e| DatabaseError::from_libsql("Failed to roll back transaction", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_formats() {
        let sqlite = parse_timestamp("2025-01-03 10:20:30").unwrap();
        let rfc = parse_timestamp("2025-01-03T10:20:30Z").unwrap();
        assert_eq!(sqlite, rfc);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3), "?, ?, ?");
        assert_eq!(placeholders(1), "?");
    }
}
