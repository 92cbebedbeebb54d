//! Database Connection Management
//!
//! This module provides database connection and schema initialization for the
//! libsql/Turso backend of the tree engine.
//!
//! # Architecture
//!
//! - **Path-agnostic**: Accepts any valid PathBuf
//! - **WAL mode**: Readers never block the single writer
//! - **Foreign keys**: Dependent rows reference their node
//! - **Idempotent schema**: `CREATE ... IF NOT EXISTS` on every open
//!
//! # Database Connection Patterns
//!
//! **Always use `connect_with_timeout()` in async functions.** The busy
//! timeout lets a writer wait for a competing writer instead of failing with
//! `SQLITE_BUSY` straight away; a wait that still times out is reported as a
//! deadlock and retried once by the lock manager.
//!
//! ```no_run
//! # use channeltree_core::db::DatabaseService;
//! # use std::path::PathBuf;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db_service = DatabaseService::new(PathBuf::from("./data/trees.db")).await?;
//! let conn = db_service.connect_with_timeout().await?;
//! # Ok(())
//! # }
//! ```

use crate::db::error::DatabaseError;
use libsql::{Builder, Database};
use std::path::PathBuf;
use std::sync::Arc;

/// Default busy timeout applied to every async connection (milliseconds).
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Table definitions, created in order.
const SCHEMA: &[(&str, &str)] = &[
    (
        "tree_ids",
        "CREATE TABLE IF NOT EXISTS tree_ids (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            issued_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
    ),
    (
        "channels",
        "CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            root_node_id TEXT NOT NULL,
            tree_id INTEGER NOT NULL
        )",
    ),
    (
        "content_nodes",
        "CREATE TABLE IF NOT EXISTS content_nodes (
            id TEXT PRIMARY KEY,
            node_id TEXT NOT NULL,
            parent_id TEXT,
            tree_id INTEGER NOT NULL,
            lft INTEGER NOT NULL,
            rght INTEGER NOT NULL,
            level INTEGER NOT NULL,
            kind TEXT NOT NULL,
            content_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            language_id TEXT,
            license_id TEXT,
            license_description TEXT,
            thumbnail_encoding JSON,
            extra_fields JSON NOT NULL DEFAULT '{}',
            copyright_holder TEXT,
            author TEXT NOT NULL DEFAULT '',
            provider TEXT NOT NULL DEFAULT '',
            aggregator TEXT NOT NULL DEFAULT '',
            role_visibility TEXT NOT NULL DEFAULT 'learner',
            cloned_source_id TEXT,
            source_channel_id TEXT,
            source_node_id TEXT,
            original_channel_id TEXT,
            original_source_node_id TEXT,
            freeze_authoring_data INTEGER NOT NULL DEFAULT 0,
            changed INTEGER NOT NULL DEFAULT 1,
            published INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            modified_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
    ),
    (
        "files",
        "CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            contentnode_id TEXT,
            assessment_item_id INTEGER,
            checksum TEXT NOT NULL,
            file_format TEXT NOT NULL DEFAULT '',
            preset TEXT NOT NULL DEFAULT '',
            file_size INTEGER NOT NULL DEFAULT 0,
            original_filename TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (contentnode_id) REFERENCES content_nodes(id) ON DELETE CASCADE,
            FOREIGN KEY (assessment_item_id) REFERENCES assessment_items(id) ON DELETE CASCADE
        )",
    ),
    (
        "assessment_items",
        "CREATE TABLE IF NOT EXISTS assessment_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            contentnode_id TEXT NOT NULL,
            assessment_id TEXT NOT NULL,
            item_type TEXT NOT NULL,
            question TEXT NOT NULL DEFAULT '',
            answers JSON NOT NULL DEFAULT '[]',
            hints JSON NOT NULL DEFAULT '[]',
            sort_order INTEGER NOT NULL DEFAULT 0,
            raw_data TEXT NOT NULL DEFAULT '',
            UNIQUE (contentnode_id, assessment_id),
            FOREIGN KEY (contentnode_id) REFERENCES content_nodes(id) ON DELETE CASCADE
        )",
    ),
    (
        "content_tags",
        "CREATE TABLE IF NOT EXISTS content_tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tag_name TEXT NOT NULL,
            channel_id TEXT
        )",
    ),
    (
        "node_tags",
        "CREATE TABLE IF NOT EXISTS node_tags (
            node_id TEXT NOT NULL,
            tag_id INTEGER NOT NULL,
            PRIMARY KEY (node_id, tag_id),
            FOREIGN KEY (node_id) REFERENCES content_nodes(id) ON DELETE CASCADE,
            FOREIGN KEY (tag_id) REFERENCES content_tags(id) ON DELETE CASCADE
        )",
    ),
    (
        "prerequisites",
        "CREATE TABLE IF NOT EXISTS prerequisites (
            prerequisite_id TEXT NOT NULL,
            target_node_id TEXT NOT NULL,
            PRIMARY KEY (prerequisite_id, target_node_id),
            FOREIGN KEY (prerequisite_id) REFERENCES content_nodes(id) ON DELETE CASCADE,
            FOREIGN KEY (target_node_id) REFERENCES content_nodes(id) ON DELETE CASCADE
        )",
    ),
];

const INDEXES: &[(&str, &str)] = &[
    (
        "idx_nodes_tree_lft",
        "CREATE INDEX IF NOT EXISTS idx_nodes_tree_lft ON content_nodes(tree_id, lft)",
    ),
    (
        "idx_nodes_parent",
        "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON content_nodes(parent_id)",
    ),
    (
        "idx_files_node",
        "CREATE INDEX IF NOT EXISTS idx_files_node ON files(contentnode_id)",
    ),
    (
        "idx_files_item",
        "CREATE INDEX IF NOT EXISTS idx_files_item ON files(assessment_item_id)",
    ),
    (
        "idx_tags_name",
        "CREATE INDEX IF NOT EXISTS idx_tags_name ON content_tags(tag_name)",
    ),
];

/// Database service for managing the libsql connection and schema
///
/// # Examples
///
/// ```no_run
/// use channeltree_core::db::DatabaseService;
/// use std::path::PathBuf;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let db_service = DatabaseService::new(PathBuf::from("/path/to/trees.db")).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DatabaseService {
    /// libsql database handle (wrapped in Arc for sharing)
    pub db: Arc<Database>,

    /// Path to the database file
    pub db_path: PathBuf,

    /// Busy timeout applied by `connect_with_timeout()`
    pub busy_timeout_ms: u64,
}

impl DatabaseService {
    /// Open (or create) the database at `db_path` with the default busy timeout.
    ///
    /// This will:
    /// 1. Ensure the parent directory exists
    /// 2. Open/create the database file
    /// 3. Enable WAL mode and foreign keys
    /// 4. Create tables and indexes if missing
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the directory cannot be created, the
    /// connection fails, or schema initialization fails.
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        Self::with_busy_timeout(db_path, DEFAULT_BUSY_TIMEOUT_MS).await
    }

    /// Like [`DatabaseService::new`] with an explicit busy timeout.
    pub async fn with_busy_timeout(
        db_path: PathBuf,
        busy_timeout_ms: u64,
    ) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        DatabaseError::permission_denied(db_path.clone())
                    } else {
                        DatabaseError::DirectoryCreationFailed(e)
                    }
                })?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| DatabaseError::connection_failed(db_path.clone(), e))?;

        let service = Self {
            db: Arc::new(db),
            db_path,
            busy_timeout_ms,
        };
        service.initialize_schema().await?;
        tracing::info!("Opened tree database at {}", service.db_path.display());

        Ok(service)
    }

    /// Execute a PRAGMA statement
    ///
    /// PRAGMA statements return rows, so they go through query() rather than
    /// execute().
    pub(crate) async fn execute_pragma(
        &self,
        conn: &libsql::Connection,
        pragma: &str,
    ) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        self.execute_pragma(&conn, "PRAGMA journal_mode = WAL")
            .await?;
        self.execute_pragma(&conn, "PRAGMA foreign_keys = ON")
            .await?;

        for (table, ddl) in SCHEMA {
            conn.execute(ddl, ()).await.map_err(|e| {
                DatabaseError::initialization_failed(format!(
                    "Failed to create {} table: {}",
                    table, e
                ))
            })?;
        }

        for (index, ddl) in INDEXES {
            conn.execute(ddl, ()).await.map_err(|e| {
                DatabaseError::initialization_failed(format!(
                    "Failed to create index '{}': {}",
                    index, e
                ))
            })?;
        }

        Ok(())
    }

    /// Get a raw connection. Prefer `connect_with_timeout()` in async code.
    pub fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        self.db.connect().map_err(DatabaseError::LibsqlError)
    }

    /// Get a connection with busy timeout and foreign keys configured.
    pub async fn connect_with_timeout(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self.connect()?;
        self.execute_pragma(&conn, &format!("PRAGMA busy_timeout = {}", self.busy_timeout_ms))
            .await?;
        self.execute_pragma(&conn, "PRAGMA foreign_keys = ON")
            .await?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn table_names(service: &DatabaseService) -> Vec<String> {
        let conn = service.connect().unwrap();
        let mut rows = conn
            .query("SELECT name FROM sqlite_master WHERE type='table'", ())
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(0).unwrap());
        }
        names
    }

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db_service = DatabaseService::new(db_path.clone()).await.unwrap();

        assert_eq!(db_service.db_path, db_path);
        assert_eq!(db_service.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_schema_initialization() {
        let temp_dir = TempDir::new().unwrap();
        let db_service = DatabaseService::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();

        let names = table_names(&db_service).await;
        for (table, _) in SCHEMA {
            assert!(names.iter().any(|n| n == table), "missing table {}", table);
        }
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let db_service = DatabaseService::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let conn = db_service.connect().unwrap();

        let mut rows = conn.query("PRAGMA journal_mode", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let mode: String = row.get(0).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_parent_directory_creation() {
        let temp_dir = TempDir::new().unwrap();
        let nested_path = temp_dir.path().join("nested").join("dirs").join("test.db");

        let _db_service = DatabaseService::new(nested_path.clone()).await.unwrap();

        assert!(nested_path.exists());
    }

    #[tokio::test]
    async fn test_idempotent_initialization() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let _first = DatabaseService::new(db_path.clone()).await.unwrap();
        let second = DatabaseService::new(db_path).await.unwrap();

        let names = table_names(&second).await;
        assert!(names.iter().any(|n| n == "content_nodes"));
    }
}
