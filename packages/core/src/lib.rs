//! ChannelTree Core
//!
//! A concurrency-safe nested-set tree engine for content channels.
//!
//! # Architecture
//!
//! - **Nested sets**: every node carries `(tree_id, lft, rght, level, parent_id)`
//! - **Ordered locking**: structural writes lock whole trees in ascending id order
//! - **Size-adaptive copy**: small subtrees are copied in one transaction,
//!   large ones one node per transaction
//! - **libsql/Turso**: embedded SQLite-compatible storage, with an in-memory
//!   store for tests
//!
//! # Modules
//!
//! - [`models`] - Nodes, coordinates, dependent records
//! - [`db`] - Store traits, libsql and in-memory backends, events
//! - [`services`] - Lock manager, mutator, cloner, copy orchestrator
//! - [`config`] - Engine configuration

pub mod config;
pub mod db;
pub mod models;
pub mod services;

// Re-export commonly used types
pub use config::TreeEngineConfig;
pub use models::*;
pub use services::*;
