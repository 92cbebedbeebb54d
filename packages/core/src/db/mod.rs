//! Database Layer
//!
//! This module handles all persistence for the tree engine:
//!
//! - [`TreeStore`] / [`TreeTransaction`]: the transactional seam services use
//! - [`TursoStore`]: libsql/Turso embedded database backend
//! - [`MemoryStore`]: process-local backend with fault injection
//! - [`DomainEvent`]: notifications emitted after committed changes
//!
//! # Architecture
//!
//! Services only ever hold an `Arc<dyn TreeStore>`. Every structural mutation
//! happens inside one transaction that first locks the affected trees, so the
//! nested-set coordinates of a tree are never written by two transactions at
//! once.

mod database;
mod error;
pub mod events;
mod memory_store;
mod tree_store;
mod turso_store;

pub use database::{DatabaseService, DEFAULT_BUSY_TIMEOUT_MS};
pub use error::DatabaseError;
pub use events::DomainEvent;
pub use memory_store::{InjectedFault, MemoryStore, MemoryTransaction};
pub use tree_store::{TransactionMode, TreeStore, TreeTransaction};
pub use turso_store::{TursoStore, TursoTransaction};
