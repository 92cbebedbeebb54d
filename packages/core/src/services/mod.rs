//! Tree Services
//!
//! This module contains the tree engine's business logic:
//!
//! - `TreeLockManager` - Ordered tree locks with a single deadlock retry
//! - `TreeMutator` - Tree ids, space creation, inserts, moves, rebuilds
//! - `cloner` - In-memory copies with rewritten identity and provenance
//! - `CopyOrchestrator` - Deep/shallow subtree copy driven by span
//! - `DependentRecordCopier` - Files, assessment items and tags of copies
//! - `TreeService` - Facade wiring the above together
//!
//! Services coordinate between the store layer and callers; every structural
//! write goes through the lock manager.

pub mod cloner;
mod context;
pub mod copy_service;
pub mod dependents;
pub mod error;
mod progress;
pub mod tree_lock;
pub mod tree_mutator;
pub mod tree_service;

pub use cloner::{clone_fields, ClonedSubtree, CloneOptions, SourceAttributes};
pub use context::TreeContext;
pub use copy_service::{
    CopyOrchestrator, CopyOutcome, CopyRequest, CopyStrategy, DEFAULT_BATCH_SIZE,
};
pub use dependents::{DependentCopyStats, DependentRecordCopier, NodeSelection};
pub use error::TreeServiceError;
pub use progress::{NoopProgress, ProgressReporter, ProgressSnapshot, ProgressTracker};
pub use tree_lock::{lock_set_covers, normalize_tree_ids, LockedFuture, TreeLockManager, Verified};
pub use tree_mutator::{SaveMode, TreeMutator};
pub use tree_service::TreeService;
