//! Tree Lock Manager
//!
//! Runs a unit of work while holding exclusive locks on one or more trees.
//!
//! # Lock Ordering
//!
//! Requested tree ids are flattened, deduplicated and sorted ascending before
//! any lock is taken, so every locker acquires overlapping trees in the same
//! global order. Two callers asking for `{3, 1}` and `{1, 2}` both start with
//! tree 1 and can never wait on each other in a cycle.
//!
//! # Retry Behavior
//!
//! - **Retry on**: deadlock/busy failures reported by the store
//! - **Attempts**: two, each in a fresh transaction
//! - **Other errors**: rolled back and returned immediately
//!
//! # Examples
//!
//! ```rust,no_run
//! use channeltree_core::db::MemoryStore;
//! use channeltree_core::models::TreeId;
//! use channeltree_core::services::{TreeContext, TreeLockManager};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let locks = TreeLockManager::new(Arc::new(MemoryStore::new()));
//! let nodes = locks
//!     .with_locks(&TreeContext::new(), &[Some(TreeId(1))], |tx| {
//!         Box::pin(async move { Ok(tx.get_tree(TreeId(1)).await?) })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::db::{TransactionMode, TreeStore, TreeTransaction};
use crate::models::TreeId;
use crate::services::{TreeContext, TreeServiceError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Future returned by a locked body; it may borrow the transaction.
pub type LockedFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, TreeServiceError>> + Send + 't>>;

/// Outcome of a body run by [`TreeLockManager::with_current_locks`].
#[derive(Debug)]
pub enum Verified<T> {
    Done(T),
    /// The rows the body loaded live in trees outside the lock set; nothing
    /// was written. Carries the trees to lock next.
    Relock(Vec<Option<TreeId>>),
}

/// True when every tree in `found` is in the (normalized) `locked` set.
pub fn lock_set_covers(locked: &[TreeId], found: &[Option<TreeId>]) -> bool {
    normalize_tree_ids(found)
        .iter()
        .all(|id| locked.binary_search(id).is_ok())
}

/// Acquires ordered tree locks around a transactional body.
pub struct TreeLockManager {
    store: Arc<dyn TreeStore>,
    critical_sections: AtomicU64,
}

/// Drop absent ids, deduplicate, sort ascending.
pub fn normalize_tree_ids(tree_ids: &[Option<TreeId>]) -> Vec<TreeId> {
    let mut ids: Vec<TreeId> = tree_ids.iter().flatten().copied().collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

impl TreeLockManager {
    pub fn new(store: Arc<dyn TreeStore>) -> Self {
        Self {
            store,
            critical_sections: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.store
    }

    /// Number of locked sections entered so far (retries included).
    pub fn critical_sections(&self) -> u64 {
        self.critical_sections.load(Ordering::SeqCst)
    }

    /// Run `body` with every listed tree locked.
    ///
    /// With `ctx.bulk_update` set, or when no concrete id is given, `body`
    /// runs in a plain write transaction without locks or retry.
    ///
    /// `body` may run twice, so it must capture owned data and clone what
    /// it moves into the returned future.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or the store error that aborted locking or
    /// commit. A deadlock on the second attempt is returned as-is.
    pub async fn with_locks<T, F>(
        &self,
        ctx: &TreeContext,
        tree_ids: &[Option<TreeId>],
        mut body: F,
    ) -> Result<T, TreeServiceError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut dyn TreeTransaction) -> LockedFuture<'t, T> + Send,
    {
        let ids = normalize_tree_ids(tree_ids);

        if ctx.bulk_update || ids.is_empty() {
            return self.run_unlocked(&mut body).await;
        }

        match self.attempt(&ids, &mut body).await {
            Err(e) if e.is_deadlock() => {
                tracing::error!(
                    "Deadlock detected while locking trees {:?}, retrying once: {}",
                    ids,
                    e
                );
                self.attempt(&ids, &mut body).await
            }
            other => other,
        }
    }

    /// Run `body` in a read transaction. No locks, no retry.
    pub async fn read<T, F>(&self, mut body: F) -> Result<T, TreeServiceError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut dyn TreeTransaction) -> LockedFuture<'t, T> + Send,
    {
        let mut tx = self.store.begin(TransactionMode::Read).await?;
        let result = body(tx.as_mut()).await;
        finish(tx, result).await
    }

    /// Like [`with_locks`](Self::with_locks), for callers that chose the lock
    /// set from rows read before locking.
    ///
    /// `body` receives the normalized set it runs under. After reloading its
    /// rows it must check them with [`lock_set_covers`] and return
    /// [`Verified::Relock`] before writing anything when they moved to other
    /// trees; the section is then left and re-entered with the new set until
    /// the rows stay put.
    pub async fn with_current_locks<T, F>(
        &self,
        ctx: &TreeContext,
        tree_ids: &[Option<TreeId>],
        mut body: F,
    ) -> Result<T, TreeServiceError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut dyn TreeTransaction, Vec<TreeId>) -> LockedFuture<'t, Verified<T>>
            + Send,
    {
        let mut requested = tree_ids.to_vec();
        loop {
            let locked = normalize_tree_ids(&requested);
            let body = &mut body;
            let outcome = self
                .with_locks(ctx, &requested, |tx| body(tx, locked.clone()))
                .await?;
            match outcome {
                Verified::Done(value) => return Ok(value),
                Verified::Relock(found) => {
                    tracing::debug!(
                        "Rows left locked trees {:?}, relocking {:?}",
                        locked,
                        normalize_tree_ids(&found)
                    );
                    requested = found;
                }
            }
        }
    }

    async fn run_unlocked<T, F>(&self, body: &mut F) -> Result<T, TreeServiceError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut dyn TreeTransaction) -> LockedFuture<'t, T> + Send,
    {
        let mut tx = self.store.begin(TransactionMode::Write).await?;
        let result = body(tx.as_mut()).await;
        finish(tx, result).await
    }

    async fn attempt<T, F>(&self, ids: &[TreeId], body: &mut F) -> Result<T, TreeServiceError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut dyn TreeTransaction) -> LockedFuture<'t, T> + Send,
    {
        let mut tx = self.store.begin(TransactionMode::Write).await?;
        self.critical_sections.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let mut result = Ok(());
        for id in ids {
            if let Err(e) = tx.lock_tree(*id).await {
                result = Err(TreeServiceError::from(e));
                break;
            }
        }
        let result = match result {
            Ok(()) => body(tx.as_mut()).await,
            Err(e) => Err(e),
        };
        let outcome = finish(tx, result).await;

        tracing::debug!(
            "Held lock on trees {:?} for {:.3}ms",
            ids,
            started.elapsed().as_secs_f64() * 1000.0
        );
        outcome
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    mut tx: Box<dyn TreeTransaction>,
    result: Result<T, TreeServiceError>,
) -> Result<T, TreeServiceError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!("Rollback after failed tree operation also failed: {}", rollback);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InjectedFault, MemoryStore};

    fn manager() -> (MemoryStore, TreeLockManager) {
        let store = MemoryStore::new();
        let locks = TreeLockManager::new(Arc::new(store.clone()));
        (store, locks)
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let ids = normalize_tree_ids(&[Some(TreeId(3)), None, Some(TreeId(1)), Some(TreeId(3))]);
        assert_eq!(ids, vec![TreeId(1), TreeId(3)]);
        assert!(normalize_tree_ids(&[None, None]).is_empty());
    }

    #[tokio::test]
    async fn test_locks_each_tree_once() {
        let (store, locks) = manager();
        let value = locks
            .with_locks(
                &TreeContext::new(),
                &[Some(TreeId(2)), Some(TreeId(1)), Some(TreeId(2))],
                |_tx| Box::pin(async move { Ok(7) }),
            )
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(store.lock_calls(), 2);
        assert_eq!(locks.critical_sections(), 1);
    }

    #[tokio::test]
    async fn test_bulk_mode_and_empty_ids_skip_locks() {
        let (store, locks) = manager();
        locks
            .with_locks(&TreeContext::bulk_update(), &[Some(TreeId(1))], |_tx| {
                Box::pin(async move { Ok(()) })
            })
            .await
            .unwrap();
        locks
            .with_locks(&TreeContext::new(), &[None], |_tx| Box::pin(async move { Ok(()) }))
            .await
            .unwrap();

        assert_eq!(store.lock_calls(), 0);
        assert_eq!(locks.critical_sections(), 0);
        assert_eq!(store.transactions_started(), 2);
    }

    #[tokio::test]
    async fn test_deadlock_is_retried_exactly_once() {
        let (store, locks) = manager();
        store.inject_lock_fault(InjectedFault::Deadlock);

        let mut runs = 0;
        let result = locks
            .with_locks(&TreeContext::new(), &[Some(TreeId(1))], |_tx| {
                runs += 1;
                Box::pin(async move { Ok(()) })
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(runs, 1);
        assert_eq!(locks.critical_sections(), 2);
        assert_eq!(store.transactions_started(), 2);
    }

    #[tokio::test]
    async fn test_second_deadlock_is_fatal() {
        let (store, locks) = manager();
        store.inject_lock_fault(InjectedFault::Deadlock);
        store.inject_lock_fault(InjectedFault::Deadlock);

        let err = locks
            .with_locks(&TreeContext::new(), &[Some(TreeId(1))], |_tx| {
                Box::pin(async move { Ok(()) })
            })
            .await
            .unwrap_err();

        assert!(err.is_deadlock());
        assert_eq!(locks.critical_sections(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let (store, locks) = manager();
        store.inject_lock_fault(InjectedFault::Fatal);

        let err = locks
            .with_locks(&TreeContext::new(), &[Some(TreeId(1))], |_tx| {
                Box::pin(async move { Ok(()) })
            })
            .await
            .unwrap_err();

        assert!(!err.is_deadlock());
        assert_eq!(locks.critical_sections(), 1);
    }

    #[tokio::test]
    async fn test_body_error_rolls_back() {
        let (store, locks) = manager();
        let err = locks
            .with_locks(&TreeContext::new(), &[Some(TreeId(1))], |tx| {
                Box::pin(async move {
                    let mut node = crate::models::Node::new(crate::models::ContentKind::Topic, "x");
                    node.tree_id = TreeId(1);
                    node.lft = 1;
                    node.rght = 2;
                    tx.insert_nodes(&[node]).await?;
                    Err::<(), _>(TreeServiceError::invariant_violation("stop"))
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TreeServiceError::InvariantViolation(_)));
        assert_eq!(store.node_count().await, 0);
    }

    #[test]
    fn test_lock_set_covers_ignores_absent_ids() {
        let locked = normalize_tree_ids(&[Some(TreeId(4)), Some(TreeId(2))]);
        assert!(lock_set_covers(&locked, &[Some(TreeId(2)), None]));
        assert!(lock_set_covers(&locked, &[Some(TreeId(4)), Some(TreeId(2))]));
        assert!(!lock_set_covers(&locked, &[Some(TreeId(2)), Some(TreeId(3))]));
    }

    #[tokio::test]
    async fn test_stale_lock_set_is_reacquired() {
        let (store, locks) = manager();

        // First pass finds its row in tree 5, second pass is satisfied.
        let mut seen = Vec::new();
        let value = locks
            .with_current_locks(&TreeContext::new(), &[Some(TreeId(1))], |_tx, locked| {
                seen.push(locked.clone());
                Box::pin(async move {
                    if lock_set_covers(&locked, &[Some(TreeId(5))]) {
                        Ok(Verified::Done("moved"))
                    } else {
                        Ok(Verified::Relock(vec![Some(TreeId(5)), Some(TreeId(1))]))
                    }
                })
            })
            .await
            .unwrap();

        assert_eq!(value, "moved");
        assert_eq!(seen, vec![vec![TreeId(1)], vec![TreeId(1), TreeId(5)]]);
        assert_eq!(locks.critical_sections(), 2);
        assert_eq!(store.lock_calls(), 3);
    }
}
