//! Per-operation execution context.

/// Options that travel with one logical operation.
///
/// Passed explicitly to the lock manager and the copy orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeContext {
    /// Skip tree locks. Used by bulk imports that rebuild coordinates
    /// afterwards with `rebuild_tree`.
    pub bulk_update: bool,
}

impl TreeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bulk_update() -> Self {
        Self { bulk_update: true }
    }
}
