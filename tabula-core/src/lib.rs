//! # tabula-core — domain model for ordered-collection sync
//!
//! Pure types and algorithms shared by every Tabula component: scoped
//! ordered items, canonical snapshots, and the reindex planner that keeps
//! each scope's live orders contiguous (`1..=N`, no gaps, no duplicates)
//! across inserts, moves, and soft deletes.
//!
//! No I/O and no async here; storage and transport live in `tabula-sync`.
//!
//! ## Modules
//!
//! - [`item`] — `Scope`, `OrderedItem`, `ScopeSnapshot`, the deletion sentinel
//! - [`ordering`] — reindex planning (`plan_insert` / `plan_move` / `plan_soft_delete`)

pub mod item;
pub mod ordering;

// Re-exports for convenience
pub use item::{
    epoch_secs, orders_contiguous, OrderedItem, Scope, ScopeKind, ScopeSnapshot, DELETED_ORDER,
};
pub use ordering::{plan_insert, plan_move, plan_soft_delete, OrderError, OrderWrite, ReindexPlan};
