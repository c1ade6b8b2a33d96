//! Scoped items and canonical snapshots.
//!
//! A [`Scope`] groups one ordered collection: a team groups its task lists,
//! and a task list groups its tasks. Every live item in a scope holds an
//! order in `1..=N`; soft-deleted items leave the sequence and keep the
//! sentinel order forever.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Order value of a soft-deleted item, excluded from the contiguity invariant.
pub const DELETED_ORDER: i64 = -1;

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// What a scope contains: teams hold task lists, task lists hold tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeKind {
    Team,
    TaskList,
}

/// Parent grouping under which one ordered collection lives.
///
/// A task list is itself an item under its team's scope; its own item id
/// doubles as the id of the `TaskList` scope that groups its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub kind: ScopeKind,
    pub id: Uuid,
}

impl Scope {
    pub fn team(id: Uuid) -> Self {
        Self {
            kind: ScopeKind::Team,
            id,
        }
    }

    pub fn task_list(id: Uuid) -> Self {
        Self {
            kind: ScopeKind::TaskList,
            id,
        }
    }

    /// Resource noun used in broadcast event names (`list-created`, `task-updated`, ...).
    pub fn resource_name(&self) -> &'static str {
        match self.kind {
            ScopeKind::Team => "list",
            ScopeKind::TaskList => "task",
        }
    }
}

impl fmt::Display for Scope {
    /// Canonical scope name, identical to the broadcast channel name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScopeKind::Team => write!(f, "team:{}", self.id),
            ScopeKind::TaskList => write!(f, "task:{}", self.id),
        }
    }
}

/// One item of an ordered collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedItem {
    pub id: Uuid,
    pub scope: Scope,
    pub name: String,
    /// Position within the scope: `1..=N` while live, [`DELETED_ORDER`]
    /// after soft deletion. Scope-local; no meaning across scopes.
    pub order: i64,
    pub created_by: Uuid,
    pub updated_by: Uuid,
    pub created_at: u64,
    pub updated_at: u64,
    pub deleted_at: Option<u64>,
    pub deleted_by: Option<Uuid>,
}

impl OrderedItem {
    pub fn new(id: Uuid, scope: Scope, name: impl Into<String>, order: i64, actor: Uuid) -> Self {
        let now = epoch_secs();
        Self {
            id,
            scope,
            name: name.into(),
            order,
            created_by: actor,
            updated_by: actor,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Apply a rename, refreshing the audit fields.
    pub fn rename(&mut self, name: impl Into<String>, actor: Uuid) {
        self.name = name.into();
        self.updated_by = actor;
        self.updated_at = epoch_secs();
    }

    /// Mark soft-deleted: sentinel order plus deletion stamp. Never reversed.
    pub fn mark_deleted(&mut self, actor: Uuid) {
        let now = epoch_secs();
        self.order = DELETED_ORDER;
        self.deleted_at = Some(now);
        self.deleted_by = Some(actor);
        self.updated_by = actor;
        self.updated_at = now;
    }
}

/// Check that live items' orders form exactly `{1..N}` with no duplicates.
pub fn orders_contiguous(items: &[OrderedItem]) -> bool {
    let mut orders: Vec<i64> = items
        .iter()
        .filter(|i| i.is_live())
        .map(|i| i.order)
        .collect();
    orders.sort_unstable();
    orders
        .iter()
        .enumerate()
        .all(|(idx, &order)| order == idx as i64 + 1)
}

/// Canonical ordered view of a scope after a committed mutation.
///
/// Subscribers replace their local state wholly with each snapshot they
/// receive. `version` increases with every commit, so a duplicate or stale
/// delivery is detected by comparing versions, never by diffing items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub scope: Scope,
    pub version: u64,
    /// Live items in ascending `order`.
    pub items: Vec<OrderedItem>,
}

impl ScopeSnapshot {
    /// Build from the scope's items, keeping live ones sorted by order.
    ///
    /// A contiguity violation here means a store-level bug; it is logged
    /// rather than panicking so readers keep serving.
    pub fn new(scope: Scope, version: u64, mut items: Vec<OrderedItem>) -> Self {
        items.retain(|i| i.is_live());
        items.sort_by_key(|i| i.order);
        if !orders_contiguous(&items) {
            log::warn!(
                "snapshot of {scope} v{version} violates order contiguity ({} live items)",
                items.len()
            );
        }
        Self {
            scope,
            version,
            items,
        }
    }

    pub fn live_count(&self) -> usize {
        self.items.len()
    }

    pub fn find(&self, id: Uuid) -> Option<&OrderedItem> {
        self.items.iter().find(|i| i.id == id)
    }
}
