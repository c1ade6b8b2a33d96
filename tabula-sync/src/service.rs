//! Scope-serialized mutation pipeline.
//!
//! Architecture:
//! ```text
//!        Create / Update / Delete (actor)
//!                    │
//!                    ▼
//!        ┌───────────────────────┐
//!        │ per-scope async mutex │ ◄── acquisition bounded by timeout
//!        └───────────┬───────────┘
//!                    ▼
//!        read scope → plan reindex → one atomic store batch
//!                    │
//!        ┌───────────┴──────────┐  (lock released)
//!        ▼                      ▼
//!   Publisher (best effort)  AuditSink (fire and forget)
//! ```
//!
//! One mutex per scope serializes its mutations, so every plan computes
//! against the state it commits over and live orders stay contiguous. The
//! timeout bounds lock acquisition only: a mutation that timed out wrote
//! nothing, and one that acquired the lock runs to completion.
//!
//! Broadcast and audit failures are logged, never surfaced: the commit
//! already happened and subscribers can resync from a snapshot.
//!
//! Reference: Kleppmann — DDIA, Chapter 7 (Serializability)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

use tabula_core::{
    plan_insert, plan_move, plan_soft_delete, OrderError, OrderedItem, ReindexPlan, Scope,
    ScopeSnapshot,
};

use crate::audit::{ActivityAction, ActivityEvent, AuditSink};
use crate::broadcast::Publisher;
use crate::protocol::{ErrorCode, ItemEvent};
use crate::store::{ItemStore, ScopeMutation, StoreError};

/// Mutation pipeline configuration.
#[derive(Debug, Clone)]
pub struct MutationConfig {
    /// Max wait for a scope's turn before failing with `Timeout`. Default: 5s.
    pub lock_timeout_ms: u64,
    /// Max accepted item name length in bytes. Default: 255.
    pub max_name_len: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            max_name_len: 255,
        }
    }
}

impl MutationConfig {
    /// Config for testing (short lock timeout).
    pub fn for_testing() -> Self {
        Self {
            lock_timeout_ms: 500,
            max_name_len: 255,
        }
    }
}

/// Mutation failures, mirrored onto the wire as [`ErrorCode`]s.
#[derive(Debug, Clone)]
pub enum MutationError {
    /// Target item does not exist
    NotFound(Uuid),
    /// Requested position falls outside the scope's valid range
    InvalidOrder { given: i64, live_count: usize },
    /// Target item is already soft-deleted
    Conflict(Uuid),
    /// Malformed request (empty name, oversized name, nothing to change)
    BadRequest(String),
    /// The scope stayed busy past the lock timeout; nothing was written
    Timeout,
    /// Storage failed
    Storage(StoreError),
}

impl MutationError {
    /// Wire-level category for `MutationFailed` replies.
    pub fn code(&self) -> ErrorCode {
        match self {
            MutationError::NotFound(_) => ErrorCode::NotFound,
            MutationError::InvalidOrder { .. } => ErrorCode::InvalidOrder,
            MutationError::Conflict(_) => ErrorCode::Conflict,
            MutationError::BadRequest(_) => ErrorCode::BadRequest,
            MutationError::Timeout => ErrorCode::Timeout,
            MutationError::Storage(_) => ErrorCode::Internal,
        }
    }
}

impl std::fmt::Display for MutationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationError::NotFound(id) => write!(f, "item {id} not found"),
            MutationError::InvalidOrder { given, live_count } => {
                write!(
                    f,
                    "order {given} is invalid for a scope with {live_count} live items"
                )
            }
            MutationError::Conflict(id) => write!(f, "item {id} is soft-deleted"),
            MutationError::BadRequest(reason) => write!(f, "bad request: {reason}"),
            MutationError::Timeout => write!(f, "scope stayed busy past the lock timeout"),
            MutationError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for MutationError {}

impl From<StoreError> for MutationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ItemNotFound(id) => MutationError::NotFound(id),
            other => MutationError::Storage(other),
        }
    }
}

impl From<OrderError> for MutationError {
    fn from(e: OrderError) -> Self {
        match e {
            OrderError::InvalidOrder { given, live_count } => {
                MutationError::InvalidOrder { given, live_count }
            }
            OrderError::UnknownItem(id) => MutationError::NotFound(id),
        }
    }
}

/// What a committed (or skipped) mutation hands back to the caller.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// The affected item post-commit; the stamped row for deletions.
    pub item: OrderedItem,
    /// Canonical state of the scope at its current version.
    pub snapshot: ScopeSnapshot,
    /// False for no-op moves: nothing was written or broadcast.
    pub changed: bool,
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub mutations_applied: u64,
    pub mutations_failed: u64,
    pub noop_mutations: u64,
    pub lock_timeouts: u64,
    pub events_published: u64,
    pub broadcast_failures: u64,
    pub audit_failures: u64,
}

#[derive(Default)]
struct AtomicServiceStats {
    mutations_applied: AtomicU64,
    mutations_failed: AtomicU64,
    noop_mutations: AtomicU64,
    lock_timeouts: AtomicU64,
    events_published: AtomicU64,
    broadcast_failures: AtomicU64,
    audit_failures: AtomicU64,
}

impl AtomicServiceStats {
    fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            mutations_applied: self.mutations_applied.load(Ordering::Relaxed),
            mutations_failed: self.mutations_failed.load(Ordering::Relaxed),
            noop_mutations: self.noop_mutations.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            broadcast_failures: self.broadcast_failures.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
        }
    }
}

/// The authoritative mutation path.
///
/// Owns the per-scope locks; everything downstream (store, publisher,
/// audit) is injected, so tests run the full pipeline against in-memory
/// fakes.
pub struct MutationService {
    store: Arc<dyn ItemStore>,
    publisher: Arc<dyn Publisher>,
    audit: Arc<dyn AuditSink>,
    config: MutationConfig,
    /// One mutex per scope; mutations on different scopes never contend.
    locks: RwLock<HashMap<Scope, Arc<Mutex<()>>>>,
    stats: AtomicServiceStats,
}

impl MutationService {
    pub fn new(
        store: Arc<dyn ItemStore>,
        publisher: Arc<dyn Publisher>,
        audit: Arc<dyn AuditSink>,
        config: MutationConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            audit,
            config,
            locks: RwLock::new(HashMap::new()),
            stats: AtomicServiceStats::default(),
        }
    }

    /// Create an item appended at the end of `scope`.
    ///
    /// The position is derived under the scope lock, never taken from the
    /// caller, so concurrent creates serialize into distinct slots.
    pub async fn create_item(
        &self,
        scope: Scope,
        name: &str,
        actor: Uuid,
    ) -> Result<MutationOutcome, MutationError> {
        let result = self.create_inner(scope, name, actor).await;
        self.tally(&result);
        result
    }

    /// Rename and/or move an item. `order` is the requested target
    /// position; a move to the current position combined with an unchanged
    /// name is a no-op.
    pub async fn update_item(
        &self,
        item_id: Uuid,
        name: Option<&str>,
        order: Option<i64>,
        actor: Uuid,
    ) -> Result<MutationOutcome, MutationError> {
        let result = self.update_inner(item_id, name, order, actor).await;
        self.tally(&result);
        result
    }

    /// Soft-delete an item, renumbering the survivors.
    pub async fn delete_item(
        &self,
        item_id: Uuid,
        actor: Uuid,
    ) -> Result<MutationOutcome, MutationError> {
        let result = self.delete_inner(item_id, actor).await;
        self.tally(&result);
        result
    }

    /// Canonical snapshot of a scope, for subscription bootstraps and
    /// resyncs.
    pub fn scope_snapshot(&self, scope: Scope) -> Result<ScopeSnapshot, MutationError> {
        Ok(self.store.snapshot(scope)?)
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats.snapshot()
    }

    async fn create_inner(
        &self,
        scope: Scope,
        name: &str,
        actor: Uuid,
    ) -> Result<MutationOutcome, MutationError> {
        let name = validate_name(name, self.config.max_name_len)?;

        let lock = self.scope_lock(scope).await;
        let guard = match timeout(self.lock_timeout(), lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => return Err(MutationError::Timeout),
        };

        let items = self.store.scope_items(scope)?;
        let live = items.iter().filter(|i| i.is_live()).count() as i64;
        let item_id = Uuid::new_v4();
        let plan = plan_insert(&items, item_id, live)?;
        let item = OrderedItem::new(item_id, scope, name, plan.target.new_order, actor);
        let snapshot = self
            .store
            .apply_mutation(ScopeMutation::create(item.clone(), &plan))?;
        drop(guard);

        self.publish(&ItemEvent::created(&item));
        self.record(ActivityAction::Created, &item, actor);
        Ok(MutationOutcome {
            item,
            snapshot,
            changed: true,
        })
    }

    async fn update_inner(
        &self,
        item_id: Uuid,
        name: Option<&str>,
        order: Option<i64>,
        actor: Uuid,
    ) -> Result<MutationOutcome, MutationError> {
        if name.is_none() && order.is_none() {
            return Err(MutationError::BadRequest("update changes nothing".into()));
        }
        let name = match name {
            Some(raw) => Some(validate_name(raw, self.config.max_name_len)?),
            None => None,
        };

        // Pre-read only locates the scope; everything is re-validated
        // under the lock.
        let scope = self.store.get_item(item_id)?.scope;
        let lock = self.scope_lock(scope).await;
        let guard = match timeout(self.lock_timeout(), lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => return Err(MutationError::Timeout),
        };

        let items = self.store.scope_items(scope)?;
        let current = items
            .iter()
            .find(|i| i.id == item_id)
            .ok_or(MutationError::NotFound(item_id))?;
        if !current.is_live() {
            return Err(MutationError::Conflict(item_id));
        }

        let plan = match order {
            Some(to_order) => plan_move(&items, item_id, to_order)?,
            None => None,
        };
        let rename = name.filter(|n| *n != current.name);

        let Some(mutation) = build_update_mutation(scope, item_id, &plan, rename, actor) else {
            // Same position, same name: nothing to write.
            let snapshot = self.store.snapshot(scope)?;
            let item = snapshot
                .find(item_id)
                .cloned()
                .ok_or(MutationError::NotFound(item_id))?;
            drop(guard);
            return Ok(MutationOutcome {
                item,
                snapshot,
                changed: false,
            });
        };
        let moved = plan.is_some();
        let snapshot = self.store.apply_mutation(mutation)?;
        let item = snapshot
            .find(item_id)
            .cloned()
            .ok_or(MutationError::NotFound(item_id))?;
        drop(guard);

        if moved {
            self.publish(&ItemEvent::reordered(&snapshot));
            self.record(ActivityAction::Reordered, &item, actor);
        } else {
            self.publish(&ItemEvent::renamed(&item));
            self.record(ActivityAction::Renamed, &item, actor);
        }
        Ok(MutationOutcome {
            item,
            snapshot,
            changed: true,
        })
    }

    async fn delete_inner(
        &self,
        item_id: Uuid,
        actor: Uuid,
    ) -> Result<MutationOutcome, MutationError> {
        let scope = self.store.get_item(item_id)?.scope;
        let lock = self.scope_lock(scope).await;
        let guard = match timeout(self.lock_timeout(), lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => return Err(MutationError::Timeout),
        };

        let items = self.store.scope_items(scope)?;
        let current = items
            .iter()
            .find(|i| i.id == item_id)
            .ok_or(MutationError::NotFound(item_id))?;
        if !current.is_live() {
            return Err(MutationError::Conflict(item_id));
        }

        let plan = plan_soft_delete(&items, item_id)?;
        let snapshot = self
            .store
            .apply_mutation(ScopeMutation::soft_delete(scope, &plan, actor))?;
        let item = self.store.get_item(item_id)?;
        drop(guard);

        self.publish(&ItemEvent::deleted(&snapshot));
        self.record(ActivityAction::Deleted, &item, actor);
        Ok(MutationOutcome {
            item,
            snapshot,
            changed: true,
        })
    }

    /// Get or create the mutex serializing one scope's mutations.
    async fn scope_lock(&self, scope: Scope) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(&scope) {
                return lock.clone();
            }
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(scope)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lock_timeout_ms)
    }

    /// Best-effort fan-out after commit; failure never reaches the caller.
    fn publish(&self, event: &ItemEvent) {
        match self.publisher.publish(event) {
            Ok(subscribers) => {
                self.stats.events_published.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "published {} on {} to {subscribers} subscribers",
                    event.name,
                    event.channel
                );
            }
            Err(e) => {
                self.stats.broadcast_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to publish {} on {}: {e}", event.name, event.channel);
            }
        }
    }

    /// Fire-and-forget activity append.
    fn record(&self, action: ActivityAction, item: &OrderedItem, actor: Uuid) {
        if let Err(e) = self.audit.record(ActivityEvent::for_item(action, item, actor)) {
            self.stats.audit_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Failed to record activity for item {}: {e}", item.id);
        }
    }

    fn tally(&self, result: &Result<MutationOutcome, MutationError>) {
        match result {
            Ok(outcome) if outcome.changed => {
                self.stats.mutations_applied.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.stats.noop_mutations.fetch_add(1, Ordering::Relaxed);
            }
            Err(MutationError::Timeout) => {
                self.stats.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                self.stats.mutations_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.mutations_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn validate_name(raw: &str, max_len: usize) -> Result<String, MutationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(MutationError::BadRequest("name must not be empty".into()));
    }
    if name.len() > max_len {
        return Err(MutationError::BadRequest(format!(
            "name exceeds {max_len} bytes"
        )));
    }
    Ok(name.to_string())
}

fn build_update_mutation(
    scope: Scope,
    item_id: Uuid,
    plan: &Option<ReindexPlan>,
    rename: Option<String>,
    actor: Uuid,
) -> Option<ScopeMutation> {
    match (plan, rename) {
        (None, None) => None,
        (Some(plan), Some(name)) => {
            Some(ScopeMutation::reorder(scope, plan, actor).with_rename(item_id, name))
        }
        (Some(plan), None) => Some(ScopeMutation::reorder(scope, plan, actor)),
        (None, Some(name)) => Some(ScopeMutation::rename(scope, item_id, name, actor)),
    }
}
