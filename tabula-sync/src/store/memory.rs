//! In-memory item store for tests and single-process deployments.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tabula_core::{OrderedItem, Scope, ScopeSnapshot, DELETED_ORDER};
use uuid::Uuid;

use super::{ItemStore, ScopeMutation, StoreError};

#[derive(Default)]
struct MemoryInner {
    items: HashMap<Uuid, OrderedItem>,
    scopes: HashMap<Scope, HashSet<Uuid>>,
    versions: HashMap<Scope, u64>,
}

/// Hash-map store behind one `RwLock`; a mutation holds the write lock
/// for its whole validate-then-apply pass, which makes it atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::DatabaseError("store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::DatabaseError("store lock poisoned".into()))
    }
}

impl MemoryInner {
    fn scope_member(&self, scope: Scope, item_id: Uuid) -> Result<(), StoreError> {
        match self.items.get(&item_id) {
            Some(item) if item.scope == scope => Ok(()),
            _ => Err(StoreError::ItemNotFound(item_id)),
        }
    }

    fn snapshot_of(&self, scope: Scope) -> ScopeSnapshot {
        let items = self
            .scopes
            .get(&scope)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.items.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let version = self.versions.get(&scope).copied().unwrap_or(0);
        ScopeSnapshot::new(scope, version, items)
    }
}

impl ItemStore for MemoryStore {
    fn get_item(&self, item_id: Uuid) -> Result<OrderedItem, StoreError> {
        self.read()?
            .items
            .get(&item_id)
            .cloned()
            .ok_or(StoreError::ItemNotFound(item_id))
    }

    fn scope_items(&self, scope: Scope) -> Result<Vec<OrderedItem>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .scopes
            .get(&scope)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.items.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn scope_version(&self, scope: Scope) -> Result<u64, StoreError> {
        Ok(self.read()?.versions.get(&scope).copied().unwrap_or(0))
    }

    fn apply_mutation(&self, mutation: ScopeMutation) -> Result<ScopeSnapshot, StoreError> {
        let mut inner = self.write()?;

        // Validate everything before touching state: a failed mutation
        // leaves the store exactly as it was.
        if let Some(item) = &mutation.insert {
            if inner.items.contains_key(&item.id) {
                return Err(StoreError::DuplicateItem(item.id));
            }
        }
        let inserting = mutation.insert.as_ref().map(|i| i.id);
        for write in &mutation.order_writes {
            if Some(write.item_id) != inserting {
                inner.scope_member(mutation.scope, write.item_id)?;
            }
        }
        if let Some((item_id, _)) = &mutation.rename {
            inner.scope_member(mutation.scope, *item_id)?;
        }
        if let Some(item_id) = &mutation.delete {
            inner.scope_member(mutation.scope, *item_id)?;
        }

        if let Some(item) = mutation.insert {
            inner.scopes.entry(item.scope).or_default().insert(item.id);
            inner.items.insert(item.id, item);
        }
        for write in &mutation.order_writes {
            if let Some(item) = inner.items.get_mut(&write.item_id) {
                item.order = write.new_order;
                item.updated_by = mutation.actor;
                item.updated_at = mutation.updated_at;
            }
        }
        if let Some((item_id, name)) = mutation.rename {
            if let Some(item) = inner.items.get_mut(&item_id) {
                item.name = name;
                item.updated_by = mutation.actor;
                item.updated_at = mutation.updated_at;
            }
        }
        if let Some(item_id) = mutation.delete {
            if let Some(item) = inner.items.get_mut(&item_id) {
                item.order = DELETED_ORDER;
                item.deleted_at = Some(mutation.updated_at);
                item.deleted_by = Some(mutation.actor);
                item.updated_by = mutation.actor;
                item.updated_at = mutation.updated_at;
            }
        }

        *inner.versions.entry(mutation.scope).or_insert(0) += 1;
        Ok(inner.snapshot_of(mutation.scope))
    }

    fn snapshot(&self, scope: Scope) -> Result<ScopeSnapshot, StoreError> {
        Ok(self.read()?.snapshot_of(scope))
    }

    fn list_scopes(&self) -> Result<Vec<Scope>, StoreError> {
        Ok(self.read()?.versions.keys().copied().collect())
    }
}
