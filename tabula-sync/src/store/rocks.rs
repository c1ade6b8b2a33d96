//! RocksDB-backed persistent item store.
//!
//! Column families:
//! - `items`       — Full item rows (LZ4-compressed bincode, keyed by item id)
//! - `scope_index` — Order index (keyed by scope + order + item id, value item id)
//! - `metadata`    — Per-scope metadata (version, live count, timestamps)
//! - `activity`    — Append-only activity trail (sequential, keyed by sequence)
//!
//! Index keys encode the order big-endian, so one prefix scan yields a
//! scope's live items in display order. The deletion sentinel encodes as
//! all-ones and sorts after every live position, which lets snapshot scans
//! stop at the first soft-deleted row.
//!
//! Performance targets:
//! - Open (10k scopes): <100ms (bloom filters + block cache)
//! - Snapshot load (100 items): <1ms
//! - Mutation commit (10 writes): <200μs (single write batch)
//! - Activity append: <10μs
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)
//! Reference: Patterson & Hennessy — Section 5.7 (I/O Performance)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tabula_core::{OrderedItem, Scope, ScopeKind, ScopeSnapshot, DELETED_ORDER};
use uuid::Uuid;

use super::{ItemStore, ScopeMutation, StoreError};
use crate::audit::{recover_records, ActivityRecord, AuditError, AuditSink};

/// Column family names.
const CF_ITEMS: &str = "items";
const CF_SCOPE_INDEX: &str = "scope_index";
const CF_METADATA: &str = "metadata";
const CF_ACTIVITY: &str = "activity";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_ITEMS, CF_SCOPE_INDEX, CF_METADATA, CF_ACTIVITY];

/// Scope-prefix length: kind tag (1 byte) + scope id (16 bytes).
const SCOPE_KEY_LEN: usize = 17;
/// Index-key length: scope prefix + order (8 bytes BE) + item id (16 bytes).
const INDEX_KEY_LEN: usize = SCOPE_KEY_LEN + 8 + 16;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for RocksStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tabula_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl RocksStoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Per-scope metadata stored alongside the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeMeta {
    pub scope: Scope,
    /// Mutation count; bumped once per committed mutation
    pub version: u64,
    /// Live items currently in the scope
    pub live_count: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last mutation timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl ScopeMeta {
    fn new(scope: Scope, now: u64) -> Self {
        Self {
            scope,
            version: 0,
            live_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn kind_tag(kind: ScopeKind) -> u8 {
    match kind {
        ScopeKind::Team => 1,
        ScopeKind::TaskList => 2,
    }
}

fn kind_from_tag(tag: u8) -> Option<ScopeKind> {
    match tag {
        1 => Some(ScopeKind::Team),
        2 => Some(ScopeKind::TaskList),
        _ => None,
    }
}

/// Scope prefix: kind tag + scope id.
fn scope_key(scope: &Scope) -> [u8; SCOPE_KEY_LEN] {
    let mut key = [0u8; SCOPE_KEY_LEN];
    key[0] = kind_tag(scope.kind);
    key[1..].copy_from_slice(scope.id.as_bytes());
    key
}

/// Index key: scope prefix + order (big-endian) + item id.
///
/// The item id suffix keeps keys unique when several soft-deleted rows
/// share the sentinel order.
fn index_key(scope: &Scope, order: i64, item_id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(INDEX_KEY_LEN);
    key.extend_from_slice(&scope_key(scope));
    key.extend_from_slice(&order.to_be_bytes());
    key.extend_from_slice(item_id.as_bytes());
    key
}

fn order_from_index_key(key: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[SCOPE_KEY_LEN..SCOPE_KEY_LEN + 8]);
    i64::from_be_bytes(buf)
}

/// RocksDB-backed item store.
///
/// Provides durable storage for scoped ordered collections with:
/// - LZ4-compressed item rows
/// - Order-sorted scope index for one-scan snapshots
/// - Atomic write batches so a mutation commits wholly or not at all
/// - A sequenced activity trail recovered across restarts
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: RocksStoreConfig,
    /// Next activity trail sequence number
    activity_sequence: AtomicU64,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: RocksStoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let activity_sequence = Self::recover_activity_sequence(&db);

        Ok(Self {
            db,
            config,
            activity_sequence: AtomicU64::new(activity_sequence),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &RocksStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ITEMS => {
                // Point lookups by item id dominate.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SCOPE_INDEX => {
                // Small keys, prefix-scanned per scope.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(
                    SCOPE_KEY_LEN,
                ));
            }
            CF_METADATA => {
                // Small values, frequent reads.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_ACTIVITY => {
                // Sequential writes, sequential reads during recovery.
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Recover the next activity sequence from the trail's last key.
    fn recover_activity_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_ACTIVITY) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => {
                if key.len() >= 8 {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&key[..8]);
                    u64::from_be_bytes(buf) + 1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    fn encode_item(item: &OrderedItem) -> Result<Vec<u8>, StoreError> {
        let bytes = bincode::serde::encode_to_vec(item, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode_item(bytes: &[u8]) -> Result<OrderedItem, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (item, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(item)
    }

    /// Load scope metadata, `None` for a scope never mutated.
    fn load_meta(&self, scope: Scope) -> Result<Option<ScopeMeta>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, scope_key(&scope))? {
            Some(bytes) => Ok(Some(ScopeMeta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Scan a scope's index in key order. Live items come back sorted by
    /// order; with `live_only` the scan stops at the first sentinel key.
    fn scan_scope(&self, scope: Scope, live_only: bool) -> Result<Vec<OrderedItem>, StoreError> {
        let cf = self.cf(CF_SCOPE_INDEX)?;
        let prefix = scope_key(&scope);

        let mut items = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        for entry in iter {
            let (key, value) = entry.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() < INDEX_KEY_LEN || key[..SCOPE_KEY_LEN] != prefix {
                break;
            }
            if live_only && order_from_index_key(&key) == DELETED_ORDER {
                break;
            }
            if value.len() < 16 {
                continue;
            }
            let item_id = Uuid::from_bytes(
                value[..16]
                    .try_into()
                    .map_err(|_| StoreError::DeserializationError("Invalid UUID in index".into()))?,
            );
            items.push(self.get_item(item_id)?);
        }

        Ok(items)
    }

    /// Read activity records at or after a sequence number.
    ///
    /// Rows failing checksum verification are skipped and counted in the
    /// log rather than aborting the read.
    pub fn activity_since(&self, since_seq: u64) -> Result<Vec<ActivityRecord>, StoreError> {
        let cf = self.cf(CF_ACTIVITY)?;
        let start_key = since_seq.to_be_bytes();

        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward));
        for entry in iter {
            let (_, value) = entry.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            rows.push(value.to_vec());
        }

        let (records, corrupted) = recover_records(&rows);
        if corrupted > 0 {
            log::warn!("skipped {corrupted} corrupted activity records during read");
        }
        Ok(records)
    }

    /// Next sequence the activity trail will assign.
    pub fn activity_sequence(&self) -> u64 {
        self.activity_sequence.load(Ordering::SeqCst)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl ItemStore for RocksStore {
    fn get_item(&self, item_id: Uuid) -> Result<OrderedItem, StoreError> {
        let cf = self.cf(CF_ITEMS)?;
        match self.db.get_cf(&cf, item_id.as_bytes())? {
            Some(bytes) => Self::decode_item(&bytes),
            None => Err(StoreError::ItemNotFound(item_id)),
        }
    }

    fn scope_items(&self, scope: Scope) -> Result<Vec<OrderedItem>, StoreError> {
        self.scan_scope(scope, false)
    }

    fn scope_version(&self, scope: Scope) -> Result<u64, StoreError> {
        Ok(self.load_meta(scope)?.map(|m| m.version).unwrap_or(0))
    }

    fn apply_mutation(&self, mutation: ScopeMutation) -> Result<ScopeSnapshot, StoreError> {
        let scope = mutation.scope;
        let cf_items = self.cf(CF_ITEMS)?;
        let cf_index = self.cf(CF_SCOPE_INDEX)?;
        let cf_meta = self.cf(CF_METADATA)?;

        // Read phase: load and validate every touched row before building
        // the batch, so a failed mutation writes nothing.
        if let Some(item) = &mutation.insert {
            if self.db.get_cf(&cf_items, item.id.as_bytes())?.is_some() {
                return Err(StoreError::DuplicateItem(item.id));
            }
        }
        let inserting = mutation.insert.as_ref().map(|i| i.id);

        // Touched rows with their pre-mutation order, for index rekeying.
        let mut touched: HashMap<Uuid, (OrderedItem, i64)> = HashMap::new();
        let mut touch = |store: &Self, id: Uuid| -> Result<(), StoreError> {
            if touched.contains_key(&id) {
                return Ok(());
            }
            let item = store.get_item(id)?;
            if item.scope != scope {
                return Err(StoreError::ItemNotFound(id));
            }
            let original_order = item.order;
            touched.insert(id, (item, original_order));
            Ok(())
        };
        for write in &mutation.order_writes {
            if Some(write.item_id) != inserting {
                touch(self, write.item_id)?;
            }
        }
        if let Some((item_id, _)) = &mutation.rename {
            touch(self, *item_id)?;
        }
        if let Some(item_id) = &mutation.delete {
            touch(self, *item_id)?;
        }

        // Mutate the in-memory copies.
        for write in &mutation.order_writes {
            if let Some((item, _)) = touched.get_mut(&write.item_id) {
                item.order = write.new_order;
                item.updated_by = mutation.actor;
                item.updated_at = mutation.updated_at;
            }
        }
        if let Some((item_id, name)) = &mutation.rename {
            if let Some((item, _)) = touched.get_mut(item_id) {
                item.name = name.clone();
                item.updated_by = mutation.actor;
                item.updated_at = mutation.updated_at;
            }
        }
        if let Some(item_id) = &mutation.delete {
            if let Some((item, _)) = touched.get_mut(item_id) {
                item.order = DELETED_ORDER;
                item.deleted_at = Some(mutation.updated_at);
                item.deleted_by = Some(mutation.actor);
                item.updated_by = mutation.actor;
                item.updated_at = mutation.updated_at;
            }
        }

        // Write phase: one atomic batch for rows, index moves, and metadata.
        let mut batch = WriteBatch::default();
        if let Some(item) = &mutation.insert {
            batch.put_cf(&cf_items, item.id.as_bytes(), Self::encode_item(item)?);
            batch.put_cf(
                &cf_index,
                index_key(&scope, item.order, item.id),
                item.id.as_bytes(),
            );
        }
        for (item, original_order) in touched.values() {
            batch.put_cf(&cf_items, item.id.as_bytes(), Self::encode_item(item)?);
            if item.order != *original_order {
                batch.delete_cf(&cf_index, index_key(&scope, *original_order, item.id));
                batch.put_cf(
                    &cf_index,
                    index_key(&scope, item.order, item.id),
                    item.id.as_bytes(),
                );
            }
        }

        let mut meta = self
            .load_meta(scope)?
            .unwrap_or_else(|| ScopeMeta::new(scope, mutation.updated_at));
        meta.version += 1;
        if mutation.insert.is_some() {
            meta.live_count += 1;
        }
        if mutation.delete.is_some() {
            meta.live_count = meta.live_count.saturating_sub(1);
        }
        meta.updated_at = mutation.updated_at;
        batch.put_cf(&cf_meta, scope_key(&scope), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        self.snapshot(scope)
    }

    fn snapshot(&self, scope: Scope) -> Result<ScopeSnapshot, StoreError> {
        let version = self.scope_version(scope)?;
        let items = self.scan_scope(scope, true)?;
        Ok(ScopeSnapshot::new(scope, version, items))
    }

    fn list_scopes(&self) -> Result<Vec<Scope>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut scopes = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for entry in iter {
            let (key, _) = entry.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() != SCOPE_KEY_LEN {
                continue;
            }
            let Some(kind) = kind_from_tag(key[0]) else {
                continue;
            };
            let id = Uuid::from_bytes(
                key[1..]
                    .try_into()
                    .map_err(|_| StoreError::DeserializationError("Invalid scope key".into()))?,
            );
            scopes.push(Scope { kind, id });
        }

        Ok(scopes)
    }
}

impl AuditSink for RocksStore {
    fn record(&self, event: crate::audit::ActivityEvent) -> Result<u64, AuditError> {
        let cf = self
            .db
            .cf_handle(CF_ACTIVITY)
            .ok_or_else(|| AuditError::Backend("activity column family missing".into()))?;

        let seq = self.activity_sequence.fetch_add(1, Ordering::SeqCst);
        let record = ActivityRecord::from_event(seq, event);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(false); // Trail rides RocksDB's own WAL

        self.db
            .put_cf_opt(&cf, seq.to_be_bytes(), record.encode()?, &write_opts)
            .map_err(|e| AuditError::Backend(e.to_string()))?;

        Ok(seq)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
