//! Durable offline action queue.
//!
//! Architecture:
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      QueueStore                        │
//! │                                                        │
//! │  actions       <seq:8 BE>  → record (bincode,          │
//! │                               action payload LZ4)      │
//! │  action_ids    <id:16>     → <seq:8 BE>                │
//! │  dead_letters  <id:16>     → record                    │
//! │  meta          action_seq, last_sync                   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Sequence numbers only grow; the next one is persisted in the same batch
//! as the record it was handed to, so a reopened queue never reuses one.

use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

use parley_core::model::unix_millis;
use parley_core::{Action, ActionError, ActionType};

const CF_ACTIONS: &str = "actions";
const CF_ACTION_IDS: &str = "action_ids";
const CF_DEAD_LETTERS: &str = "dead_letters";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_ACTIONS, CF_ACTION_IDS, CF_DEAD_LETTERS, CF_META];

const META_ACTION_SEQ: &[u8] = b"action_seq";
const META_LAST_SYNC: &[u8] = b"last_sync";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("offline queue is not initialized")]
    NotInitialized,
    #[error("queued action not found: {0}")]
    NotFound(Uuid),
}

impl From<rocksdb::Error> for QueueError {
    fn from(e: rocksdb::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

/// A local storage failure is retryable from the caller's point of view.
impl From<QueueError> for ActionError {
    fn from(e: QueueError) -> Self {
        ActionError::transient(e.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Transient failures tolerated before an action is dead-lettered
    pub max_attempts: u32,
    /// fsync every write batch (default: true)
    pub sync_writes: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("parley_queue"), max_attempts: 5, sync_writes: true }
    }
}

impl QueueConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Config for testing (no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), max_attempts: 5, sync_writes: false }
    }
}

/// An action waiting to be replayed against the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineAction {
    pub id: Uuid,
    /// Local, strictly increasing; replay order.
    pub sequence: u64,
    pub action: Action,
    pub created_at: u64,
    pub synced: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OfflineAction {
    pub fn action_type(&self) -> ActionType {
        self.action.action_type()
    }
}

/// On-disk form of [`OfflineAction`].
#[derive(Serialize, Deserialize)]
struct StoredAction {
    id: Uuid,
    sequence: u64,
    action_type: ActionType,
    /// bincode-encoded [`Action`], LZ4 compressed with the size prepended
    payload: Vec<u8>,
    created_at: u64,
    synced: bool,
    attempts: u32,
    last_error: Option<String>,
}

impl StoredAction {
    fn from_action(action: &OfflineAction) -> QueueResult<Self> {
        let raw = encode(&action.action)?;
        Ok(Self {
            id: action.id,
            sequence: action.sequence,
            action_type: action.action_type(),
            payload: lz4_flex::compress_prepend_size(&raw),
            created_at: action.created_at,
            synced: action.synced,
            attempts: action.attempts,
            last_error: action.last_error.clone(),
        })
    }

    fn into_action(self) -> QueueResult<OfflineAction> {
        let raw = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| QueueError::Compression(e.to_string()))?;
        Ok(OfflineAction {
            id: self.id,
            sequence: self.sequence,
            action: decode(&raw)?,
            created_at: self.created_at,
            synced: self.synced,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

/// Queue health, as shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub pending_actions: usize,
    pub dead_letters: usize,
    /// Unix millis of the last successfully replayed action
    pub last_sync: Option<u64>,
    pub pending_by_type: BTreeMap<ActionType, usize>,
}

pub struct QueueStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: QueueConfig,
    /// Next sequence number to hand out
    sequence: AtomicU64,
    /// Serialises read-modify-write cycles
    write_lock: Mutex<()>,
}

impl QueueStore {
    /// Open the queue, creating the database and column families if needed.
    pub fn open(config: QueueConfig) -> QueueResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // Payloads are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!("opened offline queue at {} (next seq {sequence})", config.path.display());

        Ok(Self { db, config, sequence: AtomicU64::new(sequence), write_lock: Mutex::new(()) })
    }

    /// The persisted counter, or one past the last record if it is missing.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> QueueResult<u64> {
        let meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| QueueError::Database(format!("Column family '{CF_META}' not found")))?;
        if let Some(bytes) = db.get_cf(&meta, META_ACTION_SEQ)? {
            return read_u64(&bytes);
        }

        let actions = db
            .cf_handle(CF_ACTIONS)
            .ok_or_else(|| QueueError::Database(format!("Column family '{CF_ACTIONS}' not found")))?;
        match db.iterator_cf(&actions, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(read_u64(&key)? + 1)
            }
            None => Ok(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> QueueResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| QueueError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> QueueResult<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sequence_of(&self, id: Uuid) -> QueueResult<Option<u64>> {
        match self.db.get_cf(&self.cf(CF_ACTION_IDS)?, id.as_bytes())? {
            Some(bytes) => Ok(Some(read_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load(&self, cf_name: &str, key: &[u8]) -> QueueResult<Option<OfflineAction>> {
        match self.db.get_cf(&self.cf(cf_name)?, key)? {
            Some(bytes) => Ok(Some(decode::<StoredAction>(&bytes)?.into_action()?)),
            None => Ok(None),
        }
    }

    fn scan(&self, cf_name: &str) -> QueueResult<Vec<OfflineAction>> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(decode::<StoredAction>(&value)?.into_action()?);
        }
        Ok(out)
    }

    fn count(&self, cf_name: &str) -> QueueResult<usize> {
        let cf = self.cf(cf_name)?;
        let mut n = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            n += 1;
        }
        Ok(n)
    }

    /// Queue `action` at the tail under a fresh sequence number.
    fn push(&self, batch: &mut WriteBatch, mut action: OfflineAction) -> QueueResult<OfflineAction> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        action.sequence = sequence;
        let key = sequence.to_be_bytes();
        batch.put_cf(&self.cf(CF_ACTIONS)?, key, encode(&StoredAction::from_action(&action)?)?);
        batch.put_cf(&self.cf(CF_ACTION_IDS)?, action.id.as_bytes(), key);
        batch.put_cf(&self.cf(CF_META)?, META_ACTION_SEQ, (sequence + 1).to_be_bytes());
        Ok(action)
    }

    // ─── Pending actions ──────────────────────────────────────────────

    pub fn append(&self, action: Action) -> QueueResult<OfflineAction> {
        let _guard = self.lock();
        let record = OfflineAction {
            id: Uuid::new_v4(),
            sequence: 0,
            action,
            created_at: unix_millis(),
            synced: false,
            attempts: 0,
            last_error: None,
        };
        let mut batch = WriteBatch::default();
        let record = self.push(&mut batch, record)?;
        self.write(batch)?;
        log::debug!("queued {} as #{}", record.action.label(), record.sequence);
        Ok(record)
    }

    pub fn get(&self, id: Uuid) -> QueueResult<Option<OfflineAction>> {
        match self.sequence_of(id)? {
            Some(seq) => self.load(CF_ACTIONS, &seq.to_be_bytes()),
            None => Ok(None),
        }
    }

    /// Every pending action, in sequence order.
    pub fn pending(&self) -> QueueResult<Vec<OfflineAction>> {
        self.scan(CF_ACTIONS)
    }

    pub fn pending_count(&self) -> QueueResult<usize> {
        self.count(CF_ACTIONS)
    }

    /// Drop a replayed action. Returns false if it was not queued.
    pub fn remove(&self, id: Uuid) -> QueueResult<bool> {
        let _guard = self.lock();
        let Some(seq) = self.sequence_of(id)? else {
            return Ok(false);
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_ACTIONS)?, seq.to_be_bytes());
        batch.delete_cf(&self.cf(CF_ACTION_IDS)?, id.as_bytes());
        self.write(batch)?;
        Ok(true)
    }

    /// Count a failed attempt and remember why.
    pub fn record_failure(&self, id: Uuid, error: &str) -> QueueResult<OfflineAction> {
        let _guard = self.lock();
        let seq = self.sequence_of(id)?.ok_or(QueueError::NotFound(id))?;
        let key = seq.to_be_bytes();
        let mut action = self.load(CF_ACTIONS, &key)?.ok_or(QueueError::NotFound(id))?;
        action.attempts += 1;
        action.last_error = Some(error.to_string());

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_ACTIONS)?, key, encode(&StoredAction::from_action(&action)?)?);
        self.write(batch)?;
        Ok(action)
    }

    // ─── Dead letters ─────────────────────────────────────────────────

    /// Move a pending action to the dead-letter column.
    pub fn dead_letter(&self, id: Uuid, error: &str) -> QueueResult<OfflineAction> {
        let _guard = self.lock();
        let seq = self.sequence_of(id)?.ok_or(QueueError::NotFound(id))?;
        let key = seq.to_be_bytes();
        let mut action = self.load(CF_ACTIONS, &key)?.ok_or(QueueError::NotFound(id))?;
        action.last_error = Some(error.to_string());

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_ACTIONS)?, key);
        batch.delete_cf(&self.cf(CF_ACTION_IDS)?, id.as_bytes());
        batch.put_cf(
            &self.cf(CF_DEAD_LETTERS)?,
            id.as_bytes(),
            encode(&StoredAction::from_action(&action)?)?,
        );
        self.write(batch)?;
        log::warn!("dead-lettered {} ({id}) after {} attempts: {error}", action.action.label(), action.attempts);
        Ok(action)
    }

    /// Dead-lettered actions, in their original order.
    pub fn dead_letters(&self) -> QueueResult<Vec<OfflineAction>> {
        let mut letters = self.scan(CF_DEAD_LETTERS)?;
        letters.sort_by_key(|a| a.sequence);
        Ok(letters)
    }

    /// Requeue a dead letter at the tail with a fresh attempt budget.
    pub fn retry_dead_letter(&self, id: Uuid) -> QueueResult<OfflineAction> {
        let _guard = self.lock();
        let mut action = self.load(CF_DEAD_LETTERS, id.as_bytes())?.ok_or(QueueError::NotFound(id))?;
        action.attempts = 0;
        action.last_error = None;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_DEAD_LETTERS)?, id.as_bytes());
        let action = self.push(&mut batch, action)?;
        self.write(batch)?;
        Ok(action)
    }

    pub fn discard_dead_letter(&self, id: Uuid) -> QueueResult<bool> {
        let _guard = self.lock();
        let cf = self.cf(CF_DEAD_LETTERS)?;
        if self.db.get_cf(&cf, id.as_bytes())?.is_none() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, id.as_bytes());
        self.write(batch)?;
        Ok(true)
    }

    // ─── Sync metadata ────────────────────────────────────────────────

    pub fn last_sync(&self) -> QueueResult<Option<u64>> {
        match self.db.get_cf(&self.cf(CF_META)?, META_LAST_SYNC)? {
            Some(bytes) => Ok(Some(read_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_last_sync(&self, at: u64) -> QueueResult<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_META)?, META_LAST_SYNC, at.to_be_bytes());
        self.write(batch)
    }

    pub fn sync_stats(&self) -> QueueResult<SyncStats> {
        let pending = self.pending()?;
        let mut pending_by_type = BTreeMap::new();
        for action in &pending {
            *pending_by_type.entry(action.action_type()).or_insert(0) += 1;
        }
        Ok(SyncStats {
            pending_actions: pending.len(),
            dead_letters: self.count(CF_DEAD_LETTERS)?,
            last_sync: self.last_sync()?,
            pending_by_type,
        })
    }
}

/// Lazily opened handle to the queue. Calls made before [`OfflineQueue::open`]
/// fail with [`QueueError::NotInitialized`], except [`OfflineQueue::sync_stats`],
/// which reports an empty queue.
#[derive(Default)]
pub struct OfflineQueue {
    store: RwLock<Option<Arc<QueueStore>>>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a queue in one step.
    pub fn opened(config: QueueConfig) -> QueueResult<Self> {
        let queue = Self::new();
        queue.open(config)?;
        Ok(queue)
    }

    pub fn open(&self, config: QueueConfig) -> QueueResult<()> {
        let store = Arc::new(QueueStore::open(config)?);
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = Some(store);
        Ok(())
    }

    /// Release the database. Later calls behave as before `open`.
    pub fn close(&self) {
        self.store.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_open(&self) -> bool {
        self.store.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn store(&self) -> QueueResult<Arc<QueueStore>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(QueueError::NotInitialized)
    }

    pub fn enqueue(&self, action: Action) -> QueueResult<OfflineAction> {
        self.store()?.append(action)
    }

    pub fn pending(&self) -> QueueResult<Vec<OfflineAction>> {
        self.store()?.pending()
    }

    pub fn sync_stats(&self) -> QueueResult<SyncStats> {
        match self.store() {
            Ok(store) => store.sync_stats(),
            Err(QueueError::NotInitialized) => Ok(SyncStats::default()),
            Err(e) => Err(e),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> QueueResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> QueueResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| QueueError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn read_u64(bytes: &[u8]) -> QueueResult<u64> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| QueueError::Deserialization("expected 8-byte integer".into()))?;
    Ok(u64::from_be_bytes(buf))
}
