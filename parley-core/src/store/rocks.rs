//! RocksDB-backed membership store.
//!
//! Column families:
//! - `groups`     — `Group` records keyed by group id
//! - `members`    — `Membership` rows keyed by `<group:16><user:16>`
//! - `seats`      — `SeatHold` records keyed by `<group:16><seat:1>`
//! - `messages`   — `Message` records keyed by `<group:16><seq:8 BE>`
//! - `client_ids` — `<group:16><client_id:16>` → message key, for replay dedupe
//! - `meta`       — store counters (message sequence)
//!
//! All values are bincode (serde mode, standard config). Every write that
//! reads before it writes runs under a striped lock chosen by group id, so
//! writers to different groups rarely contend. The message sequence is
//! global: it is drawn and persisted under its own lock, and on open it
//! resumes past both the stored counter and the highest message key.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{seat_available, MembershipStore, MessageStore, SeatCommit, StoreResult};
use crate::error::StoreError;
use crate::model::{Group, Membership, Message, Seat, SeatHold};

const CF_GROUPS: &str = "groups";
const CF_MEMBERS: &str = "members";
const CF_SEATS: &str = "seats";
const CF_MESSAGES: &str = "messages";
const CF_CLIENT_IDS: &str = "client_ids";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] =
    &[CF_GROUPS, CF_MEMBERS, CF_SEATS, CF_MESSAGES, CF_CLIENT_IDS, CF_META];

const META_MESSAGE_SEQ: &[u8] = b"message_seq";

const LOCK_STRIPES: usize = 64;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: true; seats are authoritative)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("parley_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next message sequence number
    sequence: AtomicU64,
    /// Held from drawing a sequence number until it is persisted
    sequence_lock: Mutex<()>,
    stripes: Vec<Mutex<()>>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "opened membership store at {} (next message seq {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            sequence_lock: Mutex::new(()),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_GROUPS | CF_SEATS | CF_META => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_MEMBERS => {
                // Prefix-scanned by group id
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_MESSAGES => {
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// Next free sequence: past the stored counter and past every message
    /// key, whichever is higher.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> StoreResult<u64> {
        let cf_meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_META}' not found")))?;
        let mut next = match db.get_cf(&cf_meta, META_MESSAGE_SEQ)? {
            Some(bytes) => read_u64(&bytes)?,
            None => 0,
        };

        // Keys are group-prefixed, so the highest sequence can sit anywhere.
        let cf_messages = db
            .cf_handle(CF_MESSAGES)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_MESSAGES}' not found")))?;
        let mut stale = false;
        for item in db.iterator_cf(&cf_messages, IteratorMode::Start) {
            let (key, _) = item?;
            let seq = key.get(16..).map(read_u64).transpose()?.unwrap_or(0);
            if seq >= next {
                next = seq + 1;
                stale = true;
            }
        }
        if stale {
            log::warn!("message counter was behind stored messages; resuming at {next}");
        }
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn stripe(&self, group_id: Uuid) -> StoreResult<MutexGuard<'_, ()>> {
        let idx = group_id.as_bytes()[15] as usize % self.stripes.len();
        self.stripes[idx].lock().map_err(|_| StoreError::Poisoned)
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> StoreResult<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every `(key, value)` in `cf_name` whose key starts with `prefix`.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> StoreResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf(cf_name)?;
        let iter = self.db.iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn delete_prefix(&self, batch: &mut WriteBatch, cf_name: &str, prefix: &[u8]) -> StoreResult<()> {
        let cf = self.cf(cf_name)?;
        for (key, _) in self.scan_prefix(cf_name, prefix)? {
            batch.delete_cf(&cf, &key);
        }
        Ok(())
    }

    fn message_by_key(&self, key: &[u8]) -> StoreResult<Option<Message>> {
        self.get(CF_MESSAGES, key)
    }
}

fn member_key(group_id: Uuid, user_id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(group_id.as_bytes());
    key.extend_from_slice(user_id.as_bytes());
    key
}

fn seat_key(group_id: Uuid, seat: Seat) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.extend_from_slice(group_id.as_bytes());
    key.push(seat.index());
    key
}

fn message_key(group_id: Uuid, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(group_id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn client_id_key(group_id: Uuid, client_id: Uuid) -> Vec<u8> {
    member_key(group_id, client_id)
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn read_u64(bytes: &[u8]) -> StoreResult<u64> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization("expected 8-byte counter".into()))?;
    Ok(u64::from_be_bytes(buf))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

impl MembershipStore for RocksStore {
    fn insert_group(&self, group: &Group, owner: &Membership) -> StoreResult<bool> {
        let _guard = self.stripe(group.id)?;
        let cf_groups = self.cf(CF_GROUPS)?;
        if self.db.get_cf(&cf_groups, group.id.as_bytes())?.is_some() {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_groups, group.id.as_bytes(), encode(group)?);
        batch.put_cf(&self.cf(CF_MEMBERS)?, member_key(group.id, owner.user_id), encode(owner)?);
        if let Some((seat, hold)) = owner.seat.hold_for(owner.user_id) {
            batch.put_cf(&self.cf(CF_SEATS)?, seat_key(group.id, seat), encode(&hold)?);
        }
        self.write(batch)?;
        Ok(true)
    }

    fn get_group(&self, group_id: Uuid) -> StoreResult<Option<Group>> {
        self.get(CF_GROUPS, group_id.as_bytes())
    }

    fn put_group(&self, group: &Group) -> StoreResult<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_GROUPS)?, group.id.as_bytes(), encode(group)?);
        self.write(batch)
    }

    fn list_groups(&self) -> StoreResult<Vec<Group>> {
        let cf = self.cf(CF_GROUPS)?;
        let mut groups = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            groups.push(decode::<Group>(&value)?);
        }
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    fn delete_group(&self, group_id: Uuid) -> StoreResult<bool> {
        let _guard = self.stripe(group_id)?;
        let cf_groups = self.cf(CF_GROUPS)?;
        if self.db.get_cf(&cf_groups, group_id.as_bytes())?.is_none() {
            return Ok(false);
        }

        let prefix = group_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_groups, prefix);
        self.delete_prefix(&mut batch, CF_MEMBERS, prefix)?;
        self.delete_prefix(&mut batch, CF_SEATS, prefix)?;
        self.delete_prefix(&mut batch, CF_MESSAGES, prefix)?;
        self.delete_prefix(&mut batch, CF_CLIENT_IDS, prefix)?;
        self.write(batch)?;
        Ok(true)
    }

    fn get_membership(&self, group_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>> {
        self.get(CF_MEMBERS, &member_key(group_id, user_id))
    }

    fn insert_membership(&self, membership: &Membership) -> StoreResult<bool> {
        let _guard = self.stripe(membership.group_id)?;
        let cf = self.cf(CF_MEMBERS)?;
        let key = member_key(membership.group_id, membership.user_id);
        if self.db.get_cf(&cf, &key)?.is_some() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, encode(membership)?);
        self.write(batch)?;
        Ok(true)
    }

    fn commit_membership(&self, before: &Membership, after: &Membership) -> StoreResult<SeatCommit> {
        let (group_id, user_id) = (before.group_id, before.user_id);
        let _guard = self.stripe(group_id)?;
        let key = member_key(group_id, user_id);
        if self.get::<Membership>(CF_MEMBERS, &key)?.as_ref() != Some(before) {
            return Ok(SeatCommit::RowChanged);
        }

        let old = before.seat.hold_for(user_id);
        let new = after.seat.hold_for(user_id);
        if let Some((seat, _)) = new.filter(|n| Some(*n) != old) {
            let current = self.seat_hold(group_id, seat)?;
            let available = seat_available(group_id, seat, user_id, current, |holder| {
                self.get_membership(group_id, holder)
            })?;
            if !available {
                return Ok(SeatCommit::SeatTaken);
            }
        }

        let cf_seats = self.cf(CF_SEATS)?;
        let mut batch = WriteBatch::default();
        if let Some((seat, hold)) = old {
            if self.seat_hold(group_id, seat)? == Some(hold) {
                batch.delete_cf(&cf_seats, seat_key(group_id, seat));
            }
        }
        if let Some((seat, hold)) = new {
            batch.put_cf(&cf_seats, seat_key(group_id, seat), encode(&hold)?);
        }
        batch.put_cf(&self.cf(CF_MEMBERS)?, &key, encode(after)?);
        self.write(batch)?;
        Ok(SeatCommit::Committed)
    }

    fn delete_membership(&self, group_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>> {
        let _guard = self.stripe(group_id)?;
        let key = member_key(group_id, user_id);
        let Some(existing) = self.get::<Membership>(CF_MEMBERS, &key)? else {
            return Ok(None);
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_MEMBERS)?, &key);
        if let Some((seat, hold)) = existing.seat.hold_for(user_id) {
            if self.seat_hold(group_id, seat)? == Some(hold) {
                batch.delete_cf(&self.cf(CF_SEATS)?, seat_key(group_id, seat));
            }
        }
        self.write(batch)?;
        Ok(Some(existing))
    }

    fn list_members(&self, group_id: Uuid) -> StoreResult<Vec<Membership>> {
        self.scan_prefix(CF_MEMBERS, group_id.as_bytes())?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    fn seat_hold(&self, group_id: Uuid, seat: Seat) -> StoreResult<Option<SeatHold>> {
        self.get(CF_SEATS, &seat_key(group_id, seat))
    }

    fn compare_and_set_seat(
        &self,
        group_id: Uuid,
        seat: Seat,
        expected: Option<SeatHold>,
        new: Option<SeatHold>,
    ) -> StoreResult<bool> {
        let _guard = self.stripe(group_id)?;
        let key = seat_key(group_id, seat);
        let current: Option<SeatHold> = self.get(CF_SEATS, &key)?;
        if current != expected {
            return Ok(false);
        }

        let cf = self.cf(CF_SEATS)?;
        let mut batch = WriteBatch::default();
        match new {
            Some(hold) => batch.put_cf(&cf, &key, encode(&hold)?),
            None => batch.delete_cf(&cf, &key),
        }
        self.write(batch)?;
        Ok(true)
    }
}

impl MessageStore for RocksStore {
    fn insert_message(&self, message: &Message) -> StoreResult<(Message, bool)> {
        let _guard = self.stripe(message.group_id)?;
        let cf_ids = self.cf(CF_CLIENT_IDS)?;
        let id_key = client_id_key(message.group_id, message.client_id);

        if let Some(msg_key) = self.db.get_cf(&cf_ids, &id_key)? {
            if let Some(existing) = self.message_by_key(&msg_key)? {
                return Ok((existing, false));
            }
        }

        // Persisting under the same lock keeps the stored counter monotonic.
        let _seq_guard = self.sequence_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let msg_key = message_key(message.group_id, seq);

        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_MESSAGES)?, &msg_key, encode(message)?);
        batch.put_cf(&cf_ids, &id_key, &msg_key);
        batch.put_cf(&self.cf(CF_META)?, META_MESSAGE_SEQ, (seq + 1).to_be_bytes());
        self.write(batch)?;
        Ok((message.clone(), true))
    }

    fn messages(&self, group_id: Uuid, limit: usize) -> StoreResult<Vec<Message>> {
        let cf = self.cf(CF_MESSAGES)?;
        let end_key = message_key(group_id, u64::MAX);
        let iter = self.db.iterator_cf(&cf, IteratorMode::From(&end_key, Direction::Reverse));

        let mut out = Vec::new();
        for item in iter {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(group_id.as_bytes()) {
                break;
            }
            out.push(decode::<Message>(&value)?);
        }
        out.reverse();
        Ok(out)
    }

    fn message_by_client_id(&self, group_id: Uuid, client_id: Uuid) -> StoreResult<Option<Message>> {
        let cf_ids = self.cf(CF_CLIENT_IDS)?;
        match self.db.get_cf(&cf_ids, client_id_key(group_id, client_id))? {
            Some(msg_key) => self.message_by_key(&msg_key),
            None => Ok(None),
        }
    }
}
