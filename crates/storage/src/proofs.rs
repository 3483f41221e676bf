use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use async_trait::async_trait;
use relay_types::{ChainId, ProofData, Update, GENESIS_PREV_SLOT};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProofStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("General error: {0}")]
    General(#[from] anyhow::Error),
    #[error("conflicting proof record already stored for slot {slot} on chain {chain}")]
    Conflict { slot: u64, chain: ChainId },
    #[error("slot {prev_slot} on chain {chain} already links to {existing}, refusing successor {slot}")]
    Fork {
        chain: ChainId,
        prev_slot: u64,
        existing: u64,
        slot: u64,
    },
}

impl ProofStoreError {
    /// Returns true for errors caused by contradicting chain content rather than storage failures.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Fork { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofRecord {
    pub update_slot: u64,
    pub prev_update_slot: u64,
    pub proof_bytes: Vec<u8>,
    pub public_inputs: Vec<u8>,
    pub merkle_tree_index: u32,
    pub format_version: u32,
    pub created_at: u64,
}

impl ProofRecord {
    pub fn new(update: &Update, proof: ProofData, chain: ChainId) -> Self {
        Self {
            update_slot: update.slot,
            prev_update_slot: update.prev_slot,
            proof_bytes: proof.proof,
            public_inputs: proof.public_inputs,
            merkle_tree_index: chain.merkle_tree_index,
            format_version: chain.format_version,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    pub fn chain(&self) -> ChainId {
        ChainId::new(self.merkle_tree_index, self.format_version)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_update_slot == GENESIS_PREV_SLOT
    }

    pub fn proof_data(&self) -> ProofData {
        ProofData::new(self.proof_bytes.clone(), self.public_inputs.clone())
    }

    /// Compares the chain content of two records, ignoring bookkeeping fields such as `created_at`.
    pub fn same_content(&self, other: &ProofRecord) -> bool {
        self.update_slot == other.update_slot
            && self.prev_update_slot == other.prev_update_slot
            && self.proof_bytes == other.proof_bytes
            && self.public_inputs == other.public_inputs
            && self.merkle_tree_index == other.merkle_tree_index
            && self.format_version == other.format_version
    }
}

/// ProofStore persists proof records together with the chain linkage index.
///
/// Records are keyed by `(update_slot, chain)` and are never overwritten. The linkage index maps a
/// predecessor slot to its successor so the chain can be walked forward with one lookup per step.
#[async_trait]
pub trait ProofStore: Send + Sync {
    /// Stores a record and its linkage atomically.
    ///
    /// Storing a record identical to the existing one is a no-op. A differing record for the same key
    /// fails with [`ProofStoreError::Conflict`], a second successor for the same predecessor with
    /// [`ProofStoreError::Fork`].
    async fn put(&self, record: &ProofRecord) -> Result<(), ProofStoreError>;

    async fn get(&self, update_slot: u64, chain: ChainId) -> Result<Option<ProofRecord>, ProofStoreError>;

    /// Returns the record whose `prev_update_slot` is `after_slot`.
    async fn get_next(&self, chain: ChainId, after_slot: u64) -> Result<Option<ProofRecord>, ProofStoreError>;

    async fn get_latest(&self, chain: ChainId) -> Result<Option<ProofRecord>, ProofStoreError>;

    /// Returns all records with `start <= update_slot <= end` in slot order.
    async fn get_range(&self, chain: ChainId, start: u64, end: u64) -> Result<Vec<ProofRecord>, ProofStoreError>;

    /// Returns the lowest-slot record with `start <= update_slot <= end`.
    async fn get_first_in_range(
        &self,
        chain: ChainId,
        start: u64,
        end: u64,
    ) -> Result<Option<ProofRecord>, ProofStoreError>;

    fn unsafe_reset(&mut self) -> Result<(), ProofStoreError>;
}

pub struct RocksDbProofStore {
    db: Arc<DB>,
    write_lock: Mutex<()>,
}

const CF_PROOFS: &str = "proofs";
const CF_CHAIN_INDEX: &str = "chain_index";

impl RocksDbProofStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, ProofStoreError> {
        let db_path = base_path.as_ref().join("proofs.db");

        let opts = Self::get_opts();
        let db = DB::open_cf_descriptors(&opts, db_path, Self::get_cfs())?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn get_opts() -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts
    }

    fn get_cfs() -> Vec<ColumnFamilyDescriptor> {
        vec![
            ColumnFamilyDescriptor::new(CF_PROOFS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CHAIN_INDEX, Options::default()),
        ]
    }

    fn get_cf(&self, name: &str) -> Result<&ColumnFamily, ProofStoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("Column family {name} not found").into())
    }

    fn serialize<T: Serialize>(&self, data: &T) -> Result<Vec<u8>, ProofStoreError> {
        Ok(bincode::serialize(data)?)
    }

    fn deserialize<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T, ProofStoreError> {
        Ok(bincode::deserialize(data)?)
    }

    fn slot_key(&self, chain: ChainId, slot: u64) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&chain.to_prefix());
        key[8..].copy_from_slice(&slot.to_be_bytes());
        key
    }

    fn decode_slot(&self, bytes: &[u8]) -> Result<u64, ProofStoreError> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| ProofStoreError::General(anyhow!("invalid chain index entry length {}", bytes.len())))?;
        Ok(u64::from_be_bytes(arr))
    }

    fn read_record(&self, chain: ChainId, slot: u64) -> Result<Option<ProofRecord>, ProofStoreError> {
        let cf = self.get_cf(CF_PROOFS)?;
        match self.db.get_cf(cf, self.slot_key(chain, slot))? {
            Some(data) => Ok(Some(self.deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn read_successor(&self, chain: ChainId, prev_slot: u64) -> Result<Option<u64>, ProofStoreError> {
        let cf = self.get_cf(CF_CHAIN_INDEX)?;
        match self.db.get_cf(cf, self.slot_key(chain, prev_slot))? {
            Some(bytes) => Ok(Some(self.decode_slot(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProofStore for RocksDbProofStore {
    async fn put(&self, record: &ProofRecord) -> Result<(), ProofStoreError> {
        let chain = record.chain();
        let value = self.serialize(record)?;

        // check-then-write must not interleave with another put
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow!("Failed to acquire write lock: {e}"))?;

        if let Some(existing) = self.read_record(chain, record.update_slot)? {
            if existing.same_content(record) {
                debug!(slot = record.update_slot, %chain, "proof record already stored");
                return Ok(());
            }
            return Err(ProofStoreError::Conflict {
                slot: record.update_slot,
                chain,
            });
        }

        if let Some(existing) = self.read_successor(chain, record.prev_update_slot)? {
            if existing != record.update_slot {
                return Err(ProofStoreError::Fork {
                    chain,
                    prev_slot: record.prev_update_slot,
                    existing,
                    slot: record.update_slot,
                });
            }
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(self.get_cf(CF_PROOFS)?, self.slot_key(chain, record.update_slot), value);
        batch.put_cf(
            self.get_cf(CF_CHAIN_INDEX)?,
            self.slot_key(chain, record.prev_update_slot),
            record.update_slot.to_be_bytes(),
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, update_slot: u64, chain: ChainId) -> Result<Option<ProofRecord>, ProofStoreError> {
        self.read_record(chain, update_slot)
    }

    async fn get_next(&self, chain: ChainId, after_slot: u64) -> Result<Option<ProofRecord>, ProofStoreError> {
        match self.read_successor(chain, after_slot)? {
            Some(slot) => self.read_record(chain, slot),
            None => Ok(None),
        }
    }

    async fn get_latest(&self, chain: ChainId) -> Result<Option<ProofRecord>, ProofStoreError> {
        let cf = self.get_cf(CF_PROOFS)?;
        let prefix = chain.to_prefix();
        let last_key = self.slot_key(chain, u64::MAX);

        let mut iter = self.db.iterator_cf(cf, IteratorMode::From(&last_key, Direction::Reverse));
        if let Some(item) = iter.next() {
            let (key, value) = item?;
            if key.starts_with(&prefix) {
                return Ok(Some(self.deserialize(&value)?));
            }
        }

        Ok(None)
    }

    async fn get_range(&self, chain: ChainId, start: u64, end: u64) -> Result<Vec<ProofRecord>, ProofStoreError> {
        let cf = self.get_cf(CF_PROOFS)?;
        let start_key = self.slot_key(chain, start);
        let end_key = self.slot_key(chain, end);

        let mut results = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if key.as_ref() > end_key.as_slice() {
                break;
            }

            results.push(self.deserialize(&value)?);
        }

        Ok(results)
    }

    async fn get_first_in_range(
        &self,
        chain: ChainId,
        start: u64,
        end: u64,
    ) -> Result<Option<ProofRecord>, ProofStoreError> {
        let cf = self.get_cf(CF_PROOFS)?;
        let start_key = self.slot_key(chain, start);
        let end_key = self.slot_key(chain, end);

        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if key.as_ref() > end_key.as_slice() {
                    return Ok(None);
                }
                Ok(Some(self.deserialize(&value)?))
            }
            None => Ok(None),
        }
    }

    fn unsafe_reset(&mut self) -> Result<(), ProofStoreError> {
        let db = Arc::get_mut(&mut self.db).ok_or_else(|| ProofStoreError::General(anyhow!("storage is shared")))?;

        let opts = Self::get_opts();
        for cf in Self::get_cfs() {
            db.drop_cf(cf.name()).ok();
            db.create_cf(cf.name(), &opts)?;
        }

        Ok(())
    }
}

/// Testing utilities for ProofStore implementations.
///
/// This module provides an in-memory mock implementation of ProofStore
/// that can be used in tests across all crates that depend on the storage trait.
pub mod testing {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    /// In-memory implementation of ProofStore for testing.
    ///
    /// Mirrors the conflict and fork checks of the RocksDB backend.
    pub struct MockProofStore {
        records: Mutex<BTreeMap<(ChainId, u64), ProofRecord>>,
        chain_index: Mutex<HashMap<(ChainId, u64), u64>>,
    }

    impl MockProofStore {
        pub fn new() -> Self {
            Self {
                records: Mutex::new(BTreeMap::new()),
                chain_index: Mutex::new(HashMap::new()),
            }
        }

        /// Replaces a stored record without any checks, e.g. to simulate on-disk corruption.
        pub fn overwrite_record(&self, record: ProofRecord) {
            let chain = record.chain();
            self.chain_index
                .lock()
                .unwrap()
                .insert((chain, record.prev_update_slot), record.update_slot);
            self.records.lock().unwrap().insert((chain, record.update_slot), record);
        }

        pub fn len(&self) -> usize {
            self.records.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl Default for MockProofStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProofStore for MockProofStore {
        async fn put(&self, record: &ProofRecord) -> Result<(), ProofStoreError> {
            let chain = record.chain();
            let mut records = self.records.lock().unwrap();
            let mut index = self.chain_index.lock().unwrap();

            if let Some(existing) = records.get(&(chain, record.update_slot)) {
                if existing.same_content(record) {
                    return Ok(());
                }
                return Err(ProofStoreError::Conflict {
                    slot: record.update_slot,
                    chain,
                });
            }

            if let Some(&existing) = index.get(&(chain, record.prev_update_slot)) {
                if existing != record.update_slot {
                    return Err(ProofStoreError::Fork {
                        chain,
                        prev_slot: record.prev_update_slot,
                        existing,
                        slot: record.update_slot,
                    });
                }
            }

            index.insert((chain, record.prev_update_slot), record.update_slot);
            records.insert((chain, record.update_slot), record.clone());
            Ok(())
        }

        async fn get(&self, update_slot: u64, chain: ChainId) -> Result<Option<ProofRecord>, ProofStoreError> {
            Ok(self.records.lock().unwrap().get(&(chain, update_slot)).cloned())
        }

        async fn get_next(&self, chain: ChainId, after_slot: u64) -> Result<Option<ProofRecord>, ProofStoreError> {
            let next = self.chain_index.lock().unwrap().get(&(chain, after_slot)).copied();
            match next {
                Some(slot) => self.get(slot, chain).await,
                None => Ok(None),
            }
        }

        async fn get_latest(&self, chain: ChainId) -> Result<Option<ProofRecord>, ProofStoreError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .range((chain, 0)..=(chain, u64::MAX))
                .next_back()
                .map(|(_, record)| record.clone()))
        }

        async fn get_range(&self, chain: ChainId, start: u64, end: u64) -> Result<Vec<ProofRecord>, ProofStoreError> {
            if start > end {
                return Ok(Vec::new());
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .range((chain, start)..=(chain, end))
                .map(|(_, record)| record.clone())
                .collect())
        }

        async fn get_first_in_range(
            &self,
            chain: ChainId,
            start: u64,
            end: u64,
        ) -> Result<Option<ProofRecord>, ProofStoreError> {
            if start > end {
                return Ok(None);
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .range((chain, start)..=(chain, end))
                .next()
                .map(|(_, record)| record.clone()))
        }

        fn unsafe_reset(&mut self) -> Result<(), ProofStoreError> {
            self.records.lock().unwrap().clear();
            self.chain_index.lock().unwrap().clear();
            Ok(())
        }
    }
}
