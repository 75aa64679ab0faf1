//! Persistent storage for chain data.
//!
//! Provides a `Storage` trait and a sled-backed implementation covering the
//! five required stores: the participant registry, the block DAG (keyed by
//! block hash), the unspent-output set, finality checkpoints, and the
//! reputation event log (durable append + point lookup).
//!
//! Detected corruption is fatal by design: the node aborts with exit code 3
//! rather than serving damaged state.

use crate::block::{Block, BlockId};
use crate::consensus::checkpoint::Checkpoint;
use crate::crypto::keys::SigningPublicKey;
use crate::reputation::ReputationEvent;
use crate::transaction::{OutputId, UtxoEntry};
use crate::Hash;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage corruption: {0}")]
    Corruption(String),
    #[error("record not found")]
    NotFound,
    #[error("storage write failed: {0}")]
    WriteFailed(String),
}

/// Trait for persistent storage backends.
pub trait Storage {
    fn put_block(&self, block: &Block) -> Result<(), StorageError>;
    fn get_block(&self, id: &BlockId) -> Result<Option<Block>, StorageError>;
    fn has_block(&self, id: &BlockId) -> Result<bool, StorageError>;
    /// Every stored block, for startup replay (order unspecified).
    fn all_blocks(&self) -> Result<Vec<Block>, StorageError>;

    fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;
    fn get_checkpoint(&self, id: &Hash) -> Result<Option<Checkpoint>, StorageError>;
    /// The tip of the canonical checkpoint chain.
    fn put_checkpoint_tip(&self, id: &Hash) -> Result<(), StorageError>;
    fn get_checkpoint_tip(&self) -> Result<Option<Hash>, StorageError>;

    fn put_utxo(&self, id: &OutputId, entry: &UtxoEntry) -> Result<(), StorageError>;
    fn get_utxo(&self, id: &OutputId) -> Result<Option<UtxoEntry>, StorageError>;
    fn delete_utxo(&self, id: &OutputId) -> Result<(), StorageError>;

    fn put_participant(&self, key: &SigningPublicKey) -> Result<(), StorageError>;
    fn get_participant(&self, id: &Hash) -> Result<Option<SigningPublicKey>, StorageError>;

    /// Durable append; the sequence number orders replay.
    fn append_reputation_event(
        &self,
        sequence: u64,
        event: &ReputationEvent,
    ) -> Result<(), StorageError>;
    fn reputation_events(&self) -> Result<Vec<ReputationEvent>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

/// Sled-backed storage implementation.
pub struct SledStorage {
    db: sled::Db,
    blocks: sled::Tree,
    checkpoints: sled::Tree,
    utxo: sled::Tree,
    registry: sled::Tree,
    reputation_log: sled::Tree,
    meta: sled::Tree,
}

impl SledStorage {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| StorageError::WriteFailed(e.to_string()))
        };
        Ok(SledStorage {
            blocks: tree("blocks")?,
            checkpoints: tree("checkpoints")?,
            utxo: tree("utxo")?,
            registry: tree("registry")?,
            reputation_log: tree("reputation_log")?,
            meta: tree("meta")?,
            db,
        })
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(value).map_err(|e| StorageError::WriteFailed(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
        bincode::deserialize(bytes).map_err(|e| StorageError::Corruption(e.to_string()))
    }
}

impl Storage for SledStorage {
    fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        // Blocks persist in their canonical wire form, so what is stored is
        // exactly what was hashed and signed.
        self.blocks
            .insert(block.id().0, block.encode())
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn get_block(&self, id: &BlockId) -> Result<Option<Block>, StorageError> {
        match self
            .blocks
            .get(id.0)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?
        {
            Some(bytes) => Block::decode_exact(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corruption(e.to_string())),
            None => Ok(None),
        }
    }

    fn has_block(&self, id: &BlockId) -> Result<bool, StorageError> {
        self.blocks
            .contains_key(id.0)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))
    }

    fn all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        for item in self.blocks.iter() {
            let (_, bytes) = item.map_err(|e| StorageError::Corruption(e.to_string()))?;
            blocks.push(
                Block::decode_exact(&bytes).map_err(|e| StorageError::Corruption(e.to_string()))?,
            );
        }
        Ok(blocks)
    }

    fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.checkpoints
            .insert(checkpoint.id(), checkpoint.encode())
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn get_checkpoint(&self, id: &Hash) -> Result<Option<Checkpoint>, StorageError> {
        match self
            .checkpoints
            .get(id)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?
        {
            Some(bytes) => Checkpoint::decode_exact(&bytes)
                .map(Some)
                .ok_or_else(|| StorageError::Corruption("checkpoint encoding".into())),
            None => Ok(None),
        }
    }

    fn put_checkpoint_tip(&self, id: &Hash) -> Result<(), StorageError> {
        self.meta
            .insert(b"checkpoint_tip", &id[..])
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn get_checkpoint_tip(&self) -> Result<Option<Hash>, StorageError> {
        match self
            .meta
            .get(b"checkpoint_tip")
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?
        {
            Some(bytes) => bytes
                .as_ref()
                .try_into()
                .map(Some)
                .map_err(|_| StorageError::Corruption("checkpoint tip length".into())),
            None => Ok(None),
        }
    }

    fn put_utxo(&self, id: &OutputId, entry: &UtxoEntry) -> Result<(), StorageError> {
        self.utxo
            .insert(id.0, Self::encode(entry)?)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn get_utxo(&self, id: &OutputId) -> Result<Option<UtxoEntry>, StorageError> {
        match self
            .utxo
            .get(id.0)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?
        {
            Some(bytes) => Self::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn delete_utxo(&self, id: &OutputId) -> Result<(), StorageError> {
        self.utxo
            .remove(id.0)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn put_participant(&self, key: &SigningPublicKey) -> Result<(), StorageError> {
        self.registry
            .insert(key.fingerprint(), key.as_bytes())
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn get_participant(&self, id: &Hash) -> Result<Option<SigningPublicKey>, StorageError> {
        match self
            .registry
            .get(id)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?
        {
            Some(bytes) => SigningPublicKey::from_bytes(bytes.to_vec())
                .map(Some)
                .ok_or_else(|| StorageError::Corruption("registry key size".into())),
            None => Ok(None),
        }
    }

    fn append_reputation_event(
        &self,
        sequence: u64,
        event: &ReputationEvent,
    ) -> Result<(), StorageError> {
        self.reputation_log
            .insert(sequence.to_be_bytes(), Self::encode(event)?)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn reputation_events(&self) -> Result<Vec<ReputationEvent>, StorageError> {
        let mut events = Vec::new();
        for item in self.reputation_log.iter() {
            let (_, bytes) = item.map_err(|e| StorageError::Corruption(e.to_string()))?;
            events.push(Self::decode(&bytes)?);
        }
        Ok(events)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SigningKeypair;
    use crate::dag::DagStore;
    use crate::reputation::ReputationEventKind;
    use crate::temporal::clock::UtcInstant;
    use crate::transaction::PrivacyTier;

    fn temp_storage() -> SledStorage {
        SledStorage::open_temporary().unwrap()
    }

    #[test]
    fn block_roundtrip_bit_identical() {
        let storage = temp_storage();
        let block = DagStore::genesis_block();
        let id = block.id();
        storage.put_block(&block).unwrap();
        let retrieved = storage.get_block(&id).unwrap().unwrap();
        assert_eq!(retrieved.encode(), block.encode());
        assert!(storage.has_block(&id).unwrap());
    }

    #[test]
    fn block_not_found() {
        let storage = temp_storage();
        let id = BlockId([99u8; 32]);
        assert!(storage.get_block(&id).unwrap().is_none());
        assert!(!storage.has_block(&id).unwrap());
    }

    #[test]
    fn checkpoint_roundtrip_and_tip() {
        let storage = temp_storage();
        let cp = Checkpoint {
            window: 3,
            boundary: UtcInstant::new(240, 0),
            block_root: crate::sha3(b"root"),
            block_count: 2,
            heartbeat_count: 4,
            heartbeat_root: crate::sha3(b"hb"),
            vdf_work: 1 << 24,
            prev: Checkpoint::genesis_seed(),
        };
        let id = cp.id();
        storage.put_checkpoint(&cp).unwrap();
        storage.put_checkpoint_tip(&id).unwrap();
        assert_eq!(storage.get_checkpoint(&id).unwrap().unwrap(), cp);
        assert_eq!(storage.get_checkpoint_tip().unwrap(), Some(id));
    }

    #[test]
    fn utxo_lifecycle() {
        let storage = temp_storage();
        let id = OutputId(crate::sha3(b"out"));
        let entry = UtxoEntry {
            owner: crate::sha3(b"owner"),
            amount: 42,
            tier: PrivacyTier::T1,
            birth: UtcInstant::new(60, 0),
        };
        storage.put_utxo(&id, &entry).unwrap();
        let got = storage.get_utxo(&id).unwrap().unwrap();
        assert_eq!(got.amount, 42);
        assert_eq!(got.tier, PrivacyTier::T1);
        storage.delete_utxo(&id).unwrap();
        assert!(storage.get_utxo(&id).unwrap().is_none());
    }

    #[test]
    fn participant_registry_roundtrip() {
        let storage = temp_storage();
        let kp = SigningKeypair::generate();
        storage.put_participant(&kp.public).unwrap();
        let got = storage
            .get_participant(&kp.public.fingerprint())
            .unwrap()
            .unwrap();
        assert_eq!(got.as_bytes(), kp.public.as_bytes());
    }

    #[test]
    fn reputation_log_appends_in_order() {
        let storage = temp_storage();
        let pid = crate::sha3(b"participant");
        for seq in 0..5u64 {
            let event = ReputationEvent::new(
                pid,
                ReputationEventKind::UptimeTick { seconds: seq },
                seq as i64,
            );
            storage.append_reputation_event(seq, &event).unwrap();
        }
        let events = storage.reputation_events().unwrap();
        assert_eq!(events.len(), 5);
        for (seq, event) in events.iter().enumerate() {
            match event.kind {
                ReputationEventKind::UptimeTick { seconds } => {
                    assert_eq!(seconds, seq as u64)
                }
                _ => panic!("wrong event kind"),
            }
        }
    }

    #[test]
    fn flush_succeeds() {
        temp_storage().flush().unwrap();
    }
}
