//! Durable storage for the ledger snapshot.
//!
//! The whole ledger (chain plus account table) is one record. Every
//! backend stores the same JSON document:
//!
//! ```json
//! { "chain": [ { "previousHash": "0", "transactions": [], "timestamp": 0, "hash": "…" } ],
//!   "pendingTransactions": [ { "fromAddress": "+1 555 0100", "balance": 60.0 } ] }
//! ```
//!
//! `pendingTransactions` is the account table; the name is kept for
//! compatibility with existing stores.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::types::{Account, AccountId, Block, HashError};

const SNAPSHOT_KEY: &str = "global:current";
const LEDGER_TREE: &str = "ledger";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// The persisted form of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub chain: Vec<Block>,
    #[serde(rename = "pendingTransactions", default, with = "account_table")]
    pub accounts: BTreeMap<AccountId, Account>,
}

impl LedgerSnapshot {
    /// A fresh ledger: one genesis block and no accounts.
    pub fn with_genesis() -> Result<Self, HashError> {
        Ok(LedgerSnapshot {
            chain: vec![Block::genesis()?],
            accounts: BTreeMap::new(),
        })
    }
}

/// The account table is persisted as a list and keyed by id in memory.
mod account_table {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::{Account, AccountId};

    pub fn serialize<S>(accounts: &BTreeMap<AccountId, Account>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(accounts.values())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<AccountId, Account>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let listed = Vec::<Account>::deserialize(deserializer)?;
        let mut accounts = BTreeMap::new();
        for account in listed {
            let id = account.id().clone();
            if accounts.insert(id.clone(), account).is_some() {
                return Err(D::Error::custom(format!("duplicate account {id}")));
            }
        }
        Ok(accounts)
    }
}

/// A place the ledger snapshot lives between process runs.
pub trait Storage: Send + Sync {
    /// Returns `None` when nothing has been stored yet, or the store is empty.
    fn load(&self) -> Result<Option<LedgerSnapshot>, StorageError>;
    /// Replaces the stored record. Must not return before the write is durable.
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StorageError>;
}

/// A single pretty-printed JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

impl Storage for JsonFileStorage {
    fn load(&self) -> Result<Option<LedgerSnapshot>, StorageError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "Ledger file not found");
                return Ok(None);
            }
            Err(e) => return Err(self.io_error(e)),
        };
        if data.trim().is_empty() {
            tracing::info!(path = %self.path.display(), "Ledger file is empty");
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec_pretty(snapshot)?;
        let parent = self.parent_dir();
        fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| self.io_error(e))?;
        tmp.write_all(&encoded).map_err(|e| self.io_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }
}

/// The same JSON record kept under one key of a sled database.
pub struct SledStorage {
    db: Db,
    ledger_tree: Tree,
}

impl SledStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            ledger_tree: db.open_tree(LEDGER_TREE)?,
            db,
        })
    }
}

impl Storage for SledStorage {
    fn load(&self) -> Result<Option<LedgerSnapshot>, StorageError> {
        match self.ledger_tree.get(SNAPSHOT_KEY)? {
            Some(encoded) if !encoded.is_empty() => Ok(Some(serde_json::from_slice(&encoded)?)),
            _ => Ok(None),
        }
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(snapshot)?;
        self.ledger_tree.insert(SNAPSHOT_KEY, encoded)?;
        self.db.flush()?;
        Ok(())
    }
}

/// In-process store holding the encoded record, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    record: Mutex<Option<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The encoded record as last saved.
    pub fn raw(&self) -> Option<Vec<u8>> {
        self.record.lock().clone()
    }

    /// Overwrite the encoded record, bypassing the ledger.
    pub fn replace_raw(&self, bytes: Vec<u8>) {
        *self.record.lock() = Some(bytes);
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Option<LedgerSnapshot>, StorageError> {
        match self.record.lock().as_deref() {
            Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => {
                Ok(Some(serde_json::from_slice(bytes)?))
            }
            _ => Ok(None),
        }
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(snapshot)?;
        *self.record.lock() = Some(encoded);
        Ok(())
    }
}
