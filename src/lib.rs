// src/lib.rs

pub mod types;
pub mod storage;
pub mod ledger;
pub mod config;
pub mod audit;

pub use audit::{Assessment, BlockLogEntry, FlaggedTransaction, TransactionRecord};
pub use ledger::{ChainIntegrity, ErrorKind, Ledger, LedgerError, Outcome, Receipt};
pub use storage::{JsonFileStorage, LedgerSnapshot, MemoryStorage, SledStorage, Storage};
pub use types::{Account, AccountId, Amount, Block, Digest, Transaction, TransactionKind};
