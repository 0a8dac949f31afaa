//! The ledger: a hash-linked chain of blocks plus the account table.
//!
//! A single [`Ledger`] owns the in-memory state behind one lock. Every
//! mutation runs "check integrity → validate → mutate → append → persist"
//! while holding the write half, and is undone in memory if the snapshot
//! cannot be persisted. Reads take the read half, so a read started after a
//! write has returned always observes it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::audit::{self, BlockLogEntry, FlaggedTransaction, TransactionRecord};
use crate::storage::{LedgerSnapshot, Storage, StorageError};
use crate::types::{
    max_money, Account, AccountId, Amount, Block, BlockBuilder, ChainState, Digest, HashError,
    Transaction, TransactionKind, ValueError,
};

/// Log target for integrity alarms, distinct from per-request noise.
pub const ALARM_TARGET: &str = "ledgerchain::alarm";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("The chain is corrupted at block {index} ({fault}) and cannot process transactions.")]
    ChainCorrupted { index: usize, fault: IntegrityFault },
    #[error("Invalid account identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Account {0} already exists.")]
    AccountAlreadyExists(AccountId),
    #[error("Account {0} not found.")]
    AccountNotFound(String),
    #[error("Insufficient funds in {account}: balance {balance:.2}, requested {requested:.2}.")]
    InsufficientFunds {
        account: AccountId,
        balance: Decimal,
        requested: Decimal,
    },
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Transaction {0} has an unsupported type.")]
    UnsupportedTransaction(Digest),
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Hash error: {0}")]
    HashError(#[from] HashError),
}

/// Machine-checkable classification of a [`LedgerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ChainCorrupted,
    InvalidIdentifier,
    AccountAlreadyExists,
    AccountNotFound,
    InsufficientFunds,
    InvalidAmount,
    UnsupportedTransaction,
    Storage,
    Hash,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::ChainCorrupted { .. } => ErrorKind::ChainCorrupted,
            LedgerError::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            LedgerError::AccountAlreadyExists(_) => ErrorKind::AccountAlreadyExists,
            LedgerError::AccountNotFound(_) => ErrorKind::AccountNotFound,
            LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LedgerError::InvalidAmount(_) => ErrorKind::InvalidAmount,
            LedgerError::UnsupportedTransaction(_) => ErrorKind::UnsupportedTransaction,
            LedgerError::StorageError(_) => ErrorKind::Storage,
            LedgerError::HashError(_) => ErrorKind::Hash,
        }
    }

    /// Business-rule rejections, as opposed to faults of the ledger itself.
    fn is_rejection(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::ChainCorrupted | ErrorKind::Storage | ErrorKind::Hash
        )
    }
}

impl From<ValueError> for LedgerError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::InvalidIdentifier(raw) => LedgerError::InvalidIdentifier(raw),
            ValueError::InvalidAmount(reason) => LedgerError::InvalidAmount(reason),
        }
    }
}

/// Why a block failed the integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityFault {
    #[error("the chain has no genesis block")]
    MissingGenesis,
    #[error("the genesis block is malformed")]
    MalformedGenesis,
    #[error("transaction {position} does not match its digest")]
    TransactionAltered { position: usize },
    #[error("stored digest {stored} does not match computed digest {computed}")]
    BlockAltered { stored: Digest, computed: Digest },
    #[error("previous digest {found} does not match the preceding block's digest {expected}")]
    BrokenLink { expected: Digest, found: Digest },
    #[error("digest could not be recomputed: {0}")]
    Unhashable(String),
}

/// Result of walking the chain. Only the first failure is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainIntegrity {
    Intact,
    Broken { index: usize, fault: IntegrityFault },
}

impl ChainIntegrity {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainIntegrity::Intact)
    }

    pub fn failing_index(&self) -> Option<usize> {
        match self {
            ChainIntegrity::Intact => None,
            ChainIntegrity::Broken { index, .. } => Some(*index),
        }
    }
}

impl fmt::Display for ChainIntegrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainIntegrity::Intact => f.write_str("The chain is intact."),
            ChainIntegrity::Broken { index, fault } => write!(f, "Block {index} was altered: {fault}."),
        }
    }
}

/// Acknowledgement of a successful operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message: String,
    /// Digest of the appended block, when the operation appended one.
    pub digest: Option<Digest>,
}

/// Flat `{success, message, digest}` rendering of an operation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
    pub kind: Option<ErrorKind>,
    pub digest: Option<Digest>,
}

impl From<Result<Receipt, LedgerError>> for Outcome {
    fn from(result: Result<Receipt, LedgerError>) -> Self {
        match result {
            Ok(receipt) => Outcome {
                success: true,
                message: receipt.message,
                kind: None,
                digest: receipt.digest,
            },
            Err(err) => Outcome {
                success: false,
                message: err.to_string(),
                kind: Some(err.kind()),
                digest: None,
            },
        }
    }
}

pub struct Ledger<S: Storage + ?Sized> {
    storage: Arc<S>,
    state: RwLock<LedgerSnapshot>,
}

impl<S: Storage + ?Sized> Ledger<S> {
    /// Load the ledger from `storage`, or start a new chain with a genesis
    /// block (persisted immediately) when the store is absent or empty.
    ///
    /// No integrity check runs here; corruption surfaces on the next mutation.
    pub fn open(storage: Arc<S>) -> Result<Self, LedgerError> {
        let snapshot = match storage.load()? {
            Some(snapshot) if !snapshot.chain.is_empty() => {
                tracing::info!(
                    blocks = snapshot.chain.len(),
                    accounts = snapshot.accounts.len(),
                    "Ledger loaded"
                );
                snapshot
            }
            loaded => {
                let mut fresh = LedgerSnapshot::with_genesis()?;
                if let Some(existing) = loaded {
                    fresh.accounts = existing.accounts;
                }
                storage.save(&fresh)?;
                tracing::info!(
                    genesis = %fresh.chain[0].digest(),
                    "Chain initialized with genesis block"
                );
                fresh
            }
        };
        Ok(Ledger {
            storage,
            state: RwLock::new(snapshot),
        })
    }

    /// Recompute every digest and link, reporting the first failure.
    pub fn validate_chain(&self) -> ChainIntegrity {
        check_chain(&self.state.read().chain)
    }

    fn ensure_intact(chain: &[Block]) -> Result<(), LedgerError> {
        match check_chain(chain) {
            ChainIntegrity::Intact => Ok(()),
            ChainIntegrity::Broken { index, fault } => {
                tracing::error!(
                    target: ALARM_TARGET,
                    index,
                    %fault,
                    "Chain integrity check failed; refusing to mutate the ledger"
                );
                Err(LedgerError::ChainCorrupted { index, fault })
            }
        }
    }

    /// Open a zero-balance account. Not recorded on the chain.
    pub fn create_account(&self, id: &str) -> Result<Receipt, LedgerError> {
        let mut state = self.state.write();
        Self::ensure_intact(&state.chain)?;

        let id = AccountId::parse(id).inspect_err(|e| tracing::warn!("Account rejected: {e}"))?;
        if state.accounts.contains_key(&id) {
            tracing::warn!(account = %id, "Account already exists");
            return Err(LedgerError::AccountAlreadyExists(id));
        }

        state.accounts.insert(id.clone(), Account::new(id.clone()));
        if let Err(e) = self.storage.save(&state) {
            state.accounts.remove(&id);
            tracing::error!(account = %id, error = %e, "Failed to persist new account; rolled back");
            return Err(e.into());
        }

        tracing::info!(account = %id, "Account created");
        Ok(Receipt {
            message: format!("Account created for {id}."),
            digest: None,
        })
    }

    /// Credit `target` with new money on behalf of `admin`.
    ///
    /// Only `target` must exist; authorising `admin` is the caller's job.
    pub fn add_funds(&self, admin: &str, target: &str, amount: Decimal) -> Result<Receipt, LedgerError> {
        let amount = Amount::new(amount)?;
        let transaction = Transaction::new(
            AccountId::from_raw(admin),
            AccountId::from_raw(target),
            amount,
            TransactionKind::Fund,
        )?;
        self.submit(transaction)
    }

    /// Move `amount` from one existing account to another.
    pub fn transfer_funds(&self, from: &str, to: &str, amount: Decimal) -> Result<Receipt, LedgerError> {
        let amount = Amount::new(amount)?;
        let transaction = Transaction::new(
            AccountId::from_raw(from),
            AccountId::from_raw(to),
            amount,
            TransactionKind::Transfer,
        )?;
        self.submit(transaction)
    }

    /// Apply one transaction and append it to the chain in its own block.
    pub fn submit(&self, transaction: Transaction) -> Result<Receipt, LedgerError> {
        let mut state = self.state.write();
        Self::ensure_intact(&state.chain)?;

        let result = self.commit(&mut state, transaction);
        if let Err(e) = &result {
            if e.is_rejection() {
                tracing::warn!(kind = ?e.kind(), "Transaction rejected: {e}");
            }
        }
        result
    }

    fn commit(&self, state: &mut LedgerSnapshot, transaction: Transaction) -> Result<Receipt, LedgerError> {
        for id in [transaction.from_account(), transaction.to_account()] {
            if !id.is_well_formed() {
                return Err(LedgerError::InvalidIdentifier(id.to_string()));
            }
        }

        let message = match transaction.kind() {
            TransactionKind::Fund => format!(
                "Balance of {} increased by {:.2}.",
                transaction.to_account(),
                transaction.amount()
            ),
            TransactionKind::Transfer => format!(
                "Transfer of {:.2} to {} completed.",
                transaction.amount(),
                transaction.to_account()
            ),
            TransactionKind::Unrecognized => {
                return Err(LedgerError::UnsupportedTransaction(transaction.digest().clone()))
            }
        };
        let updates = plan_balances(&state.accounts, &transaction)?;

        let previous = state
            .chain
            .last()
            .map_or_else(Digest::genesis_marker, |tip| tip.digest().clone());
        let block = BlockBuilder::new(previous)
            .append_transaction(transaction)
            .finalize()?;
        let digest = block.digest().clone();

        let undo = set_balances(&mut state.accounts, updates);
        state.chain.push(block);
        if let Err(e) = self.storage.save(state) {
            state.chain.pop();
            set_balances(&mut state.accounts, undo);
            tracing::error!(error = %e, "Failed to persist ledger; transaction rolled back");
            return Err(e.into());
        }

        tracing::debug!(height = state.chain.len() - 1, %digest, "Block appended");
        Ok(Receipt {
            message,
            digest: Some(digest),
        })
    }

    pub fn account(&self, id: &str) -> Result<Account, LedgerError> {
        self.state
            .read()
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    pub fn has_account(&self, id: &str) -> bool {
        self.state.read().accounts.contains_key(id)
    }

    /// Balance of an existing account.
    pub fn balance(&self, id: &str) -> Result<Decimal, LedgerError> {
        self.state
            .read()
            .accounts
            .get(id)
            .map(Account::balance)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    /// Balance, or zero when the account does not exist.
    pub fn get_balance(&self, id: &str) -> Decimal {
        self.balance(id).unwrap_or(Decimal::ZERO)
    }

    /// Sum of all balances; grows only through funding.
    pub fn total_supply(&self) -> Decimal {
        self.state.read().accounts.values().map(Account::balance).sum()
    }

    pub fn chain_len(&self) -> usize {
        self.state.read().chain.len()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.state.read().chain.clone()
    }

    /// Snapshot of the account table, ordered by identifier.
    pub fn accounts(&self) -> Vec<Account> {
        self.state.read().accounts.values().cloned().collect()
    }

    /// Every transaction on the chain with the index of its block.
    pub fn history(&self) -> Vec<TransactionRecord> {
        audit::history(&self.state.read().chain)
    }

    pub fn block_log(&self) -> Vec<BlockLogEntry> {
        audit::block_log(&self.state.read().chain)
    }

    /// The history with each transaction assessed against the high-value
    /// fence of all amounts on the chain.
    pub fn flag_outliers(&self) -> Vec<FlaggedTransaction> {
        audit::flag_outliers(self.history())
    }

    pub fn chain_state(&self) -> ChainState {
        let state = self.state.read();
        ChainState {
            latest_block_hash: state
                .chain
                .last()
                .map_or_else(Digest::genesis_marker, |tip| tip.digest().clone()),
            latest_block_index: state.chain.len().saturating_sub(1) as u64,
            account_count: state.accounts.len(),
            total_supply: state.accounts.values().map(Account::balance).sum(),
        }
    }
}

/// New balances the transaction would produce, without touching the table.
fn plan_balances(
    accounts: &BTreeMap<AccountId, Account>,
    transaction: &Transaction,
) -> Result<Vec<(AccountId, Decimal)>, LedgerError> {
    let lookup = |id: &AccountId| {
        accounts
            .get(id)
            .map(Account::balance)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    };
    let amount = transaction.amount();
    let to = transaction.to_account();

    let mut updates = Vec::with_capacity(2);
    let to_balance = match transaction.kind() {
        TransactionKind::Fund => lookup(to)?,
        TransactionKind::Unrecognized => {
            return Err(LedgerError::UnsupportedTransaction(transaction.digest().clone()))
        }
        TransactionKind::Transfer => {
            let from = transaction.from_account();
            let from_balance = lookup(from)?;
            let to_balance = lookup(to)?;
            if from_balance < amount {
                return Err(LedgerError::InsufficientFunds {
                    account: from.clone(),
                    balance: from_balance,
                    requested: amount,
                });
            }
            updates.push((from.clone(), from_balance - amount));
            if from == to {
                from_balance - amount
            } else {
                to_balance
            }
        }
    };
    let credited = to_balance
        .checked_add(amount)
        .filter(|balance| *balance <= max_money())
        .ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "crediting {amount:.2} to {to} would exceed the largest balance {:.2}",
                max_money()
            ))
        })?;
    updates.push((to.clone(), credited));
    Ok(updates)
}

/// Write balances in order and return the previous values in reverse
/// order, so that feeding the result back in restores the table.
fn set_balances(
    accounts: &mut BTreeMap<AccountId, Account>,
    updates: Vec<(AccountId, Decimal)>,
) -> Vec<(AccountId, Decimal)> {
    let mut previous = Vec::with_capacity(updates.len());
    for (id, balance) in updates {
        if let Some(account) = accounts.get_mut(&id) {
            previous.push((id, account.balance()));
            account.set_balance(balance);
        }
    }
    previous.reverse();
    previous
}

fn check_chain(chain: &[Block]) -> ChainIntegrity {
    let Some(genesis) = chain.first() else {
        return ChainIntegrity::Broken {
            index: 0,
            fault: IntegrityFault::MissingGenesis,
        };
    };
    if !genesis.previous_digest().is_genesis_marker() || !genesis.transactions().is_empty() {
        return ChainIntegrity::Broken {
            index: 0,
            fault: IntegrityFault::MalformedGenesis,
        };
    }
    if let Err(fault) = check_block(genesis) {
        return ChainIntegrity::Broken { index: 0, fault };
    }

    for (index, pair) in chain.windows(2).enumerate().map(|(i, pair)| (i + 1, pair)) {
        let (previous, block) = (&pair[0], &pair[1]);
        if let Err(fault) = check_block(block) {
            return ChainIntegrity::Broken { index, fault };
        }
        if block.previous_digest() != previous.digest() {
            return ChainIntegrity::Broken {
                index,
                fault: IntegrityFault::BrokenLink {
                    expected: previous.digest().clone(),
                    found: block.previous_digest().clone(),
                },
            };
        }
    }
    ChainIntegrity::Intact
}

fn check_block(block: &Block) -> Result<(), IntegrityFault> {
    let unhashable = |e: HashError| IntegrityFault::Unhashable(e.to_string());
    for (position, tx) in block.transactions().iter().enumerate() {
        if tx.calculate_hash().map_err(unhashable)? != *tx.digest() {
            return Err(IntegrityFault::TransactionAltered { position });
        }
    }
    let computed = block.calculate_hash().map_err(unhashable)?;
    if computed != *block.digest() {
        return Err(IntegrityFault::BlockAltered {
            stored: block.digest().clone(),
            computed,
        });
    }
    Ok(())
}
