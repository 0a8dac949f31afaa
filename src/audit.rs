//! Read-only reports over the chain: transaction history, the block log and
//! a high-value outlier flag.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::types::{AccountId, Block, Digest, TransactionKind};

/// Fewest transactions the outlier fence is computed over.
pub const MIN_OUTLIER_SAMPLE: usize = 4;

const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One transaction together with the block that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub block_index: usize,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub timestamp: String,
    pub digest: Digest,
}

impl fmt::Display for TransactionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TransactionKind::Fund => "add",
            TransactionKind::Transfer => "transfer",
            TransactionKind::Unrecognized => "unrecognized",
        };
        write!(
            f,
            "#{} {} {} -> {} {:.2} at {} ({})",
            self.block_index, kind, self.from, self.to, self.amount, self.timestamp, self.digest
        )
    }
}

/// Block header as shown in the block log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLogEntry {
    pub index: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub digest: Digest,
    pub previous_digest: Digest,
}

impl fmt::Display for BlockLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block {}: Timestamp: ", self.index)?;
        match self.created_at {
            Some(at) => write!(f, "{}", at.format(LOG_TIME_FORMAT))?,
            None => f.write_str("out of range")?,
        }
        write!(f, ", Hash: {}, Previous Hash: {}", self.digest, self.previous_digest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Normal,
    /// Amount lies above the upper fence of the amounts on the chain.
    HighValue,
}

impl fmt::Display for Assessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assessment::Normal => f.write_str("normal"),
            Assessment::HighValue => f.write_str("suspicious: unusually high amount"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlaggedTransaction {
    pub record: TransactionRecord,
    pub assessment: Assessment,
}

/// Every transaction on the chain, oldest first.
pub fn history(chain: &[Block]) -> Vec<TransactionRecord> {
    chain
        .iter()
        .enumerate()
        .flat_map(|(block_index, block)| {
            block.transactions().iter().map(move |tx| TransactionRecord {
                block_index,
                from: tx.from_account().clone(),
                to: tx.to_account().clone(),
                amount: tx.amount(),
                kind: tx.kind(),
                timestamp: tx.timestamp().to_string(),
                digest: tx.digest().clone(),
            })
        })
        .collect()
}

pub fn block_log(chain: &[Block]) -> Vec<BlockLogEntry> {
    chain
        .iter()
        .enumerate()
        .map(|(index, block)| BlockLogEntry {
            index,
            created_at: Utc.timestamp_millis_opt(block.created_at_ms()).single(),
            digest: block.digest().clone(),
            previous_digest: block.previous_digest().clone(),
        })
        .collect()
}

/// Upper Tukey fence `Q3 + 1.5 * IQR`, with quartiles taken as the medians
/// of the lower and upper halves. `None` below [`MIN_OUTLIER_SAMPLE`].
pub fn high_value_fence(amounts: &[Decimal]) -> Option<Decimal> {
    if amounts.len() < MIN_OUTLIER_SAMPLE {
        return None;
    }
    let mut sorted = amounts.to_vec();
    sorted.sort();
    let half = sorted.len() / 2;
    let q1 = median(&sorted[..half]);
    let q3 = median(&sorted[sorted.len() - half..]);
    Some(q3 + (q3 - q1) * Decimal::new(15, 1))
}

fn median(sorted: &[Decimal]) -> Decimal {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / Decimal::TWO
    }
}

/// Assess every record against the fence of all recorded amounts.
pub fn flag_outliers(records: Vec<TransactionRecord>) -> Vec<FlaggedTransaction> {
    let amounts: Vec<Decimal> = records.iter().map(|r| r.amount).collect();
    let fence = high_value_fence(&amounts);
    records
        .into_iter()
        .map(|record| {
            let assessment = match fence {
                Some(fence) if record.amount > fence => Assessment::HighValue,
                _ => Assessment::Normal,
            };
            FlaggedTransaction { record, assessment }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Amount, BlockBuilder, Transaction};
    use rust_decimal_macros::dec;

    fn chain_of(amounts: &[Decimal]) -> Vec<Block> {
        let mut chain = vec![Block::genesis().unwrap()];
        for amount in amounts {
            let tx = Transaction::new(
                AccountId::parse("556784229414").unwrap(),
                AccountId::parse("+1 555 0100").unwrap(),
                Amount::new(*amount).unwrap(),
                TransactionKind::Fund,
            )
            .unwrap();
            let previous = chain.last().unwrap().digest().clone();
            chain.push(BlockBuilder::new(previous).append_transaction(tx).finalize().unwrap());
        }
        chain
    }

    #[test]
    fn test_history_walks_every_block() {
        let chain = chain_of(&[dec!(10), dec!(20.5)]);
        let records = history(&chain);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].block_index, 1);
        assert_eq!(records[1].block_index, 2);
        assert_eq!(records[1].amount, dec!(20.5));
        assert_eq!(records[1].digest, *chain[2].transactions()[0].digest());
        assert!(records[0].to_string().starts_with("#1 add 556784229414 -> +1 555 0100 10.00"));
    }

    #[test]
    fn test_block_log_lines() {
        let chain = chain_of(&[dec!(1)]);
        let log = block_log(&chain);
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].previous_digest, *chain[0].digest());
        assert!(log[0].previous_digest.is_genesis_marker());

        let line = log[1].to_string();
        let expected_time = log[1].created_at.unwrap().format(LOG_TIME_FORMAT).to_string();
        assert_eq!(
            line,
            format!(
                "Block 1: Timestamp: {expected_time}, Hash: {}, Previous Hash: {}",
                chain[1].digest(),
                chain[0].digest()
            )
        );
    }

    #[test]
    fn test_fence_needs_enough_samples() {
        assert_eq!(high_value_fence(&[dec!(1), dec!(2), dec!(500)]), None);
        // halves [9, 10, 10] and [11, 12, 500]: Q1 = 10, Q3 = 12
        assert_eq!(
            high_value_fence(&[dec!(10), dec!(12), dec!(11), dec!(9), dec!(10), dec!(500)]),
            Some(dec!(15))
        );
    }

    #[test]
    fn test_only_high_values_are_flagged() {
        let chain = chain_of(&[dec!(10), dec!(12), dec!(11), dec!(9), dec!(10), dec!(500)]);
        let flagged = flag_outliers(history(&chain));
        let high: Vec<_> = flagged
            .iter()
            .filter(|f| f.assessment == Assessment::HighValue)
            .map(|f| f.record.amount)
            .collect();
        assert_eq!(high, vec![dec!(500)]);
        assert_eq!(flagged.len(), 6);

        let small = flag_outliers(history(&chain_of(&[dec!(1), dec!(1000)])));
        assert!(small.iter().all(|f| f.assessment == Assessment::Normal));
    }
}
