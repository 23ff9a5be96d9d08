//! The indexer contract and the pieces all four indexers share: adaptive
//! range sizing, the runner that drives one indexer against the chain head,
//! and chain-context storage (blocks before transactions, transactions
//! before anything derived from them).

pub mod erc20_721;
pub mod internal_txs;
pub mod proxy_factory;
pub mod safe_events;

use {
    crate::{conv, metrics::Metrics},
    alloy_rpc_types::Log,
    alloy_sol_types::SolEvent,
    anyhow::Result,
    chrono::DateTime,
    database::{PgTransaction, blocks, transactions},
    ethrpc::{BlockHeader, CurrentBlockWatcher, Rpc, RpcError, TransactionWithReceipt},
    std::{collections::HashSet, ops::RangeInclusive, sync::Arc},
    tokio::sync::Mutex,
};

/// Decodes a typed event out of an RPC log, `None` when topics or data do
/// not match.
pub(crate) fn decode_event<E: SolEvent>(log: &Log) -> Option<E> {
    E::decode_raw_log(log.inner.topics().iter().copied(), &log.inner.data.data).ok()
}

pub type BlockRange = RangeInclusive<u64>;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The provider rejected the query for its size; retry with a smaller
    /// range.
    #[error("provider rejected the block range")]
    RangeTooLarge,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RpcError> for IndexError {
    fn from(err: RpcError) -> Self {
        if err.is_too_large() {
            Self::RangeTooLarge
        } else {
            Self::Other(err.into())
        }
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        Self::Other(err.into())
    }
}

/// One of the four indexers. `index_range` fetches, processes and advances
/// the cursor as a single transactional step; when it errors the cursor
/// stays put and the next tick retries.
#[async_trait::async_trait]
pub trait Indexer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Everything up to and including this block has been indexed.
    async fn last_indexed_block(&self) -> Result<u64>;

    async fn index_range(&self, range: BlockRange) -> Result<(), IndexError>;
}

/// Block batch size that adapts to what the provider tolerates: halved on
/// oversize rejections, doubled back after consecutive successes.
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveLimit {
    current: u64,
    max: u64,
    consecutive_successes: u32,
    successes_to_grow: u32,
}

impl AdaptiveLimit {
    pub fn new(initial: u64, max: u64) -> Self {
        Self {
            current: initial.clamp(1, max),
            max,
            consecutive_successes: 0,
            successes_to_grow: 3,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn on_success(&mut self) {
        self.consecutive_successes += 1;
        if self.consecutive_successes >= self.successes_to_grow && self.current < self.max {
            self.current = (self.current * 2).min(self.max);
            self.consecutive_successes = 0;
        }
    }

    pub fn on_too_large(&mut self) {
        self.consecutive_successes = 0;
        self.current = (self.current / 2).max(1);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    /// Cursor is at the head already.
    UpToDate,
    Indexed { from: u64, to: u64 },
    /// Provider pushed back; the range shrank and the tick ends.
    Shrunk { new_limit: u64 },
}

/// Drives one indexer against the current chain head.
pub struct IndexerRunner {
    indexer: Arc<dyn Indexer>,
    current_block: CurrentBlockWatcher,
    limit: Mutex<AdaptiveLimit>,
}

impl IndexerRunner {
    pub fn new(
        indexer: Arc<dyn Indexer>,
        current_block: CurrentBlockWatcher,
        initial_limit: u64,
        max_limit: u64,
    ) -> Self {
        Self {
            indexer,
            current_block,
            limit: Mutex::new(AdaptiveLimit::new(initial_limit, max_limit)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.indexer.name()
    }

    pub async fn run_once(&self) -> Result<RunOutcome> {
        let head = self.current_block.borrow().number;
        let from = self.indexer.last_indexed_block().await? + 1;
        if from > head {
            return Ok(RunOutcome::UpToDate);
        }
        let limit = self.limit.lock().await.current();
        let to = head.min(from + limit - 1);

        match self.indexer.index_range(from..=to).await {
            Ok(()) => {
                self.limit.lock().await.on_success();
                let metrics = Metrics::get();
                metrics
                    .last_indexed_block
                    .with_label_values(&[self.name()])
                    .set(conv::db_block(to));
                metrics
                    .indexed_blocks
                    .with_label_values(&[self.name()])
                    .inc_by(to - from + 1);
                tracing::debug!(indexer = self.name(), from, to, "indexed range");
                Ok(RunOutcome::Indexed { from, to })
            }
            Err(IndexError::RangeTooLarge) => {
                let mut limit = self.limit.lock().await;
                limit.on_too_large();
                Metrics::get()
                    .range_shrinks
                    .with_label_values(&[self.name()])
                    .inc();
                tracing::info!(
                    indexer = self.name(),
                    new_limit = limit.current(),
                    "provider rejected range, shrinking"
                );
                Ok(RunOutcome::Shrunk {
                    new_limit: limit.current(),
                })
            }
            Err(IndexError::Other(err)) => Err(err),
        }
    }
}

/// Stores the blocks and receipts backing a set of transaction hashes.
/// Insertion order honors the ownership chain: a block precedes its
/// transactions, a transaction precedes its logs, traces and transfers.
pub(crate) async fn store_chain_context(
    rpc: &Rpc,
    ex: &mut PgTransaction<'_>,
    tx_hashes: &HashSet<alloy_primitives::B256>,
) -> Result<(), IndexError> {
    let hashes: Vec<_> = tx_hashes.iter().copied().collect();
    let receipts = rpc.transaction_receipts(&hashes).await?;

    let block_numbers: HashSet<u64> = receipts.iter().map(|tx| tx.block_number).collect();
    let mut headers: Vec<BlockHeader> = Vec::with_capacity(block_numbers.len());
    for number in block_numbers {
        let header = rpc
            .block(number)
            .await?
            .ok_or_else(|| anyhow::anyhow!("block {number} disappeared mid-index"))?;
        headers.push(header);
    }
    headers.sort_by_key(|header| header.number);

    for header in &headers {
        store_block(ex, header).await?;
    }
    for receipt in &receipts {
        store_transaction(ex, receipt).await?;
    }
    Ok(())
}

pub(crate) async fn store_block(
    ex: &mut PgTransaction<'_>,
    header: &BlockHeader,
) -> Result<(), sqlx::Error> {
    blocks::insert(
        ex,
        &blocks::Block {
            number: conv::db_block(header.number),
            block_hash: conv::db_hash(header.hash),
            parent_hash: conv::db_hash(header.parent_hash),
            timestamp: DateTime::from_timestamp(
                i64::try_from(header.timestamp).unwrap_or(i64::MAX),
                0,
            )
            .unwrap_or(DateTime::UNIX_EPOCH),
            confirmed: false,
        },
    )
    .await
}

pub(crate) async fn store_transaction(
    ex: &mut PgTransaction<'_>,
    tx: &TransactionWithReceipt,
) -> Result<(), sqlx::Error> {
    transactions::insert(
        ex,
        &transactions::Transaction {
            hash: conv::db_hash(tx.hash),
            block_number: conv::db_block(tx.block_number),
            transaction_index: conv::db_block(tx.transaction_index),
            from_address: conv::db_address(tx.from),
            to_address: tx.to.map(conv::db_address),
            value: conv::db_u256(tx.value),
            data: (!tx.input.is_empty()).then(|| tx.input.to_vec()),
            gas_used: conv::db_block(tx.gas_used),
            status: Some(tx.success as i64),
            tx_type: tx.tx_type as i64,
            max_fee_per_gas: Some(bigdecimal::BigDecimal::from(tx.max_fee_per_gas)),
            max_priority_fee_per_gas: tx
                .max_priority_fee_per_gas
                .map(bigdecimal::BigDecimal::from),
            logs: serde_json::to_value(&tx.logs).unwrap_or(serde_json::Value::Null),
        },
    )
    .await
}
