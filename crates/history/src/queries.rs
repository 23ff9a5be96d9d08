//! Read-only aggregations over the indexed history: the merged
//! "all transactions" view and balance material per Safe.

use {
    crate::conv,
    alloy_primitives::Address,
    anyhow::Result,
    bigdecimal::BigDecimal,
    database::{TransactionHash, internal_txs, transfers},
    itertools::Itertools,
    sqlx::PgPool,
};

/// One entry of the merged history of a Safe. `identifier` disambiguates
/// entries sharing a transaction: the safeTxHash for multisig executions,
/// the trace address for module transactions, the log index for token
/// transfers.
#[derive(Clone, Debug, Eq, PartialEq, sqlx::FromRow)]
pub struct HistoryEntry {
    pub kind: String,
    pub block_number: i64,
    pub position: i64,
    pub ethereum_tx_hash: TransactionHash,
    pub identifier: String,
}

/// Keyset cursor: entries strictly below this (block, position) pair.
#[derive(Clone, Copy, Debug)]
pub struct HistoryCursor {
    pub block_number: i64,
    pub position: i64,
}

/// Balance material for one Safe.
#[derive(Clone, Debug, PartialEq)]
pub struct Balances {
    pub native: BigDecimal,
    pub erc20: Vec<transfers::Erc20Balance>,
}

/// A token transfer of either standard, for the merged history view.
#[derive(Clone, Debug, PartialEq)]
pub enum TransferEntry {
    Erc20(transfers::Erc20Transfer),
    Erc721(transfers::Erc721Transfer),
}

impl TransferEntry {
    /// Chain position: (block number, log index).
    pub fn position(&self) -> (i64, i64) {
        match self {
            Self::Erc20(transfer) => (transfer.block_number, transfer.log_index),
            Self::Erc721(transfer) => (transfer.block_number, transfer.log_index),
        }
    }
}

const ALL_TRANSACTIONS_QUERY: &str = r#"
WITH entries AS (
    SELECT 'MULTISIG_TRANSACTION' AS kind,
        t.block_number,
        t.transaction_index AS position,
        m.ethereum_tx_hash,
        encode(m.safe_tx_hash, 'hex') AS identifier
    FROM multisig_transactions m
    JOIN transactions t ON t.hash = m.ethereum_tx_hash
    WHERE m.safe = $1 AND m.ethereum_tx_hash IS NOT NULL AND NOT m.banned

    UNION ALL

    SELECT 'MODULE_TRANSACTION',
        t.block_number,
        t.transaction_index,
        mt.ethereum_tx_hash,
        mt.trace_address
    FROM module_transactions mt
    JOIN transactions t ON t.hash = mt.ethereum_tx_hash
    WHERE mt.safe = $1

    UNION ALL

    SELECT 'ERC20_TRANSFER',
        t.block_number,
        t.transaction_index,
        e.ethereum_tx_hash,
        e.log_index::text
    FROM erc20_transfers e
    JOIN transactions t ON t.hash = e.ethereum_tx_hash
    WHERE e.from_address = $1 OR e.to_address = $1

    UNION ALL

    SELECT 'ERC721_TRANSFER',
        t.block_number,
        t.transaction_index,
        e.ethereum_tx_hash,
        e.log_index::text
    FROM erc721_transfers e
    JOIN transactions t ON t.hash = e.ethereum_tx_hash
    WHERE e.from_address = $1 OR e.to_address = $1

    UNION ALL

    SELECT 'ETHER_TRANSFER',
        i.block_number,
        i.transaction_index,
        i.ethereum_tx_hash,
        i.trace_address
    FROM internal_txs i
    WHERE (i.from_address = $1 OR i.to_address = $1)
        AND i.call_type = 0
        AND i.value > 0
        AND i.error IS NULL
)
SELECT kind, block_number, position, ethereum_tx_hash, identifier
FROM entries
WHERE (block_number, position) < ($2, $3)
ORDER BY block_number DESC, position DESC, kind, identifier
LIMIT $4;
"#;

pub struct Queries {
    pool: PgPool,
}

impl Queries {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The union of executed multisig transactions, module transactions and
    /// transfers touching the Safe, newest first. Pass the last entry's
    /// (block, position) back as the cursor for the next page.
    pub async fn all_transactions(
        &self,
        safe: Address,
        cursor: Option<HistoryCursor>,
        limit: i64,
    ) -> Result<Vec<HistoryEntry>> {
        let cursor = cursor.unwrap_or(HistoryCursor {
            block_number: i64::MAX,
            position: i64::MAX,
        });
        let mut conn = self.pool.acquire().await?;
        let entries = sqlx::query_as(ALL_TRANSACTIONS_QUERY)
            .bind(conv::db_address(safe))
            .bind(cursor.block_number)
            .bind(cursor.position)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?;
        Ok(entries)
    }

    /// Balances derived from indexed movements: the native ether sum over
    /// successful value-carrying calls plus per-token ERC-20 sums. Tokens
    /// with hidden mint/burn mechanics need the on-chain `balanceOf` from
    /// the price/metadata collaborators.
    pub async fn balances(&self, safe: Address) -> Result<Balances> {
        let mut conn = self.pool.acquire().await?;
        let safe = conv::db_address(safe);
        let native = internal_txs::ether_balance(&mut conn, &safe).await?;
        let erc20 = transfers::erc20_balances(&mut conn, &safe).await?;
        Ok(Balances { native, erc20 })
    }

    /// Token transfers touching the Safe, both standards merged, newest
    /// first.
    pub async fn transfer_history(
        &self,
        safe: Address,
        limit: i64,
    ) -> Result<Vec<TransferEntry>> {
        let mut conn = self.pool.acquire().await?;
        let safe = conv::db_address(safe);
        let erc20 = transfers::erc20_for_address(&mut conn, &safe, limit).await?;
        let erc721 = transfers::erc721_for_address(&mut conn, &safe, limit).await?;
        let merged = erc20
            .into_iter()
            .map(TransferEntry::Erc20)
            .chain(erc721.into_iter().map(TransferEntry::Erc721))
            .sorted_by_key(|entry| std::cmp::Reverse(entry.position()))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect();
        Ok(merged)
    }

    pub async fn erc721_owned(
        &self,
        safe: Address,
        token: Address,
    ) -> Result<Vec<BigDecimal>> {
        let mut conn = self.pool.acquire().await?;
        Ok(transfers::erc721_owned_by(
            &mut conn,
            &conv::db_address(safe),
            &conv::db_address(token),
        )
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        chrono::{DateTime, Utc},
        database::{
            blocks, byte_array::ByteArray, module_transactions, multisig_transactions,
            transactions,
        },
    };

    async fn seed(pool: &PgPool, safe: database::Address) {
        let mut db = pool.acquire().await.unwrap();
        for (block_number, tx_index, tag) in [(10i64, 0i64, 1u8), (11, 0, 2), (11, 1, 3)] {
            blocks::insert(
                &mut db,
                &blocks::Block {
                    number: block_number,
                    block_hash: ByteArray([tag; 32]),
                    parent_hash: Default::default(),
                    timestamp: DateTime::<Utc>::MIN_UTC,
                    confirmed: false,
                },
            )
            .await
            .unwrap();
            transactions::insert(
                &mut db,
                &transactions::Transaction {
                    hash: ByteArray([0x60 + tag; 32]),
                    block_number,
                    transaction_index: tx_index,
                    logs: serde_json::json!([]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        multisig_transactions::upsert_execution(
            &mut db,
            &multisig_transactions::MultisigTransaction {
                safe_tx_hash: ByteArray([0xEE; 32]),
                safe,
                ethereum_tx_hash: Some(ByteArray([0x61; 32])),
                nonce: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        module_transactions::insert(
            &mut db,
            &module_transactions::ModuleTransaction {
                ethereum_tx_hash: ByteArray([0x63; 32]),
                trace_address: "0.0".to_string(),
                safe,
                module: ByteArray([0x77; 20]),
                block_number: 11,
                success: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_balances_and_transfer_history() {
        let pool = PgPool::connect("postgresql://").await.unwrap();
        database::clear_DANGER(&pool).await.unwrap();
        let safe = ByteArray([0xaa; 20]);
        let other = ByteArray([0xbb; 20]);
        let token = ByteArray([0x70; 20]);
        seed(&pool, safe).await;

        let mut db = pool.acquire().await.unwrap();
        // ether: 100 in at block 10, 30 out at block 11
        for (tx_tag, trace_address, block_number, from, to, value) in
            [(1u8, "0", 10i64, other, safe, 100), (2, "0", 11, safe, other, 30)]
        {
            internal_txs::insert(
                &mut db,
                &internal_txs::InternalTx {
                    ethereum_tx_hash: ByteArray([0x60 + tx_tag; 32]),
                    trace_address: trace_address.to_string(),
                    block_number,
                    from_address: Some(from),
                    to_address: Some(to),
                    value: BigDecimal::from(value),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        // one transfer of each standard, the erc721 one newer
        transfers::insert_erc20(
            &mut db,
            &transfers::Erc20Transfer {
                ethereum_tx_hash: ByteArray([0x61; 32]),
                log_index: 0,
                block_number: 10,
                token_address: token,
                from_address: other,
                to_address: safe,
                value: BigDecimal::from(500),
            },
        )
        .await
        .unwrap();
        transfers::insert_erc721(
            &mut db,
            &transfers::Erc721Transfer {
                ethereum_tx_hash: ByteArray([0x62; 32]),
                log_index: 2,
                block_number: 11,
                token_address: token,
                from_address: other,
                to_address: safe,
                token_id: BigDecimal::from(7),
            },
        )
        .await
        .unwrap();
        drop(db);

        let queries = Queries::new(pool.clone());
        let safe_address = conv::address_from_db(safe);

        let balances = queries.balances(safe_address).await.unwrap();
        assert_eq!(balances.native, BigDecimal::from(70));
        assert_eq!(
            balances.erc20,
            vec![transfers::Erc20Balance {
                token_address: token,
                balance: BigDecimal::from(500),
            }]
        );

        let history = queries.transfer_history(safe_address, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        // newest first: the erc721 transfer at block 11 leads
        assert!(matches!(&history[0], TransferEntry::Erc721(t) if t.block_number == 11));
        assert!(matches!(&history[1], TransferEntry::Erc20(t) if t.block_number == 10));

        let limited = queries.transfer_history(safe_address, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].position(), (11, 2));

        database::clear_DANGER(&pool).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_all_transactions_merged_and_paginated() {
        let pool = PgPool::connect("postgresql://").await.unwrap();
        database::clear_DANGER(&pool).await.unwrap();
        let safe = ByteArray([0xaa; 20]);
        seed(&pool, safe).await;

        let queries = Queries::new(pool.clone());
        let safe_address = conv::address_from_db(safe);

        let page = queries.all_transactions(safe_address, None, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        // newest first: the module transaction at block 11 leads
        assert_eq!(page[0].kind, "MODULE_TRANSACTION");
        assert_eq!(page[0].block_number, 11);
        assert_eq!(page[1].kind, "MULTISIG_TRANSACTION");
        assert_eq!(page[1].block_number, 10);

        // keyset pagination continues below the cursor
        let cursor = HistoryCursor {
            block_number: page[0].block_number,
            position: page[0].position,
        };
        let next = queries
            .all_transactions(safe_address, Some(cursor), 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].kind, "MULTISIG_TRANSACTION");

        database::clear_DANGER(&pool).await.unwrap();
    }
}
