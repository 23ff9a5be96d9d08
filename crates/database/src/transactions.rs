use {
    crate::{Address, TransactionHash},
    bigdecimal::BigDecimal,
    sqlx::{Executor, PgConnection},
};

/// An observed EVM transaction together with the data of its receipt.
/// Immutable once inserted; removed only by the block cascade on reorgs.
#[derive(Clone, Debug, Default, PartialEq, sqlx::FromRow)]
pub struct Transaction {
    pub hash: TransactionHash,
    pub block_number: i64,
    pub transaction_index: i64,
    pub from_address: Address,
    pub to_address: Option<Address>,
    pub value: BigDecimal,
    pub data: Option<Vec<u8>>,
    pub gas_used: i64,
    pub status: Option<i64>,
    /// 0 legacy, 1 eip-2930, 2 eip-1559
    pub tx_type: i64,
    pub max_fee_per_gas: Option<BigDecimal>,
    pub max_priority_fee_per_gas: Option<BigDecimal>,
    /// Raw receipt logs. Queried by the transfer indexer backfill and kept
    /// for debugging; typed transfer rows live in their own tables.
    pub logs: serde_json::Value,
}

pub async fn insert(ex: &mut PgConnection, tx: &Transaction) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO transactions (
    hash, block_number, transaction_index, from_address, to_address, value,
    data, gas_used, status, tx_type, max_fee_per_gas, max_priority_fee_per_gas,
    logs
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
ON CONFLICT (hash) DO NOTHING;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(tx.hash)
            .bind(tx.block_number)
            .bind(tx.transaction_index)
            .bind(tx.from_address)
            .bind(tx.to_address)
            .bind(&tx.value)
            .bind(&tx.data)
            .bind(tx.gas_used)
            .bind(tx.status)
            .bind(tx.tx_type)
            .bind(&tx.max_fee_per_gas)
            .bind(&tx.max_priority_fee_per_gas)
            .bind(&tx.logs),
    )
    .await?;
    Ok(())
}

pub async fn get(
    ex: &mut PgConnection,
    hash: &TransactionHash,
) -> Result<Option<Transaction>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT hash, block_number, transaction_index, from_address, to_address, value,
    data, gas_used, status, tx_type, max_fee_per_gas, max_priority_fee_per_gas,
    logs
FROM transactions
WHERE hash = $1;
    "#;
    sqlx::query_as(QUERY).bind(hash).fetch_optional(ex).await
}

/// Hashes already present, out of the given set. Used to skip receipt
/// requests for transactions indexed by an earlier batch.
pub async fn existing_hashes(
    ex: &mut PgConnection,
    hashes: &[TransactionHash],
) -> Result<Vec<TransactionHash>, sqlx::Error> {
    const QUERY: &str = "SELECT hash FROM transactions WHERE hash = ANY($1);";
    sqlx::query_scalar(QUERY).bind(hashes).fetch_all(ex).await
}
