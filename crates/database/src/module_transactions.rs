use {
    crate::{Address, TransactionHash},
    bigdecimal::BigDecimal,
    sqlx::{Executor, PgConnection},
};

/// A transaction executed through an enabled module, bypassing the owner
/// threshold. One row per `execTransactionFromModule[ReturnData]` trace.
#[derive(Clone, Debug, Default, PartialEq, sqlx::FromRow)]
pub struct ModuleTransaction {
    pub ethereum_tx_hash: TransactionHash,
    pub trace_address: String,
    pub safe: Address,
    pub module: Address,
    pub block_number: i64,
    pub to_address: Option<Address>,
    pub value: BigDecimal,
    pub data: Option<Vec<u8>>,
    /// 0 CALL, 1 DELEGATECALL
    pub operation: i16,
    pub success: bool,
}

pub async fn insert(ex: &mut PgConnection, tx: &ModuleTransaction) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO module_transactions (
    ethereum_tx_hash, trace_address, safe, module, block_number, to_address,
    value, data, operation, success
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (ethereum_tx_hash, trace_address) DO NOTHING;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(tx.ethereum_tx_hash)
            .bind(&tx.trace_address)
            .bind(tx.safe)
            .bind(tx.module)
            .bind(tx.block_number)
            .bind(tx.to_address)
            .bind(&tx.value)
            .bind(&tx.data)
            .bind(tx.operation)
            .bind(tx.success),
    )
    .await?;
    Ok(())
}

pub async fn for_safe(
    ex: &mut PgConnection,
    safe: &Address,
    limit: i64,
) -> Result<Vec<ModuleTransaction>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT ethereum_tx_hash, trace_address, safe, module, block_number, to_address,
    value, data, operation, success
FROM module_transactions
WHERE safe = $1
ORDER BY block_number DESC, trace_address DESC
LIMIT $2;
    "#;
    sqlx::query_as(QUERY).bind(safe).bind(limit).fetch_all(ex).await
}
