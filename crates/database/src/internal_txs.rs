use {
    crate::{Address, PgTransaction, TransactionHash},
    bigdecimal::BigDecimal,
    sqlx::{Executor, PgConnection},
};

/// Classification of a trace entry. Stored as `smallint`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::Type)]
#[repr(i16)]
pub enum CallType {
    #[default]
    Call = 0,
    DelegateCall = 1,
    StaticCall = 2,
    Create = 3,
    Create2 = 4,
}

/// A single entry of a transaction's call tree, identified by the dotted
/// `trace_address` path ("" for the top level call, "0.1" for the second
/// child of the first child, ...).
#[derive(Clone, Debug, Default, PartialEq, sqlx::FromRow)]
pub struct InternalTx {
    pub ethereum_tx_hash: TransactionHash,
    pub trace_address: String,
    pub block_number: i64,
    pub transaction_index: i64,
    pub from_address: Option<Address>,
    pub to_address: Option<Address>,
    pub value: BigDecimal,
    pub data: Option<Vec<u8>>,
    pub call_type: CallType,
    pub error: Option<String>,
    pub output: Option<Vec<u8>>,
}

/// A decoded Safe call queued for replay. `safe` is the Safe the call acts
/// on, which for DELEGATECALL traces into the singleton is the trace's
/// `from` (the proxy) rather than its `to`.
#[derive(Clone, Debug, Default, PartialEq, sqlx::FromRow)]
pub struct DecodedTx {
    pub ethereum_tx_hash: TransactionHash,
    pub trace_address: String,
    pub safe: Address,
    pub block_number: i64,
    pub transaction_index: i64,
    pub function_name: String,
    pub arguments: serde_json::Value,
    pub processed: bool,
}

pub async fn insert(ex: &mut PgConnection, tx: &InternalTx) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO internal_txs (
    ethereum_tx_hash, trace_address, block_number, transaction_index,
    from_address, to_address, value, data, call_type, error, output
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (ethereum_tx_hash, trace_address) DO NOTHING;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(tx.ethereum_tx_hash)
            .bind(&tx.trace_address)
            .bind(tx.block_number)
            .bind(tx.transaction_index)
            .bind(tx.from_address)
            .bind(tx.to_address)
            .bind(&tx.value)
            .bind(&tx.data)
            .bind(tx.call_type)
            .bind(&tx.error)
            .bind(&tx.output),
    )
    .await?;
    Ok(())
}

pub async fn get(
    ex: &mut PgConnection,
    tx_hash: &TransactionHash,
    trace_address: &str,
) -> Result<Option<InternalTx>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT ethereum_tx_hash, trace_address, block_number, transaction_index,
    from_address, to_address, value, data, call_type, error, output
FROM internal_txs
WHERE ethereum_tx_hash = $1 AND trace_address = $2;
    "#;
    sqlx::query_as(QUERY)
        .bind(tx_hash)
        .bind(trace_address)
        .fetch_optional(ex)
        .await
}

/// All traces of one transaction, call tree order.
pub async fn for_transaction(
    ex: &mut PgConnection,
    tx_hash: &TransactionHash,
) -> Result<Vec<InternalTx>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT ethereum_tx_hash, trace_address, block_number, transaction_index,
    from_address, to_address, value, data, call_type, error, output
FROM internal_txs
WHERE ethereum_tx_hash = $1
ORDER BY string_to_array(trace_address, '.')::int[];
    "#;
    sqlx::query_as(QUERY).bind(tx_hash).fetch_all(ex).await
}

/// Ether movements (value > 0 CALLs) touching the given address.
pub async fn ether_transfers(
    ex: &mut PgConnection,
    address: &Address,
    limit: i64,
) -> Result<Vec<InternalTx>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT ethereum_tx_hash, trace_address, block_number, transaction_index,
    from_address, to_address, value, data, call_type, error, output
FROM internal_txs
WHERE (to_address = $1 OR from_address = $1)
    AND call_type = 0
    AND value > 0
    AND error IS NULL
ORDER BY block_number DESC, transaction_index DESC
LIMIT $2;
    "#;
    sqlx::query_as(QUERY)
        .bind(address)
        .bind(limit)
        .fetch_all(ex)
        .await
}

/// Net native balance material: ether received minus ether sent through
/// successful CALL traces. Safes never pay gas themselves (the executing
/// sender does), so the trace sum is the balance.
pub async fn ether_balance(
    ex: &mut PgConnection,
    address: &Address,
) -> Result<BigDecimal, sqlx::Error> {
    const QUERY: &str = r#"
SELECT COALESCE(SUM(
    CASE WHEN to_address = $1 THEN value ELSE 0 END
    - CASE WHEN from_address = $1 THEN value ELSE 0 END
), 0)
FROM internal_txs
WHERE (to_address = $1 OR from_address = $1)
    AND call_type = 0
    AND error IS NULL;
    "#;
    sqlx::query_scalar(QUERY).bind(address).fetch_one(ex).await
}

pub mod decoded {
    use super::*;

    pub async fn insert(ex: &mut PgConnection, tx: &DecodedTx) -> Result<(), sqlx::Error> {
        const QUERY: &str = r#"
INSERT INTO internal_txs_decoded (
    ethereum_tx_hash, trace_address, safe, block_number, transaction_index,
    function_name, arguments, processed
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (ethereum_tx_hash, trace_address) DO NOTHING;
        "#;
        ex.execute(
            sqlx::query(QUERY)
                .bind(tx.ethereum_tx_hash)
                .bind(&tx.trace_address)
                .bind(tx.safe)
                .bind(tx.block_number)
                .bind(tx.transaction_index)
                .bind(&tx.function_name)
                .bind(&tx.arguments)
                .bind(tx.processed),
        )
        .await?;
        Ok(())
    }

    /// Safes that still have unprocessed decoded calls.
    pub async fn pending_safes(ex: &mut PgConnection) -> Result<Vec<Address>, sqlx::Error> {
        const QUERY: &str = r#"
SELECT DISTINCT safe
FROM internal_txs_decoded
WHERE NOT processed;
        "#;
        sqlx::query_scalar(QUERY).fetch_all(ex).await
    }

    /// Unprocessed calls for one Safe in replay order: `setup` first, then
    /// (block number, transaction index, trace address path). Replay is not
    /// commutative, so this order is load bearing.
    pub async fn pending_for_safe(
        ex: &mut PgConnection,
        safe: &Address,
    ) -> Result<Vec<DecodedTx>, sqlx::Error> {
        const QUERY: &str = r#"
SELECT ethereum_tx_hash, trace_address, safe, block_number, transaction_index,
    function_name, arguments, processed
FROM internal_txs_decoded
WHERE safe = $1 AND NOT processed
ORDER BY (function_name != 'setup'),
    block_number,
    transaction_index,
    string_to_array(trace_address, '.')::int[];
        "#;
        sqlx::query_as(QUERY).bind(safe).fetch_all(ex).await
    }

    pub async fn set_processed(
        ex: &mut PgConnection,
        tx_hash: &TransactionHash,
        trace_address: &str,
    ) -> Result<(), sqlx::Error> {
        const QUERY: &str = r#"
UPDATE internal_txs_decoded
SET processed = true
WHERE ethereum_tx_hash = $1 AND trace_address = $2;
        "#;
        ex.execute(sqlx::query(QUERY).bind(tx_hash).bind(trace_address))
            .await?;
        Ok(())
    }

    /// A Safe's queue is out of order when a processed call sits at a block
    /// height above an unprocessed one. Replaying from the unprocessed call
    /// would apply state twice, so such a Safe needs a reindex instead.
    pub async fn out_of_order_for_safe(
        ex: &mut PgConnection,
        safe: &Address,
    ) -> Result<bool, sqlx::Error> {
        const QUERY: &str = r#"
SELECT EXISTS (
    SELECT 1
    FROM internal_txs_decoded processed_tx
    JOIN internal_txs_decoded pending_tx ON processed_tx.safe = pending_tx.safe
    WHERE processed_tx.safe = $1
        AND processed_tx.processed
        AND NOT pending_tx.processed
        AND processed_tx.block_number > pending_tx.block_number
);
        "#;
        sqlx::query_scalar(QUERY).bind(safe).fetch_one(ex).await
    }

    /// Marks every decoded call at `block_number >= from_block` unprocessed.
    /// The reorg rewind drops the status snapshots derived from that range
    /// and needs the surviving calls to be replayed again.
    pub async fn reset_from_block(
        ex: &mut PgTransaction<'_>,
        from_block: i64,
    ) -> Result<u64, sqlx::Error> {
        const QUERY: &str = r#"
UPDATE internal_txs_decoded
SET processed = false
WHERE block_number >= $1 AND processed;
        "#;
        let result = sqlx::query(QUERY).bind(from_block).execute(&mut **ex).await?;
        Ok(result.rows_affected())
    }

    /// Resets the whole queue of a Safe to unprocessed. Part of reindexing a
    /// corrupted Safe.
    pub async fn reset_for_safe(
        ex: &mut PgTransaction<'_>,
        safe: &Address,
    ) -> Result<u64, sqlx::Error> {
        const QUERY: &str = r#"
UPDATE internal_txs_decoded
SET processed = false
WHERE safe = $1;
        "#;
        let result = sqlx::query(QUERY).bind(safe).execute(&mut **ex).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{blocks, byte_array::ByteArray, transactions},
        chrono::{DateTime, Utc},
        sqlx::Connection,
    };

    async fn insert_chain(db: &mut PgConnection, block_number: i64) -> TransactionHash {
        blocks::insert(
            db,
            &blocks::Block {
                number: block_number,
                block_hash: ByteArray([block_number as u8; 32]),
                parent_hash: Default::default(),
                timestamp: DateTime::<Utc>::MIN_UTC,
                confirmed: false,
            },
        )
        .await
        .unwrap();
        let hash = ByteArray([0x10 + block_number as u8; 32]);
        transactions::insert(
            db,
            &transactions::Transaction {
                hash,
                block_number,
                logs: serde_json::json!([]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        hash
    }

    fn decoded(
        tx_hash: TransactionHash,
        trace_address: &str,
        safe: Address,
        block_number: i64,
        function_name: &str,
    ) -> DecodedTx {
        DecodedTx {
            ethereum_tx_hash: tx_hash,
            trace_address: trace_address.to_string(),
            safe,
            block_number,
            transaction_index: 0,
            function_name: function_name.to_string(),
            arguments: serde_json::json!({}),
            processed: false,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_trace_tree_ordering() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let tx_hash = insert_chain(&mut db, 1).await;
        // "10" must sort after "2", which string ordering would get wrong
        for trace_address in ["10", "2", "0", "0.1"] {
            insert(
                &mut db,
                &InternalTx {
                    ethereum_tx_hash: tx_hash,
                    trace_address: trace_address.to_string(),
                    block_number: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        let traces = for_transaction(&mut db, &tx_hash).await.unwrap();
        assert_eq!(
            traces
                .iter()
                .map(|tx| tx.trace_address.as_str())
                .collect::<Vec<_>>(),
            vec!["0", "0.1", "2", "10"]
        );
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_ether_balance() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let safe = ByteArray([0xaa; 20]);
        let other = ByteArray([0xbb; 20]);
        let tx_hash = insert_chain(&mut db, 1).await;
        assert_eq!(
            ether_balance(&mut db, &safe).await.unwrap(),
            BigDecimal::from(0)
        );

        // 100 in, 30 out, one reverted outflow that must not count
        for (trace_address, from, to, value, error) in [
            ("0", other, safe, 100, None),
            ("1", safe, other, 30, None),
            ("2", safe, other, 50, Some("Reverted".to_string())),
        ] {
            insert(
                &mut db,
                &InternalTx {
                    ethereum_tx_hash: tx_hash,
                    trace_address: trace_address.to_string(),
                    block_number: 1,
                    from_address: Some(from),
                    to_address: Some(to),
                    value: BigDecimal::from(value),
                    error,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        assert_eq!(
            ether_balance(&mut db, &safe).await.unwrap(),
            BigDecimal::from(70)
        );
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_queue_ordering_setup_first() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let safe = ByteArray([0xaa; 20]);
        let tx_1 = insert_chain(&mut db, 1).await;
        let tx_2 = insert_chain(&mut db, 2).await;
        decoded::insert(&mut db, &decoded(tx_2, "0", safe, 2, "setup"))
            .await
            .unwrap();
        decoded::insert(&mut db, &decoded(tx_1, "0", safe, 1, "addOwnerWithThreshold"))
            .await
            .unwrap();

        let pending = decoded::pending_for_safe(&mut db, &safe).await.unwrap();
        assert_eq!(
            pending
                .iter()
                .map(|tx| tx.function_name.as_str())
                .collect::<Vec<_>>(),
            vec!["setup", "addOwnerWithThreshold"]
        );
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_pending_and_out_of_order() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let safe = ByteArray([0xaa; 20]);
        let tx_1 = insert_chain(&mut db, 10).await;
        let tx_2 = insert_chain(&mut db, 11).await;
        decoded::insert(&mut db, &decoded(tx_1, "0", safe, 10, "execTransaction"))
            .await
            .unwrap();
        decoded::insert(&mut db, &decoded(tx_2, "0", safe, 11, "execTransaction"))
            .await
            .unwrap();
        assert_eq!(decoded::pending_safes(&mut db).await.unwrap(), vec![safe]);
        assert!(!decoded::out_of_order_for_safe(&mut db, &safe).await.unwrap());

        // processing the newer call while the older one is pending is out of
        // order
        decoded::set_processed(&mut db, &tx_2, "0").await.unwrap();
        assert!(decoded::out_of_order_for_safe(&mut db, &safe).await.unwrap());

        decoded::set_processed(&mut db, &tx_1, "0").await.unwrap();
        assert!(decoded::pending_safes(&mut db).await.unwrap().is_empty());
        assert!(!decoded::out_of_order_for_safe(&mut db, &safe).await.unwrap());
    }
}
