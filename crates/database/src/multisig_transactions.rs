use {
    crate::{Address, PgTransaction, SafeTxHash, TransactionHash},
    bigdecimal::BigDecimal,
    sqlx::{Executor, PgConnection},
};

/// A Safe transaction, either proposed off-chain, observed on-chain, or
/// both. Keyed by the EIP-712 `safe_tx_hash` which is fully derived from the
/// transaction fields, so the off-chain proposal and the later execution
/// land on the same row.
#[derive(Clone, Debug, Default, PartialEq, sqlx::FromRow)]
pub struct MultisigTransaction {
    pub safe_tx_hash: SafeTxHash,
    pub safe: Address,
    pub ethereum_tx_hash: Option<TransactionHash>,
    pub to_address: Option<Address>,
    pub value: BigDecimal,
    pub data: Option<Vec<u8>>,
    /// 0 CALL, 1 DELEGATECALL
    pub operation: i16,
    pub safe_tx_gas: BigDecimal,
    pub base_gas: BigDecimal,
    pub gas_price: BigDecimal,
    pub gas_token: Option<Address>,
    pub refund_receiver: Option<Address>,
    /// Concatenated signatures as executed on chain. Null for proposals.
    pub signatures: Option<Vec<u8>>,
    pub nonce: i64,
    pub failed: Option<bool>,
    /// Free-form client supplied provenance, kept across reorgs.
    pub origin: Option<serde_json::Value>,
    pub trusted: bool,
    /// Operator moderation flag. Banned transactions stay stored (an
    /// executed one is a chain fact) but drop out of client facing reads.
    pub banned: bool,
}

/// Inserts a proposal. The row must not exist yet; reconciliation with an
/// existing row goes through [`upsert_execution`].
pub async fn insert(
    ex: &mut PgConnection,
    tx: &MultisigTransaction,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO multisig_transactions (
    safe_tx_hash, safe, ethereum_tx_hash, to_address, value, data, operation,
    safe_tx_gas, base_gas, gas_price, gas_token, refund_receiver, signatures,
    nonce, failed, origin, trusted, banned
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18);
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(tx.safe_tx_hash)
            .bind(tx.safe)
            .bind(tx.ethereum_tx_hash)
            .bind(tx.to_address)
            .bind(&tx.value)
            .bind(&tx.data)
            .bind(tx.operation)
            .bind(&tx.safe_tx_gas)
            .bind(&tx.base_gas)
            .bind(&tx.gas_price)
            .bind(tx.gas_token)
            .bind(tx.refund_receiver)
            .bind(&tx.signatures)
            .bind(tx.nonce)
            .bind(tx.failed)
            .bind(&tx.origin)
            .bind(tx.trusted)
            .bind(tx.banned),
    )
    .await?;
    Ok(())
}

/// Records an on-chain execution. If a proposal with the hash exists it is
/// updated in place (keeping origin and trusted flag); otherwise the full
/// row is created from the on-chain data with `trusted = false`.
pub async fn upsert_execution(
    ex: &mut PgConnection,
    tx: &MultisigTransaction,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO multisig_transactions (
    safe_tx_hash, safe, ethereum_tx_hash, to_address, value, data, operation,
    safe_tx_gas, base_gas, gas_price, gas_token, refund_receiver, signatures,
    nonce, failed, origin, trusted, banned
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
ON CONFLICT (safe_tx_hash) DO UPDATE
SET ethereum_tx_hash = EXCLUDED.ethereum_tx_hash,
    signatures = EXCLUDED.signatures,
    failed = EXCLUDED.failed;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(tx.safe_tx_hash)
            .bind(tx.safe)
            .bind(tx.ethereum_tx_hash)
            .bind(tx.to_address)
            .bind(&tx.value)
            .bind(&tx.data)
            .bind(tx.operation)
            .bind(&tx.safe_tx_gas)
            .bind(&tx.base_gas)
            .bind(&tx.gas_price)
            .bind(tx.gas_token)
            .bind(tx.refund_receiver)
            .bind(&tx.signatures)
            .bind(tx.nonce)
            .bind(tx.failed)
            .bind(&tx.origin)
            .bind(tx.trusted)
            .bind(tx.banned),
    )
    .await?;
    Ok(())
}

pub async fn get(
    ex: &mut PgConnection,
    safe_tx_hash: &SafeTxHash,
) -> Result<Option<MultisigTransaction>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT safe_tx_hash, safe, ethereum_tx_hash, to_address, value, data, operation,
    safe_tx_gas, base_gas, gas_price, gas_token, refund_receiver, signatures,
    nonce, failed, origin, trusted, banned
FROM multisig_transactions
WHERE safe_tx_hash = $1;
    "#;
    sqlx::query_as(QUERY)
        .bind(safe_tx_hash)
        .fetch_optional(ex)
        .await
}

/// Highest nonce of any stored transaction for the Safe, executed or not.
pub async fn last_nonce(
    ex: &mut PgConnection,
    safe: &Address,
) -> Result<Option<i64>, sqlx::Error> {
    const QUERY: &str = "SELECT MAX(nonce) FROM multisig_transactions WHERE safe = $1;";
    sqlx::query_scalar(QUERY).bind(safe).fetch_one(ex).await
}

/// Highest executed nonce; proposals at or below it can never execute.
pub async fn last_executed_nonce(
    ex: &mut PgConnection,
    safe: &Address,
) -> Result<Option<i64>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT MAX(nonce)
FROM multisig_transactions
WHERE safe = $1 AND ethereum_tx_hash IS NOT NULL;
    "#;
    sqlx::query_scalar(QUERY).bind(safe).fetch_one(ex).await
}

/// Pending proposals that can still execute: unexecuted rows with a nonce
/// above the last executed one.
pub async fn queued(
    ex: &mut PgConnection,
    safe: &Address,
) -> Result<Vec<MultisigTransaction>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT safe_tx_hash, safe, ethereum_tx_hash, to_address, value, data, operation,
    safe_tx_gas, base_gas, gas_price, gas_token, refund_receiver, signatures,
    nonce, failed, origin, trusted, banned
FROM multisig_transactions
WHERE safe = $1
    AND ethereum_tx_hash IS NULL
    AND NOT banned
    AND nonce > COALESCE((
        SELECT MAX(nonce)
        FROM multisig_transactions
        WHERE safe = $1 AND ethereum_tx_hash IS NOT NULL
    ), -1)
ORDER BY nonce;
    "#;
    sqlx::query_as(QUERY).bind(safe).fetch_all(ex).await
}

/// Executed transactions for a Safe, newest first, keyset paginated on
/// (block position is implied by nonce for executed rows).
pub async fn executed_for_safe(
    ex: &mut PgConnection,
    safe: &Address,
    limit: i64,
) -> Result<Vec<MultisigTransaction>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT safe_tx_hash, safe, ethereum_tx_hash, to_address, value, data, operation,
    safe_tx_gas, base_gas, gas_price, gas_token, refund_receiver, signatures,
    nonce, failed, origin, trusted, banned
FROM multisig_transactions
WHERE safe = $1 AND ethereum_tx_hash IS NOT NULL AND NOT banned
ORDER BY nonce DESC
LIMIT $2;
    "#;
    sqlx::query_as(QUERY).bind(safe).bind(limit).fetch_all(ex).await
}

/// Deletes an unexecuted proposal. Executed transactions are chain facts and
/// cannot be deleted. Returns whether a row was removed.
pub async fn delete_proposal(
    ex: &mut PgConnection,
    safe_tx_hash: &SafeTxHash,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
DELETE FROM multisig_transactions
WHERE safe_tx_hash = $1 AND ethereum_tx_hash IS NULL;
    "#;
    let result = sqlx::query(QUERY).bind(safe_tx_hash).execute(ex).await?;
    Ok(result.rows_affected() > 0)
}

/// Operator moderation: flags or unflags a transaction as banned. Returns
/// whether the row exists.
pub async fn set_banned(
    ex: &mut PgConnection,
    safe_tx_hash: &SafeTxHash,
    banned: bool,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE multisig_transactions
SET banned = $2
WHERE safe_tx_hash = $1;
    "#;
    let result = sqlx::query(QUERY)
        .bind(safe_tx_hash)
        .bind(banned)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Detaches executions that pointed into a rewound block range. The proposal
/// fields (origin, trusted) survive; signatures and the execution pointer do
/// not. Returns the affected hashes so confirmations can be cleaned up.
pub async fn detach_executions_from_block(
    ex: &mut PgTransaction<'_>,
    from_block: i64,
) -> Result<Vec<SafeTxHash>, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE multisig_transactions
SET ethereum_tx_hash = NULL, signatures = NULL, failed = NULL
WHERE ethereum_tx_hash IN (
    SELECT hash FROM transactions WHERE block_number >= $1
)
RETURNING safe_tx_hash;
    "#;
    sqlx::query_scalar(QUERY)
        .bind(from_block)
        .fetch_all(&mut **ex)
        .await
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
        let hash = ByteArray([0x30 + block_number as u8; 32]);
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

    fn proposal(safe: Address, hash: u8, nonce: i64) -> MultisigTransaction {
        MultisigTransaction {
            safe_tx_hash: ByteArray([hash; 32]),
            safe,
            nonce,
            trusted: true,
            origin: Some(serde_json::json!({"name": "test app"})),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_proposal_then_execution_is_same_row() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let safe = ByteArray([0xaa; 20]);
        let proposal_ = proposal(safe, 1, 0);
        insert(&mut db, &proposal_).await.unwrap();

        let ethereum_tx_hash = insert_chain(&mut db, 100).await;
        let executed = MultisigTransaction {
            ethereum_tx_hash: Some(ethereum_tx_hash),
            signatures: Some(vec![0u8; 65]),
            failed: Some(false),
            trusted: false,
            origin: None,
            ..proposal_.clone()
        };
        upsert_execution(&mut db, &executed).await.unwrap();

        let row = get(&mut db, &proposal_.safe_tx_hash).await.unwrap().unwrap();
        assert_eq!(row.ethereum_tx_hash, Some(ethereum_tx_hash));
        assert_eq!(row.signatures, Some(vec![0u8; 65]));
        // proposal provenance survives the reconciliation
        assert_eq!(row.origin, proposal_.origin);
        assert!(row.trusted);
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_queued_skips_executed_nonces() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let safe = ByteArray([0xaa; 20]);
        insert(&mut db, &proposal(safe, 1, 0)).await.unwrap();
        assert_eq!(queued(&mut db, &safe).await.unwrap().len(), 1);

        // execute nonce 10; proposals below it drop out of the queue
        let ethereum_tx_hash = insert_chain(&mut db, 100).await;
        let executed = MultisigTransaction {
            ethereum_tx_hash: Some(ethereum_tx_hash),
            ..proposal(safe, 2, 10)
        };
        upsert_execution(&mut db, &executed).await.unwrap();
        insert(&mut db, &proposal(safe, 3, 7)).await.unwrap();
        insert(&mut db, &proposal(safe, 4, 22)).await.unwrap();

        let queued_ = queued(&mut db, &safe).await.unwrap();
        assert_eq!(queued_.len(), 1);
        assert_eq!(queued_[0].nonce, 22);
        assert_eq!(last_executed_nonce(&mut db, &safe).await.unwrap(), Some(10));
        assert_eq!(last_nonce(&mut db, &safe).await.unwrap(), Some(22));
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_detach_executions() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let safe = ByteArray([0xaa; 20]);
        let tx_old = insert_chain(&mut db, 100).await;
        let tx_new = insert_chain(&mut db, 200).await;
        for (hash, nonce, ethereum_tx_hash) in [(1, 0, tx_old), (2, 1, tx_new)] {
            upsert_execution(
                &mut db,
                &MultisigTransaction {
                    ethereum_tx_hash: Some(ethereum_tx_hash),
                    signatures: Some(vec![1u8; 65]),
                    ..proposal(safe, hash, nonce)
                },
            )
            .await
            .unwrap();
        }

        let detached = detach_executions_from_block(&mut db, 150).await.unwrap();
        assert_eq!(detached, vec![ByteArray([2; 32])]);

        let kept = get(&mut db, &ByteArray([1; 32])).await.unwrap().unwrap();
        assert_eq!(kept.ethereum_tx_hash, Some(tx_old));
        let rewound = get(&mut db, &ByteArray([2; 32])).await.unwrap().unwrap();
        assert_eq!(rewound.ethereum_tx_hash, None);
        assert_eq!(rewound.signatures, None);
        // origin survives the rewind
        assert!(rewound.origin.is_some());
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_banned_rows_leave_client_reads() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let safe = ByteArray([0xaa; 20]);
        insert(&mut db, &proposal(safe, 1, 0)).await.unwrap();
        let ethereum_tx_hash = insert_chain(&mut db, 100).await;
        upsert_execution(
            &mut db,
            &MultisigTransaction {
                ethereum_tx_hash: Some(ethereum_tx_hash),
                ..proposal(safe, 2, 1)
            },
        )
        .await
        .unwrap();
        assert_eq!(queued(&mut db, &safe).await.unwrap().len(), 0);
        assert_eq!(executed_for_safe(&mut db, &safe, 10).await.unwrap().len(), 1);

        assert!(set_banned(&mut db, &ByteArray([2; 32]), true).await.unwrap());
        assert_eq!(executed_for_safe(&mut db, &safe, 10).await.unwrap().len(), 0);
        // the row itself survives, only the reads filter it
        let row = get(&mut db, &ByteArray([2; 32])).await.unwrap().unwrap();
        assert!(row.banned);

        // an execution landing later does not clear the flag
        upsert_execution(
            &mut db,
            &MultisigTransaction {
                ethereum_tx_hash: Some(ethereum_tx_hash),
                failed: Some(false),
                ..proposal(safe, 2, 1)
            },
        )
        .await
        .unwrap();
        assert!(get(&mut db, &ByteArray([2; 32])).await.unwrap().unwrap().banned);

        // banning a queued proposal hides it from the queue, unbanning
        // restores it
        insert(&mut db, &proposal(safe, 3, 5)).await.unwrap();
        assert_eq!(queued(&mut db, &safe).await.unwrap().len(), 1);
        assert!(set_banned(&mut db, &ByteArray([3; 32]), true).await.unwrap());
        assert_eq!(queued(&mut db, &safe).await.unwrap().len(), 0);
        assert!(set_banned(&mut db, &ByteArray([3; 32]), false).await.unwrap());
        assert_eq!(queued(&mut db, &safe).await.unwrap().len(), 1);

        assert!(!set_banned(&mut db, &ByteArray([9; 32]), true).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_delete_proposal_only_unexecuted() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let safe = ByteArray([0xaa; 20]);
        insert(&mut db, &proposal(safe, 1, 0)).await.unwrap();
        let ethereum_tx_hash = insert_chain(&mut db, 100).await;
        upsert_execution(
            &mut db,
            &MultisigTransaction {
                ethereum_tx_hash: Some(ethereum_tx_hash),
                ..proposal(safe, 2, 1)
            },
        )
        .await
        .unwrap();

        assert!(delete_proposal(&mut db, &ByteArray([1; 32])).await.unwrap());
        assert!(!delete_proposal(&mut db, &ByteArray([2; 32])).await.unwrap());
    }
}
