use {
    crate::{Address, PgTransaction, TransactionHash},
    bigdecimal::BigDecimal,
    sqlx::{Executor, PgConnection},
};

/// A single ERC-20 `Transfer` event. Identified by (transaction, log index).
#[derive(Clone, Debug, Default, PartialEq, sqlx::FromRow)]
pub struct Erc20Transfer {
    pub ethereum_tx_hash: TransactionHash,
    pub log_index: i64,
    pub block_number: i64,
    pub token_address: Address,
    pub from_address: Address,
    pub to_address: Address,
    pub value: BigDecimal,
}

/// A single ERC-721 `Transfer` event.
#[derive(Clone, Debug, Default, PartialEq, sqlx::FromRow)]
pub struct Erc721Transfer {
    pub ethereum_tx_hash: TransactionHash,
    pub log_index: i64,
    pub block_number: i64,
    pub token_address: Address,
    pub from_address: Address,
    pub to_address: Address,
    pub token_id: BigDecimal,
}

pub async fn insert_erc20(
    ex: &mut PgConnection,
    transfer: &Erc20Transfer,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO erc20_transfers (
    ethereum_tx_hash, log_index, block_number, token_address, from_address,
    to_address, value
)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (ethereum_tx_hash, log_index) DO NOTHING;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(transfer.ethereum_tx_hash)
            .bind(transfer.log_index)
            .bind(transfer.block_number)
            .bind(transfer.token_address)
            .bind(transfer.from_address)
            .bind(transfer.to_address)
            .bind(&transfer.value),
    )
    .await?;
    Ok(())
}

pub async fn insert_erc721(
    ex: &mut PgConnection,
    transfer: &Erc721Transfer,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO erc721_transfers (
    ethereum_tx_hash, log_index, block_number, token_address, from_address,
    to_address, token_id
)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (ethereum_tx_hash, log_index) DO NOTHING;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(transfer.ethereum_tx_hash)
            .bind(transfer.log_index)
            .bind(transfer.block_number)
            .bind(transfer.token_address)
            .bind(transfer.from_address)
            .bind(transfer.to_address)
            .bind(&transfer.token_id),
    )
    .await?;
    Ok(())
}

pub async fn erc20_for_address(
    ex: &mut PgConnection,
    address: &Address,
    limit: i64,
) -> Result<Vec<Erc20Transfer>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT ethereum_tx_hash, log_index, block_number, token_address, from_address,
    to_address, value
FROM erc20_transfers
WHERE from_address = $1 OR to_address = $1
ORDER BY block_number DESC, log_index DESC
LIMIT $2;
    "#;
    sqlx::query_as(QUERY)
        .bind(address)
        .bind(limit)
        .fetch_all(ex)
        .await
}

pub async fn erc721_for_address(
    ex: &mut PgConnection,
    address: &Address,
    limit: i64,
) -> Result<Vec<Erc721Transfer>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT ethereum_tx_hash, log_index, block_number, token_address, from_address,
    to_address, token_id
FROM erc721_transfers
WHERE from_address = $1 OR to_address = $1
ORDER BY block_number DESC, log_index DESC
LIMIT $2;
    "#;
    sqlx::query_as(QUERY)
        .bind(address)
        .bind(limit)
        .fetch_all(ex)
        .await
}

/// Token ids of a collection currently held by `owner`: ids transferred in
/// minus ids transferred out again.
pub async fn erc721_owned_by(
    ex: &mut PgConnection,
    owner: &Address,
    token_address: &Address,
) -> Result<Vec<BigDecimal>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT incoming.token_id
FROM erc721_transfers incoming
WHERE incoming.to_address = $1 AND incoming.token_address = $2
    AND NOT EXISTS (
        SELECT 1
        FROM erc721_transfers outgoing
        WHERE outgoing.token_address = incoming.token_address
            AND outgoing.token_id = incoming.token_id
            AND outgoing.from_address = $1
            AND (outgoing.block_number, outgoing.log_index)
                > (incoming.block_number, incoming.log_index)
    );
    "#;
    sqlx::query_scalar(QUERY)
        .bind(owner)
        .bind(token_address)
        .fetch_all(ex)
        .await
}

/// Native + per-token balance material: summed erc20 in/out per token.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Erc20Balance {
    pub token_address: Address,
    pub balance: BigDecimal,
}

pub async fn erc20_balances(
    ex: &mut PgConnection,
    address: &Address,
) -> Result<Vec<Erc20Balance>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT token_address, SUM(
    CASE WHEN to_address = $1 THEN value ELSE 0 END
    - CASE WHEN from_address = $1 THEN value ELSE 0 END
) AS balance
FROM erc20_transfers
WHERE from_address = $1 OR to_address = $1
GROUP BY token_address
ORDER BY token_address;
    "#;
    sqlx::query_as(QUERY).bind(address).fetch_all(ex).await
}

/// Moves every stored transfer of a token that turned out to be ERC-721 from
/// the erc20 table to the erc721 table, reinterpreting `value` as the token
/// id. Identity (tx hash, log index, from, to) is preserved.
pub async fn erc20_to_erc721(
    ex: &mut PgTransaction<'_>,
    token_address: &Address,
) -> Result<u64, sqlx::Error> {
    const MOVE: &str = r#"
INSERT INTO erc721_transfers (
    ethereum_tx_hash, log_index, block_number, token_address, from_address,
    to_address, token_id
)
SELECT ethereum_tx_hash, log_index, block_number, token_address, from_address,
    to_address, value
FROM erc20_transfers
WHERE token_address = $1
ON CONFLICT (ethereum_tx_hash, log_index) DO NOTHING;
    "#;
    const DELETE: &str = "DELETE FROM erc20_transfers WHERE token_address = $1;";
    ex.execute(sqlx::query(MOVE).bind(token_address)).await?;
    let result = ex.execute(sqlx::query(DELETE).bind(token_address)).await?;
    Ok(result.rows_affected())
}

/// The inverse migration for tokens wrongly classified as ERC-721.
pub async fn erc721_to_erc20(
    ex: &mut PgTransaction<'_>,
    token_address: &Address,
) -> Result<u64, sqlx::Error> {
    const MOVE: &str = r#"
INSERT INTO erc20_transfers (
    ethereum_tx_hash, log_index, block_number, token_address, from_address,
    to_address, value
)
SELECT ethereum_tx_hash, log_index, block_number, token_address, from_address,
    to_address, token_id
FROM erc721_transfers
WHERE token_address = $1
ON CONFLICT (ethereum_tx_hash, log_index) DO NOTHING;
    "#;
    const DELETE: &str = "DELETE FROM erc721_transfers WHERE token_address = $1;";
    ex.execute(sqlx::query(MOVE).bind(token_address)).await?;
    let result = ex.execute(sqlx::query(DELETE).bind(token_address)).await?;
    Ok(result.rows_affected())
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
        let hash = ByteArray([0x40 + block_number as u8; 32]);
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

    #[tokio::test]
    #[ignore]
    async fn postgres_reclassification_roundtrip() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let tx_hash = insert_chain(&mut db, 1).await;
        let token = ByteArray([0x70; 20]);
        let transfer = Erc20Transfer {
            ethereum_tx_hash: tx_hash,
            log_index: 3,
            block_number: 1,
            token_address: token,
            from_address: ByteArray([1; 20]),
            to_address: ByteArray([2; 20]),
            value: BigDecimal::from(42),
        };
        insert_erc20(&mut db, &transfer).await.unwrap();

        assert_eq!(erc20_to_erc721(&mut db, &token).await.unwrap(), 1);
        let moved = erc721_for_address(&mut db, &transfer.to_address, 10)
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].token_id, BigDecimal::from(42));
        assert_eq!(moved[0].log_index, 3);
        assert!(
            erc20_for_address(&mut db, &transfer.to_address, 10)
                .await
                .unwrap()
                .is_empty()
        );

        // and back
        assert_eq!(erc721_to_erc20(&mut db, &token).await.unwrap(), 1);
        let back = erc20_for_address(&mut db, &transfer.to_address, 10)
            .await
            .unwrap();
        assert_eq!(back, vec![transfer]);
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_erc721_owned_by() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let owner = ByteArray([0xaa; 20]);
        let other = ByteArray([0xbb; 20]);
        let token = ByteArray([0x70; 20]);
        let tx_1 = insert_chain(&mut db, 1).await;
        let tx_2 = insert_chain(&mut db, 2).await;

        // id 1 in, id 2 in and out again
        for (tx_hash, log_index, block_number, from, to, id) in [
            (tx_1, 0, 1, other, owner, 1),
            (tx_1, 1, 1, other, owner, 2),
            (tx_2, 0, 2, owner, other, 2),
        ] {
            insert_erc721(
                &mut db,
                &Erc721Transfer {
                    ethereum_tx_hash: tx_hash,
                    log_index,
                    block_number,
                    token_address: token,
                    from_address: from,
                    to_address: to,
                    token_id: BigDecimal::from(id),
                },
            )
            .await
            .unwrap();
        }

        let owned = erc721_owned_by(&mut db, &owner, &token).await.unwrap();
        assert_eq!(owned, vec![BigDecimal::from(1)]);
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_erc20_balances() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let safe = ByteArray([0xaa; 20]);
        let other = ByteArray([0xbb; 20]);
        let token = ByteArray([0x70; 20]);
        let tx_hash = insert_chain(&mut db, 1).await;
        for (log_index, from, to, value) in
            [(0, other, safe, 100), (1, safe, other, 30), (2, other, safe, 5)]
        {
            insert_erc20(
                &mut db,
                &Erc20Transfer {
                    ethereum_tx_hash: tx_hash,
                    log_index,
                    block_number: 1,
                    token_address: token,
                    from_address: from,
                    to_address: to,
                    value: BigDecimal::from(value),
                },
            )
            .await
            .unwrap();
        }

        let balances = erc20_balances(&mut db, &safe).await.unwrap();
        assert_eq!(
            balances,
            vec![Erc20Balance {
                token_address: token,
                balance: BigDecimal::from(75),
            }]
        );
    }
}
