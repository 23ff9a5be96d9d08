use {
    crate::{PgTransaction, TransactionHash},
    chrono::{DateTime, Utc},
    sqlx::{Executor, PgConnection},
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct Block {
    pub number: i64,
    pub block_hash: TransactionHash,
    pub parent_hash: TransactionHash,
    pub timestamp: DateTime<Utc>,
    pub confirmed: bool,
}

/// Idempotent on block number. A changed hash for an already stored number is
/// a reorg and must go through [`delete_from`] first; the insert keeps the
/// stored row in that case.
pub async fn insert(ex: &mut PgConnection, block: &Block) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO blocks (number, block_hash, parent_hash, timestamp, confirmed)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (number) DO NOTHING;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(block.number)
            .bind(block.block_hash)
            .bind(block.parent_hash)
            .bind(block.timestamp)
            .bind(block.confirmed),
    )
    .await?;
    Ok(())
}

pub async fn get(ex: &mut PgConnection, number: i64) -> Result<Option<Block>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT number, block_hash, parent_hash, timestamp, confirmed
FROM blocks
WHERE number = $1;
    "#;
    sqlx::query_as(QUERY).bind(number).fetch_optional(ex).await
}

pub async fn last_block_number(ex: &mut PgConnection) -> Result<Option<i64>, sqlx::Error> {
    const QUERY: &str = "SELECT MAX(number) FROM blocks;";
    sqlx::query_scalar(QUERY).fetch_one(ex).await
}

/// Blocks that are not yet `confirmed`, oldest first. The reorg controller
/// compares these against the canonical chain.
pub async fn unconfirmed(ex: &mut PgConnection, limit: i64) -> Result<Vec<Block>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT number, block_hash, parent_hash, timestamp, confirmed
FROM blocks
WHERE NOT confirmed
ORDER BY number ASC
LIMIT $1;
    "#;
    sqlx::query_as(QUERY).bind(limit).fetch_all(ex).await
}

/// Marks every block at depth `reorg_depth` or more below `current_block` as
/// confirmed. Confirmed blocks are skipped on later reorg passes.
pub async fn confirm_up_to(
    ex: &mut PgConnection,
    current_block: i64,
    reorg_depth: i64,
) -> Result<u64, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE blocks
SET confirmed = true
WHERE NOT confirmed AND number <= $1;
    "#;
    let result = sqlx::query(QUERY)
        .bind(current_block - reorg_depth)
        .execute(ex)
        .await?;
    Ok(result.rows_affected())
}

/// Deletes all blocks with `number >= from_number`. Owned rows (transactions,
/// traces, transfers) go away through `ON DELETE CASCADE`.
pub async fn delete_from(
    ex: &mut PgTransaction<'_>,
    from_number: i64,
) -> Result<u64, sqlx::Error> {
    const QUERY: &str = "DELETE FROM blocks WHERE number >= $1;";
    let result = sqlx::query(QUERY).bind(from_number).execute(&mut **ex).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::byte_array::ByteArray, sqlx::Connection};

    fn block(number: i64, tag: u8) -> Block {
        Block {
            number,
            block_hash: ByteArray([tag; 32]),
            parent_hash: ByteArray([tag.wrapping_sub(1); 32]),
            timestamp: DateTime::<Utc>::MIN_UTC,
            confirmed: false,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_blocks_roundtrip() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        assert_eq!(last_block_number(&mut db).await.unwrap(), None);

        let block_ = block(1, 1);
        insert(&mut db, &block_).await.unwrap();
        assert_eq!(get(&mut db, 1).await.unwrap(), Some(block_));
        assert_eq!(last_block_number(&mut db).await.unwrap(), Some(1));

        // repeated insert with a different hash keeps the original
        insert(&mut db, &block(1, 7)).await.unwrap();
        assert_eq!(get(&mut db, 1).await.unwrap(), Some(block_));
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_confirm_and_delete() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        for number in 0..10 {
            insert(&mut db, &block(number, number as u8)).await.unwrap();
        }

        // head 9, depth 3: blocks 0..=6 become confirmed
        assert_eq!(confirm_up_to(&mut db, 9, 3).await.unwrap(), 7);
        let unconfirmed_ = unconfirmed(&mut db, 100).await.unwrap();
        assert_eq!(
            unconfirmed_.iter().map(|b| b.number).collect::<Vec<_>>(),
            vec![7, 8, 9]
        );

        assert_eq!(delete_from(&mut db, 8).await.unwrap(), 2);
        assert_eq!(last_block_number(&mut db).await.unwrap(), Some(7));
    }
}
