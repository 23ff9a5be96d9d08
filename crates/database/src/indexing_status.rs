use sqlx::{Executor, PgConnection};

/// The singleton cursors that are not tied to a single contract address.
/// Stored as one row per kind, keyed by the integer value of this enum.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::EnumIter)]
#[repr(i32)]
pub enum IndexerKind {
    Erc20_721Events = 0,
    MasterCopies = 1,
    ProxyFactories = 2,
}

/// Everything up to and including the returned block has been indexed.
pub async fn get(ex: &mut PgConnection, kind: IndexerKind) -> Result<i64, sqlx::Error> {
    const QUERY: &str = r#"
SELECT block_number
FROM indexing_status
WHERE indexing_type = $1;
    "#;
    Ok(sqlx::query_scalar(QUERY)
        .bind(kind as i32)
        .fetch_optional(ex)
        .await?
        .unwrap_or(0))
}

/// Unconditional set, used by the reorg rewind.
pub async fn set(
    ex: &mut PgConnection,
    kind: IndexerKind,
    block_number: i64,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO indexing_status (indexing_type, block_number)
VALUES ($1, $2)
ON CONFLICT (indexing_type) DO UPDATE SET block_number = EXCLUDED.block_number;
    "#;
    ex.execute(sqlx::query(QUERY).bind(kind as i32).bind(block_number))
        .await?;
    Ok(())
}

/// Compare-and-set used by indexers: only advances if the stored cursor
/// still matches `from_block_number`, so concurrent instances cannot tear
/// each other's progress. Returns whether the cursor moved.
pub async fn advance(
    ex: &mut PgConnection,
    kind: IndexerKind,
    from_block_number: i64,
    to_block_number: i64,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE indexing_status
SET block_number = $3
WHERE indexing_type = $1 AND block_number = $2;
    "#;
    let result = sqlx::query(QUERY)
        .bind(kind as i32)
        .bind(from_block_number)
        .bind(to_block_number)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}
