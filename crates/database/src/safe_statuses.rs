use {
    crate::{Address, PgTransaction, TransactionHash},
    sqlx::{Executor, PgConnection},
};

/// One immutable snapshot of a Safe's configuration, taken after applying a
/// state mutating decoded call. The snapshot is keyed by the call that
/// produced it.
#[derive(Clone, Debug, Default, Eq, PartialEq, sqlx::FromRow)]
pub struct SafeStatus {
    pub address: Address,
    pub ethereum_tx_hash: TransactionHash,
    pub trace_address: String,
    pub block_number: i64,
    pub nonce: i64,
    pub owners: Vec<Address>,
    pub threshold: i64,
    pub master_copy: Address,
    pub fallback_handler: Address,
    pub guard: Option<Address>,
    pub enabled_modules: Vec<Address>,
}

pub async fn insert(ex: &mut PgConnection, status: &SafeStatus) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO safe_statuses (
    address, ethereum_tx_hash, trace_address, block_number, nonce, owners,
    threshold, master_copy, fallback_handler, guard, enabled_modules
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (address, ethereum_tx_hash, trace_address) DO NOTHING;
    "#;
    ex.execute(
        sqlx::query(QUERY)
            .bind(status.address)
            .bind(status.ethereum_tx_hash)
            .bind(&status.trace_address)
            .bind(status.block_number)
            .bind(status.nonce)
            .bind(&status.owners)
            .bind(status.threshold)
            .bind(status.master_copy)
            .bind(status.fallback_handler)
            .bind(status.guard)
            .bind(&status.enabled_modules),
    )
    .await?;
    Ok(())
}

/// The most recent snapshot for a Safe, by replay order.
pub async fn last_for_safe(
    ex: &mut PgConnection,
    address: &Address,
) -> Result<Option<SafeStatus>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT address, ethereum_tx_hash, trace_address, block_number, nonce, owners,
    threshold, master_copy, fallback_handler, guard, enabled_modules
FROM safe_statuses
WHERE address = $1
ORDER BY nonce DESC, block_number DESC
LIMIT 1;
    "#;
    sqlx::query_as(QUERY).bind(address).fetch_optional(ex).await
}

/// A Safe's snapshot series is corrupted when the nonces 0..=max are not all
/// present. The count of distinct nonces must cover the full range.
pub async fn is_corrupted(ex: &mut PgConnection, address: &Address) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
SELECT COALESCE(MAX(nonce) + 1 > COUNT(DISTINCT nonce), false)
FROM safe_statuses
WHERE address = $1;
    "#;
    sqlx::query_scalar(QUERY).bind(address).fetch_one(ex).await
}

/// First block that touched the Safe; reindexing starts here.
pub async fn earliest_block_for_safe(
    ex: &mut PgConnection,
    address: &Address,
) -> Result<Option<i64>, sqlx::Error> {
    const QUERY: &str = "SELECT MIN(block_number) FROM safe_statuses WHERE address = $1;";
    sqlx::query_scalar(QUERY).bind(address).fetch_one(ex).await
}

/// Drops all snapshots of a Safe. Part of reindexing.
pub async fn delete_for_safe(
    ex: &mut PgTransaction<'_>,
    address: &Address,
) -> Result<u64, sqlx::Error> {
    const QUERY: &str = "DELETE FROM safe_statuses WHERE address = $1;";
    let result = sqlx::query(QUERY).bind(address).execute(&mut **ex).await?;
    Ok(result.rows_affected())
}

/// Drops snapshots produced by calls at `block_number >= from_block` for all
/// Safes. Used by the reorg rewind; affected Safes are re-replayed after.
pub async fn delete_from_block(
    ex: &mut PgTransaction<'_>,
    from_block: i64,
) -> Result<Vec<Address>, sqlx::Error> {
    const QUERY: &str = r#"
DELETE FROM safe_statuses
WHERE block_number >= $1
RETURNING address;
    "#;
    let mut addresses: Vec<Address> = sqlx::query_scalar(QUERY)
        .bind(from_block)
        .fetch_all(&mut **ex)
        .await?;
    addresses.sort();
    addresses.dedup();
    Ok(addresses)
}

pub mod last {
    use super::*;

    /// Exactly one row per known Safe, mirroring the latest snapshot.
    pub async fn upsert(ex: &mut PgConnection, status: &SafeStatus) -> Result<(), sqlx::Error> {
        const QUERY: &str = r#"
INSERT INTO safe_last_statuses (
    address, ethereum_tx_hash, trace_address, block_number, nonce, owners,
    threshold, master_copy, fallback_handler, guard, enabled_modules
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (address) DO UPDATE
SET ethereum_tx_hash = EXCLUDED.ethereum_tx_hash,
    trace_address = EXCLUDED.trace_address,
    block_number = EXCLUDED.block_number,
    nonce = EXCLUDED.nonce,
    owners = EXCLUDED.owners,
    threshold = EXCLUDED.threshold,
    master_copy = EXCLUDED.master_copy,
    fallback_handler = EXCLUDED.fallback_handler,
    guard = EXCLUDED.guard,
    enabled_modules = EXCLUDED.enabled_modules;
        "#;
        ex.execute(
            sqlx::query(QUERY)
                .bind(status.address)
                .bind(status.ethereum_tx_hash)
                .bind(&status.trace_address)
                .bind(status.block_number)
                .bind(status.nonce)
                .bind(&status.owners)
                .bind(status.threshold)
                .bind(status.master_copy)
                .bind(status.fallback_handler)
                .bind(status.guard)
                .bind(&status.enabled_modules),
        )
        .await?;
        Ok(())
    }

    pub async fn get(
        ex: &mut PgConnection,
        address: &Address,
    ) -> Result<Option<SafeStatus>, sqlx::Error> {
        const QUERY: &str = r#"
SELECT address, ethereum_tx_hash, trace_address, block_number, nonce, owners,
    threshold, master_copy, fallback_handler, guard, enabled_modules
FROM safe_last_statuses
WHERE address = $1;
        "#;
        sqlx::query_as(QUERY).bind(address).fetch_optional(ex).await
    }

    /// The last status, regenerated from the snapshot series when the row is
    /// missing (e.g. after a reorg rewind dropped it).
    pub async fn get_or_generate(
        ex: &mut PgConnection,
        address: &Address,
    ) -> Result<Option<SafeStatus>, sqlx::Error> {
        if let Some(status) = get(ex, address).await? {
            return Ok(Some(status));
        }
        let Some(status) = last_for_safe(ex, address).await? else {
            return Ok(None);
        };
        upsert(ex, &status).await?;
        Ok(Some(status))
    }

    /// Safes that currently list `owner`.
    pub async fn addresses_for_owner(
        ex: &mut PgConnection,
        owner: &Address,
    ) -> Result<Vec<Address>, sqlx::Error> {
        const QUERY: &str = r#"
SELECT address
FROM safe_last_statuses
WHERE $1 = ANY(owners);
        "#;
        sqlx::query_scalar(QUERY).bind(owner).fetch_all(ex).await
    }

    /// Safes that currently have `module` enabled.
    pub async fn addresses_for_module(
        ex: &mut PgConnection,
        module: &Address,
    ) -> Result<Vec<Address>, sqlx::Error> {
        const QUERY: &str = r#"
SELECT address
FROM safe_last_statuses
WHERE $1 = ANY(enabled_modules);
        "#;
        sqlx::query_scalar(QUERY).bind(module).fetch_all(ex).await
    }

    pub async fn delete(
        ex: &mut PgConnection,
        address: &Address,
    ) -> Result<(), sqlx::Error> {
        const QUERY: &str = "DELETE FROM safe_last_statuses WHERE address = $1;";
        ex.execute(sqlx::query(QUERY).bind(address)).await?;
        Ok(())
    }

    pub async fn delete_many(
        ex: &mut PgTransaction<'_>,
        addresses: &[Address],
    ) -> Result<(), sqlx::Error> {
        const QUERY: &str = "DELETE FROM safe_last_statuses WHERE address = ANY($1);";
        sqlx::query(QUERY).bind(addresses).execute(&mut **ex).await?;
        Ok(())
    }
}
